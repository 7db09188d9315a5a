use crate::{AppManError, Result};
use crate::core::config::NetworkConfig;
use reqwest::{Client, ClientBuilder, Response};
use std::time::Duration;
use tracing::debug;

/// Shared HTTP client for version discovery and downloads
///
/// `timeout` is never applied to a whole download body, only to the wait for
/// the next read.
#[derive(Clone)]
pub struct WebClient {
    client: Client,
    timeout: Duration,
}

impl WebClient {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let client = Self::create_client(config)?;
        Ok(Self {
            client,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn create_client(config: &NetworkConfig) -> Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| AppManError::Config(format!("Failed to create HTTP client: {}", e)))
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET a page and return its body as text
    pub async fn get_text(&self, url: &str) -> Result<String> {
        debug!(url, "GET text");
        let request = self.client.get(url).timeout(self.timeout);
        let response = self.send_checked(url, request).await?;
        response.text().await.map_err(|e| transfer_error(url, &e))
    }

    /// Send `request`, waiting at most `timeout` for the response head
    pub(crate) async fn send_checked(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Response> {
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| AppManError::Transfer {
                url: url.to_string(),
                reason: "request timed out".to_string(),
            })?
            .map_err(|e| transfer_error(url, &e))?;
        debug!(url, status = %response.status(), "response received");

        if !response.status().is_success() {
            return Err(AppManError::Transfer {
                url: url.to_string(),
                reason: format!("server answered {}", response.status()),
            });
        }

        Ok(response)
    }
}

pub(crate) fn transfer_error(url: &str, err: &reqwest::Error) -> AppManError {
    let reason = if err.is_timeout() {
        "request timed out".to_string()
    } else {
        err.to_string()
    };
    AppManError::Transfer {
        url: url.to_string(),
        reason,
    }
}
