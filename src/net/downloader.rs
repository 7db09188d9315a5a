use crate::{AppManError, Result};
use crate::net::client::{transfer_error, WebClient};
use crate::net::request::{DownloadRequest, Method};
use crate::utils::progress::{ProgressSink, TransferProgress};
use futures::TryStreamExt;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Streams download requests to disk, strictly one after the other
pub struct Downloader {
    client: WebClient,
    chunk_size: usize,
}

impl Downloader {
    pub fn new(client: WebClient, chunk_size: usize) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Fetch every request in order. The first failure that is not allowed
    /// to fail stops the sequence; files already written stay on disk.
    pub async fn fetch_all(
        &self,
        requests: &[DownloadRequest],
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        for request in requests {
            match self.fetch(request, sink).await {
                Ok(bytes) => debug!(url = %request.url(), bytes, "download done"),
                Err(e) if request.can_fail() => {
                    warn!(url = %request.url(), error = %e, "optional download failed");
                    if fs::metadata(request.path()).await.is_ok() {
                        let _ = fs::remove_file(request.path()).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Fetch a single request, returning the number of bytes written
    pub async fn fetch(&self, request: &DownloadRequest, sink: &mut dyn ProgressSink) -> Result<u64> {
        let url = request.effective_url();
        let url_str = url.to_string();
        debug!(request = %request, "init download");

        let mut builder = match request.method() {
            Method::Get => self.client.inner().get(url),
            Method::Post => self.client.inner().post(url),
        };
        if let Some(body) = request.body() {
            builder = builder.form(&body.pairs());
        }

        let response = self.client.send_checked(&url_str, builder).await?;

        // Servers that omit the size (or report zero) get a spinner
        let total = response.content_length().filter(|size| *size > 0);
        match total {
            Some(size) => debug!(size, "file size"),
            None => debug!("file size not provided"),
        }

        if let Some(parent) = request.path().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_transfer_error(&url_str, e))?;
            }
        }
        let mut file = fs::File::create(request.path())
            .await
            .map_err(|e| io_transfer_error(&url_str, e))?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = Box::pin(StreamReader::new(stream));

        sink.start(&request.file_name(), total);
        let idle = self.client.timeout();
        match copy_chunked(&mut reader, &mut file, total, self.chunk_size, idle, sink).await {
            Ok(progress) => {
                sink.finish(&progress);
                Ok(progress.transferred)
            }
            Err(e) => {
                sink.abandon("failed");
                Err(io_transfer_error(&url_str, e))
            }
        }
    }
}

fn io_transfer_error(url: &str, err: std::io::Error) -> AppManError {
    // Errors coming out of the body stream wrap the original reqwest error
    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<reqwest::Error>()) {
        return transfer_error(url, inner);
    }
    AppManError::Transfer {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

/// Copy `reader` into `writer` in chunks of exactly `chunk_size` bytes (the
/// last one may be shorter), reporting once per chunk written. A read that
/// yields nothing for `idle` fails with `TimedOut`.
pub(crate) async fn copy_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: Option<u64>,
    chunk_size: usize,
    idle: Duration,
    sink: &mut dyn ProgressSink,
) -> std::io::Result<TransferProgress>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let started = Instant::now();
    let mut last_chunk = started;
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut progress = TransferProgress {
        transferred: 0,
        total,
        elapsed: Duration::ZERO,
        rate: 0.0,
    };

    loop {
        let mut filled = 0;
        while filled < buffer.len() {
            let n = timeout(idle, reader.read(&mut buffer[filled..]))
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no data received for {}s", idle.as_secs_f64()),
                    )
                })??;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        writer.write_all(&buffer[..filled]).await?;

        let now = Instant::now();
        let since_last = now.duration_since(last_chunk).as_secs_f64();
        last_chunk = now;

        progress.transferred += filled as u64;
        progress.elapsed = now.duration_since(started);
        if since_last > 0.0 {
            progress.rate = filled as f64 / since_last;
        }
        sink.advance(&progress);

        if filled < buffer.len() {
            break;
        }
    }

    writer.flush().await?;
    Ok(progress)
}
