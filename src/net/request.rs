use crate::{AppManError, Result};
use bytes::Bytes;
use reqwest::Url;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// HTTP methods allowed for downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl FromStr for Method {
    type Err = AppManError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "get" => Ok(Method::Get),
            "post" => Ok(Method::Post),
            other => Err(AppManError::invalid(
                "method",
                format!("\"{}\" is not one of GET, POST", other),
            )),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

/// Data sent in the query string
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    Map(BTreeMap<String, String>),
    Text(String),
    Bytes(Bytes),
}

impl QueryData {
    /// Accepts an object, a string or an array of bytes.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), scalar_to_string("query", v)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(QueryData::Map),
            Value::String(s) => Ok(QueryData::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or_else(|| AppManError::invalid("query", "byte arrays may only hold values 0-255"))
                })
                .collect::<Result<Vec<u8>>>()
                .map(|raw| QueryData::Bytes(Bytes::from(raw))),
            other => Err(AppManError::invalid(
                "query",
                format!("expected a map, a string or bytes, found {}", value_kind(other)),
            )),
        }
    }

    fn apply(&self, url: &mut Url) {
        match self {
            QueryData::Map(map) => {
                let mut pairs = url.query_pairs_mut();
                for (k, v) in map {
                    pairs.append_pair(k, v);
                }
            }
            QueryData::Text(text) => append_query(url, text),
            QueryData::Bytes(bytes) => append_query(url, &escape_query_bytes(bytes)),
        }
    }
}

/// Join `extra` to whatever query `url` already carries
fn append_query(url: &mut Url, extra: &str) {
    if extra.is_empty() {
        return;
    }
    let joined = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, extra),
        _ => extra.to_string(),
    };
    url.set_query(Some(&joined));
}

/// Raw query bytes as text: printable ASCII is kept, everything else is
/// percent-encoded byte by byte
fn escape_query_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if b.is_ascii_graphic() && b != b'#' && b != b'%' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Form data sent in the request body
#[derive(Debug, Clone, PartialEq)]
pub enum BodyData {
    /// Ordered key/value pairs, sent in the given order
    Pairs(Vec<(String, String)>),
    Map(BTreeMap<String, String>),
}

impl BodyData {
    /// Accepts an object or an array whose every element is a 2-element array.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), scalar_to_string("body", v)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(BodyData::Map),
            Value::Array(items) => items
                .iter()
                .map(|item| match item.as_array().map(Vec::as_slice) {
                    Some([k, v]) => Ok((scalar_to_string("body", k)?, scalar_to_string("body", v)?)),
                    _ => Err(AppManError::invalid(
                        "body",
                        "every element of a body sequence must be a 2-element pair",
                    )),
                })
                .collect::<Result<Vec<_>>>()
                .map(BodyData::Pairs),
            other => Err(AppManError::invalid(
                "body",
                format!("expected a map or a sequence of pairs, found {}", value_kind(other)),
            )),
        }
    }

    pub fn pairs(&self) -> Vec<(&str, &str)> {
        match self {
            BodyData::Pairs(pairs) => pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
            BodyData::Map(map) => map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
        }
    }
}

fn scalar_to_string(field: &'static str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(AppManError::invalid(
            field,
            format!("values must be scalars, found {}", value_kind(other)),
        )),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}

/// A validated description of one file fetch.
///
/// Fields are fixed once [`DownloadRequestBuilder::build`] succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    path: PathBuf,
    method: Method,
    url: Url,
    query: Option<QueryData>,
    body: Option<BodyData>,
    can_fail: bool,
}

impl DownloadRequest {
    pub fn builder(
        method: &str,
        path: impl Into<PathBuf>,
        url: &str,
    ) -> DownloadRequestBuilder {
        DownloadRequestBuilder {
            method: method.to_string(),
            path: path.into(),
            url: url.to_string(),
            query: None,
            body: None,
            can_fail: false,
        }
    }

    /// Shortcut for a plain GET request
    pub fn get(path: impl Into<PathBuf>, url: &str) -> Result<Self> {
        Self::builder("get", path, url).build()
    }

    /// Shortcut for a POST request with form data
    pub fn post(path: impl Into<PathBuf>, url: &str, body: BodyData) -> Result<Self> {
        Self::builder("post", path, url).body(body).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn query(&self) -> Option<&QueryData> {
        self.query.as_ref()
    }

    pub fn body(&self) -> Option<&BodyData> {
        self.body.as_ref()
    }

    pub fn can_fail(&self) -> bool {
        self.can_fail
    }

    /// The URL actually requested, with query data applied
    pub fn effective_url(&self) -> Url {
        let mut url = self.url.clone();
        if let Some(query) = &self.query {
            query.apply(&mut url);
        }
        url
    }

    /// File name shown to the user while downloading
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

impl fmt::Display for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.method, self.url, self.path.display())
    }
}

pub struct DownloadRequestBuilder {
    method: String,
    path: PathBuf,
    url: String,
    query: Option<std::result::Result<QueryData, AppManError>>,
    body: Option<std::result::Result<BodyData, AppManError>>,
    can_fail: bool,
}

impl DownloadRequestBuilder {
    pub fn query(mut self, query: QueryData) -> Self {
        self.query = Some(Ok(query));
        self
    }

    pub fn query_value(mut self, value: &Value) -> Self {
        self.query = Some(QueryData::from_value(value));
        self
    }

    pub fn body(mut self, body: BodyData) -> Self {
        self.body = Some(Ok(body));
        self
    }

    pub fn body_value(mut self, value: &Value) -> Self {
        self.body = Some(BodyData::from_value(value));
        self
    }

    pub fn can_fail(mut self, can_fail: bool) -> Self {
        self.can_fail = can_fail;
        self
    }

    /// Validate every field; the first offending one is named in the error.
    pub fn build(self) -> Result<DownloadRequest> {
        let method: Method = self.method.parse()?;

        if self.path.as_os_str().is_empty() {
            return Err(AppManError::invalid("path", "destination path is empty"));
        }

        let url = Url::parse(&self.url)
            .map_err(|e| AppManError::invalid("url", format!("\"{}\": {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().map_or(true, str::is_empty) {
            return Err(AppManError::invalid(
                "url",
                format!("\"{}\" is not an absolute http(s) URL", self.url),
            ));
        }

        let query = self.query.transpose()?;
        let body = self.body.transpose()?;

        Ok(DownloadRequest {
            path: self.path,
            method,
            url,
            query,
            body,
            can_fail: self.can_fail,
        })
    }
}
