//! Fetch types and the network transport.
//!
//! Requests and responses as seen by the worker, the [`Transport`] seam the
//! worker uses for every network call, and the blocking `ureq` transport used
//! in production.

use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

use log::trace;
use serde::{Deserialize, Serialize};
use url::Url;

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Default for Method {
    fn default() -> Self {
        Self::Get
    }
}

impl Method {
    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }

    /// Whether the method changes server state.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(FetchError::UnsupportedMethod(String::from(s))),
        }
    }
}

/// Request mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Same-origin only
    SameOrigin,
    /// No CORS
    NoCors,
    /// CORS
    Cors,
    /// Full-page navigation
    Navigate,
}

impl Default for RequestMode {
    fn default() -> Self {
        Self::Cors
    }
}

fn header_value<'h>(headers: &'h [(String, String)], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Fetch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Absolute request URL
    pub url: Url,
    /// HTTP method
    pub method: Method,
    /// Request headers, in order
    pub headers: Vec<(String, String)>,
    /// Request body (if any)
    pub body: Option<Vec<u8>>,
    /// Request mode
    pub mode: RequestMode,
}

impl Request {
    /// Create a new request
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: Vec::new(),
            body: None,
            mode: RequestMode::Cors,
        }
    }

    /// A GET request
    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    /// Parse `url` and build a request
    pub fn parse(method: Method, url: &str) -> Result<Self, FetchError> {
        Ok(Self::new(method, Url::parse(url)?))
    }

    /// A full-page navigation
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// First header value with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Check if this is a navigation request
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Fetched from the network just now
    Network,
    /// Served from a cache bucket
    Cache,
    /// Built by the worker (offline fallbacks)
    Synthetic,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
            Self::Synthetic => "synthetic",
        }
    }
}

/// Fetch response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code
    pub status: u16,
    /// Status text
    pub status_text: String,
    /// Response headers, in order
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
    /// Origin of the response
    pub source: ResponseSource,
}

impl Response {
    /// Create a new response
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_text: String::from(status_text_for(status)),
            headers: Vec::new(),
            body: Vec::new(),
            source: ResponseSource::Network,
        }
    }

    /// Plain-text response built by the worker
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            source: ResponseSource::Synthetic,
            ..Self::new(status)
                .with_header("Content-Type", "text/plain")
                .with_body(body)
        }
    }

    /// JSON response built by the worker
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            source: ResponseSource::Synthetic,
            ..Self::new(status)
                .with_header("Content-Type", "application/json")
                .with_body(body.to_string())
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Check if response is OK
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 4xx: the request itself is wrong and resending it cannot help.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Get status text for status code
pub fn status_text_for(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

// ── Errors ───────────────────────────────────────────────────────────

/// A network call that produced no HTTP response at all.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure of an intercepted fetch, as seen by the caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The network call failed. `queued` tells whether a mutating request was
    /// durably queued for replay.
    #[error("network request failed (queued: {queued}): {source}")]
    Network {
        #[source]
        source: TransportError,
        queued: bool,
    },

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
}

impl FetchError {
    pub fn network(source: TransportError) -> Self {
        Self::Network {
            source,
            queued: false,
        }
    }

    /// Whether the request was saved for a later replay.
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Network { queued: true, .. })
    }
}

// ── Transport ────────────────────────────────────────────────────────

/// The network, as far as the worker is concerned.
///
/// Any HTTP status is an `Ok` response; `Err` means no response arrived.
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

/// Headers the HTTP client manages itself.
const CLIENT_MANAGED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

/// Blocking HTTP transport backed by a `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(0)
            .build();
        Self { agent }
    }

    fn convert(response: ureq::Response) -> Result<Response, TransportError> {
        let status = response.status();
        let status_text = String::from(response.status_text());
        let headers = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = response.header(&name).map(String::from);
                value.map(|value| (name, value))
            })
            .collect();

        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| TransportError::new(format!("reading response body: {e}")))?;

        Ok(Response {
            status,
            status_text,
            headers,
            body,
            source: ResponseSource::Network,
        })
    }
}

impl Transport for UreqTransport {
    fn send(&self, request: &Request) -> Result<Response, TransportError> {
        trace!("{} {}", request.method, request.url);
        let mut call = self
            .agent
            .request(request.method.as_str(), request.url.as_str());
        for (name, value) in &request.headers {
            if CLIENT_MANAGED_HEADERS
                .iter()
                .any(|managed| name.eq_ignore_ascii_case(managed))
            {
                continue;
            }
            call = call.set(name, value);
        }

        let result = match &request.body {
            Some(body) => call.send_bytes(body),
            None => call.call(),
        };

        match result {
            Ok(response) => Self::convert(response),
            // Non-2xx statuses are still responses.
            Err(ureq::Error::Status(_, response)) => Self::convert(response),
            Err(ureq::Error::Transport(transport)) => {
                Err(TransportError::new(transport.to_string()))
            }
        }
    }
}
