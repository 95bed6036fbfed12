//! Minimal HTTP request/response model shared by the object store drivers.
//!
//! Drivers build [`HttpRequest`]s with already encoded paths and hand them to an
//! [`HttpTransport`]. Production uses [`ReqwestTransport`]; tests plug in in-process mocks.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use tidepool_io::{StorageError, StorageResult};
use tracing::{debug, trace};

/// Encode a query or path component (RFC 3986 unreserved characters pass through).
pub fn uri_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Encode every segment of a path, keeping the separators.
pub fn uri_encode_path(path: &str) -> String {
    path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// One HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Encoded path starting with '/'.
    pub path: String,
    /// Unencoded query parameters.
    pub query: Vec<(String, String)>,
    /// Header names are lowercase.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Bytes,
}

impl HttpRequest {
    /// Request without query, headers or body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add or replace a header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Add or replace a header in place.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Header value by (case-insensitive) name.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Query string with keys sorted and both keys and values encoded.
    pub fn query_string(&self) -> String {
        let mut pairs: Vec<(String, String)> = self
            .query
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Response body, either buffered or still streaming from the network.
#[derive(Debug)]
pub enum HttpBody {
    /// Fully buffered content; taken by the first `chunk` call.
    Full(Option<Bytes>),
    /// Streaming network response.
    Stream(reqwest::Response),
}

impl HttpBody {
    /// Buffered body.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        HttpBody::Full(Some(bytes.into()))
    }

    /// Next piece of the body; None at the end.
    pub async fn chunk(&mut self) -> StorageResult<Option<Bytes>> {
        match self {
            HttpBody::Full(bytes) => Ok(bytes.take().filter(|b| !b.is_empty())),
            HttpBody::Stream(response) => response.chunk().await.map_err(|e| {
                StorageError::ReadFailed(format!("unable to read response body: {}", e))
            }),
        }
    }

    /// The whole remaining body.
    pub async fn bytes(mut self) -> StorageResult<Bytes> {
        let mut result = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            result.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(result))
    }
}

/// One HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header names are lowercase.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: HttpBody,
}

impl HttpResponse {
    /// Response with a buffered body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: HttpBody::full(body),
        }
    }

    /// Add a header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    /// Header value by (case-insensitive) name.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// True for 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-success response into an error: 404 is a missing target, 401/403 is denied,
    /// everything else is a service error carrying the body.
    pub async fn into_error(self, context: &str) -> StorageError {
        let status = self.status;
        let body = match self.body.bytes().await {
            Ok(body) => String::from_utf8_lossy(&body).into_owned(),
            Err(e) => e.to_string(),
        };
        let message = if body.is_empty() {
            format!("{}: HTTP {}", context, status)
        } else {
            format!("{}: HTTP {}: {}", context, status, body.trim())
        };
        match status {
            404 => StorageError::MissingTarget(message),
            401 | 403 => StorageError::PermissionDenied(message),
            _ => StorageError::Service(message),
        }
    }
}

/// Sends requests to one service endpoint.
#[async_trait]
pub trait HttpTransport: Send + Sync + std::fmt::Debug {
    /// Send one request and return the response, whatever its status.
    async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse>;
}

/// Transport over a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Transport for `base_url` (scheme, host and optional port, no trailing slash).
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> StorageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Config(format!("unable to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse> {
        let query = request.query_string();
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, request.path)
        } else {
            format!("{}{}?{}", self.base_url, request.path, query)
        };
        trace!(method = %request.method, url = %url, "http request");

        let mut builder = self.client.request(request.method.clone(), &url);
        for (name, value) in &request.headers {
            // derived from the url by the client
            if name != "host" {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        let response = builder.body(request.body).send().await.map_err(|e| {
            StorageError::Service(format!(
                "unable to send {} request to '{}': {}",
                request.method, url, e
            ))
        })?;

        let status = response.status().as_u16();
        debug!(method = %request.method, path = %request.path, status, "http response");
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok(HttpResponse {
            status,
            headers,
            body: HttpBody::Stream(response),
        })
    }
}
