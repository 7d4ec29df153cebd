//! HTTP transport abstraction
//!
//! Stores never talk to the network directly: every request goes through an
//! [`HttpTransport`], which can be swapped for an in-memory emulator in tests
//! or a custom client in production.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use persistence_core::{Error, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use url::Url;

/// Connection timeout for the default transport
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An outgoing storage request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Set a header; `name` must be lowercase
    pub fn set_header(&mut self, name: &'static str, value: &str) -> Result<()> {
        let value = HeaderValue::from_str(value).map_err(|e| Error::InvalidArgument {
            message: format!("invalid value for header {}: {}", name, e),
        })?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(())
    }

    /// Builder-style [`set_header`](Self::set_header)
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        self.set_header(name, value)?;
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Header value as a string, empty when absent or not valid UTF-8
    pub fn header_str(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// First value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

/// A response received from the storage service
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Async transport used by the stores to reach the storage service
///
/// Implementations return [`Error::Transport`] when no response could be
/// obtained; any HTTP response, including error statuses, is returned as
/// `Ok` and interpreted by the caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and read the full response body
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Release pooled connections
    async fn close(&self) {}
}

/// Default transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    /// Wrap an existing client, e.g. one with proxy or TLS settings
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_builder() {
        Error::InvalidArgument {
            message: format!("Failed to build request: {}", e),
        }
    } else {
        Error::Transport {
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HttpRequest {
        let url = Url::parse("https://acct.blob.core.windows.net/c/b?comp=lease&restype=x").unwrap();
        HttpRequest::new(Method::PUT, url)
    }

    #[test]
    fn test_headers() {
        let request = request()
            .with_header("x-ms-lease-action", "acquire")
            .unwrap();
        assert_eq!(request.header_str("x-ms-lease-action"), "acquire");
        assert_eq!(request.header_str("x-ms-lease-id"), "");
    }

    #[test]
    fn test_invalid_header_value() {
        let result = request().with_header("x-ms-lease-id", "bad\nvalue");
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_query_param() {
        let request = request();
        assert_eq!(request.query_param("comp").as_deref(), Some("lease"));
        assert_eq!(request.query_param("missing"), None);
    }

    #[test]
    fn test_default_transport_builds() {
        assert!(ReqwestTransport::new().is_ok());
    }
}
