//! Local dispatcher
//!
//! Replays a tunneled request against the private service and packs the
//! outcome into an `http_response`. Every failure becomes a well-formed
//! error response; nothing here can end the session.

use backhaul_proto::{is_hop_by_hop, Body, HeaderMap, HttpRequestData, HttpResponseData, LocalTarget};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default timeout for calls to the local service
pub const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Local request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Forwards requests to one local target
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    client: reqwest::Client,
    target: LocalTarget,
}

impl LocalDispatcher {
    pub fn new(target: LocalTarget, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client, target })
    }

    pub fn target(&self) -> &LocalTarget {
        &self.target
    }

    /// URL of `request` on the local target
    pub fn local_url(&self, request: &HttpRequestData) -> String {
        let path = request.path_and_query();
        let sep = if path.starts_with('/') { "" } else { "/" };
        format!("http://{}{}{}", self.target, sep, path)
    }

    /// Perform the local call. Never fails: errors are reported in the
    /// response's `error` field with status 500.
    pub async fn dispatch(&self, request: &HttpRequestData) -> HttpResponseData {
        match self.try_dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    method = %request.method,
                    path = %request.url,
                    "Local dispatch failed: {}",
                    e
                );
                HttpResponseData::error_response(e.to_string())
            }
        }
    }

    async fn try_dispatch(&self, request: &HttpRequestData) -> Result<HttpResponseData, DispatchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| DispatchError::InvalidMethod(request.method.clone()))?;
        let body = Body::decode(&request.body, request.body_encoding)
            .map_err(|e| DispatchError::InvalidBody(e.to_string()))?;
        let url = self.local_url(request);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if skip_request_header(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status_code = response.status().as_u16();

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }

        let bytes = response.bytes().await?;
        debug!(status = status_code, url = %url, bytes = bytes.len(), "Local response");

        let mut result = HttpResponseData::new(status_code).with_body(&bytes);
        result.headers = headers;
        Ok(result)
    }
}

fn skip_request_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") || is_hop_by_hop(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_url() {
        let dispatcher =
            LocalDispatcher::new(LocalTarget::new("127.0.0.1", 8080), DEFAULT_LOCAL_TIMEOUT).unwrap();

        let req = HttpRequestData::new("GET", "/status").with_query("x=1");
        assert_eq!(dispatcher.local_url(&req), "http://127.0.0.1:8080/status?x=1");

        let req = HttpRequestData::new("GET", "");
        assert_eq!(dispatcher.local_url(&req), "http://127.0.0.1:8080/");
    }

    #[test]
    fn test_skipped_headers() {
        assert!(skip_request_header("Host"));
        assert!(skip_request_header("content-length"));
        assert!(skip_request_header("Connection"));
        assert!(!skip_request_header("Authorization"));
    }

    #[tokio::test]
    async fn test_invalid_method_becomes_error_response() {
        let dispatcher = LocalDispatcher::new(LocalTarget::default(), DEFAULT_LOCAL_TIMEOUT).unwrap();

        let response = dispatcher
            .dispatch(&HttpRequestData::new("BAD METHOD", "/"))
            .await;

        assert_eq!(response.status_code, 500);
        assert!(response.error.unwrap().contains("Invalid method"));
    }
}
