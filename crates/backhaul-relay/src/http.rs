//! Public HTTP surface of the relay
//!
//! `/health` and `/clients` are answered locally; every other request is
//! forwarded through a tunnel.

use axum::body::{to_bytes, Body as AxumBody};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use backhaul_control::{ForwardError, RequestCorrelator, SessionInfo, SessionRegistry};
use backhaul_proto::{is_hop_by_hop, Body, HttpRequestData, HttpResponseData};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Largest public request body accepted
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub correlator: RequestCorrelator,
    pub registry: Arc<SessionRegistry>,
    pub started_at: Instant,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/clients", get(clients))
        .fallback(forward)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    clients: usize,
    /// Seconds since the relay started
    uptime: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        clients: state.registry.count(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}

async fn clients(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list())
}

async fn forward(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match to_bytes(body, MAX_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return (StatusCode::BAD_REQUEST, format!("Failed to read request body: {}", e))
                .into_response();
        }
    };

    let mut data = HttpRequestData::new(parts.method.as_str(), parts.uri.path())
        .with_query(parts.uri.query().unwrap_or_default())
        .with_body(&bytes);
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            data.headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    debug!(method = %parts.method, path = %parts.uri.path(), "Forwarding public request");

    match state.correlator.forward_any(data, None).await {
        Ok(response) => into_http_response(response),
        Err(ForwardError::NoSessionsAvailable) => {
            (StatusCode::SERVICE_UNAVAILABLE, "No tunnel client connected").into_response()
        }
        Err(ForwardError::LocalDispatch(error)) => (StatusCode::BAD_GATEWAY, error).into_response(),
        Err(ForwardError::RequestTimeout(_)) => {
            (StatusCode::GATEWAY_TIMEOUT, "Request timed out").into_response()
        }
        Err(e @ ForwardError::DeliveryFailed(_)) => {
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

/// Rebuild the agent's result as a response; framing headers are regenerated
fn into_http_response(response: HttpResponseData) -> Response {
    let body = match Body::decode(&response.body, response.body_encoding) {
        Ok(body) => body,
        Err(e) => {
            warn!("Agent sent an undecodable body: {}", e);
            return (StatusCode::BAD_GATEWAY, "Invalid response body from tunnel client")
                .into_response();
        }
    };

    let Ok(status) = StatusCode::from_u16(response.status_code) else {
        warn!(status = response.status_code, "Agent sent an invalid status code");
        return (StatusCode::BAD_GATEWAY, "Invalid status code from tunnel client").into_response();
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!(header = %name, "Skipping invalid response header"),
        }
    }

    builder
        .body(AxumBody::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_headers_and_body() {
        let agent_response = HttpResponseData::new(201)
            .with_header("X-Reply", "b")
            .with_header("Content-Length", "999")
            .with_header("Transfer-Encoding", "chunked")
            .with_body(b"created");

        let response = into_http_response(agent_response);

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-reply").unwrap(), "b");
        assert!(response.headers().get("transfer-encoding").is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"created");
    }

    #[tokio::test]
    async fn test_binary_body_restored() {
        let bytes = vec![0u8, 159, 146, 150, 255];
        let response = into_http_response(HttpResponseData::new(200).with_body(&bytes));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.to_vec(), bytes);
    }

    #[test]
    fn test_invalid_status_is_bad_gateway() {
        let response = into_http_response(HttpResponseData::new(1000));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
