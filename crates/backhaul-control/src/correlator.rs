//! Request correlator
//!
//! Turns a public HTTP request into an `http_request` message on a session
//! and waits for the `http_response` carrying the same id.

use backhaul_proto::{HttpRequestData, HttpResponseData, TunnelMessage};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::pending_requests::PendingRequests;
use crate::registry::{RegistryError, Selection, SessionRegistry};
use crate::session::Session;

/// Default time to wait for an agent's response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForwardError {
    #[error("No tunnel client connected")]
    NoSessionsAvailable,

    /// The request never reached the agent, or the session died while waiting
    #[error("Failed to deliver request: {0}")]
    DeliveryFailed(String),

    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The agent could not complete the local call
    #[error("Local service error: {0}")]
    LocalDispatch(String),
}

impl From<RegistryError> for ForwardError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NoSessionsAvailable => ForwardError::NoSessionsAvailable,
            other => ForwardError::DeliveryFailed(other.to_string()),
        }
    }
}

/// Correlates requests and responses over agent sessions
#[derive(Debug, Clone)]
pub struct RequestCorrelator {
    registry: Arc<SessionRegistry>,
    pending: PendingRequests,
    default_timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            pending: PendingRequests::new(),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Forward to a round-robin selected session
    pub async fn forward_any(
        &self,
        request: HttpRequestData,
        timeout: Option<Duration>,
    ) -> Result<HttpResponseData, ForwardError> {
        let session = self.registry.select(&Selection::Any)?;
        self.forward(&session, request, timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// Send `request` on `session` and wait for its response.
    ///
    /// `timeout` bounds the write and the wait together. No lock is held
    /// while waiting.
    pub async fn forward(
        &self,
        session: &Session,
        request: HttpRequestData,
        timeout: Duration,
    ) -> Result<HttpResponseData, ForwardError> {
        let deadline = Instant::now() + timeout;
        let request_id = generate_request_id();
        let mut rx = self
            .pending
            .register(&request_id, session.id())
            .map_err(|e| ForwardError::DeliveryFailed(e.to_string()))?;

        debug!(
            request_id = %request_id,
            session_id = %session.id(),
            method = %request.method,
            path = %request.url,
            "Forwarding request"
        );

        let message = TunnelMessage::HttpRequest {
            id: request_id.clone(),
            data: request,
        };
        match tokio::time::timeout_at(deadline, session.send(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.cancel(&request_id);
                warn!(request_id = %request_id, session_id = %session.id(), "Failed to deliver request: {}", e);
                return Err(ForwardError::DeliveryFailed(e.to_string()));
            }
            Err(_) => {
                self.pending.cancel(&request_id);
                warn!(
                    request_id = %request_id,
                    session_id = %session.id(),
                    "Write to agent did not finish within {:?}",
                    timeout
                );
                return Err(ForwardError::RequestTimeout(timeout));
            }
        }

        let response = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(ForwardError::DeliveryFailed(format!(
                    "session {} closed before responding",
                    session.id()
                )))
            }
            Err(_) => {
                if self.pending.cancel(&request_id) {
                    warn!(request_id = %request_id, "Request timed out after {:?}", timeout);
                    return Err(ForwardError::RequestTimeout(timeout));
                }
                // The response was resolved right at the deadline
                match rx.try_recv() {
                    Ok(response) => response,
                    Err(_) => return Err(ForwardError::RequestTimeout(timeout)),
                }
            }
        };

        match response.error {
            Some(error) => Err(ForwardError::LocalDispatch(error)),
            None => Ok(response),
        }
    }

    /// Hand an agent's response to whoever is waiting for it.
    /// Unknown or late ids are discarded.
    pub fn route_response(&self, request_id: &str, response: HttpResponseData) -> bool {
        let delivered = self.pending.resolve(request_id, response);
        if !delivered {
            debug!(request_id = %request_id, "Discarding response for unknown or expired request");
        }
        delivered
    }

    /// Fail every request waiting on a session
    pub fn fail_session(&self, session_id: &str) -> usize {
        self.pending.fail_session(session_id)
    }
}

fn generate_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StalledSender;
    use backhaul_proto::LocalTarget;
    use backhaul_transport::{memory, MessageReceiver};

    fn setup() -> (RequestCorrelator, Arc<Session>, memory::MemoryEnd) {
        let registry = Arc::new(SessionRegistry::new());
        let (relay_end, agent_end) = memory::pair();
        let session = Arc::new(Session::with_id(
            "client_a",
            LocalTarget::default(),
            relay_end.sender,
        ));
        registry.register(Arc::clone(&session)).unwrap();
        (RequestCorrelator::new(registry), session, agent_end)
    }

    async fn next_request_id(agent: &mut memory::MemoryEnd) -> String {
        match agent.receiver.recv().await.unwrap() {
            Some(TunnelMessage::HttpRequest { id, .. }) => id,
            other => panic!("expected http_request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_and_respond() {
        let (correlator, session, mut agent) = setup();

        let waiter = {
            let correlator = correlator.clone();
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                correlator
                    .forward(&session, HttpRequestData::new("GET", "/"), Duration::from_secs(5))
                    .await
            })
        };

        let id = next_request_id(&mut agent).await;
        assert!(id.starts_with("req_"));
        assert!(correlator.route_response(&id, HttpResponseData::new(201).with_body(b"made")));

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(response.body, "made");
        assert_eq!(correlator.pending().count(), 0);
    }

    #[tokio::test]
    async fn test_agent_error_surfaces_as_local_dispatch() {
        let (correlator, session, mut agent) = setup();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .forward(&session, HttpRequestData::new("GET", "/"), Duration::from_secs(5))
                    .await
            })
        };

        let id = next_request_id(&mut agent).await;
        correlator.route_response(&id, HttpResponseData::error_response("connection refused"));

        assert_eq!(
            waiter.await.unwrap(),
            Err(ForwardError::LocalDispatch("connection refused".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_discarded() {
        let (correlator, session, mut agent) = setup();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .forward(&session, HttpRequestData::new("GET", "/slow"), Duration::from_secs(2))
                    .await
            })
        };

        let id = next_request_id(&mut agent).await;
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(
            waiter.await.unwrap(),
            Err(ForwardError::RequestTimeout(Duration::from_secs(2)))
        );
        assert_eq!(correlator.pending().count(), 0);
        assert!(!correlator.route_response(&id, HttpResponseData::new(200)));
    }

    #[tokio::test]
    async fn test_write_failure_is_delivery_failed() {
        let (correlator, session, agent) = setup();
        drop(agent);

        let result = correlator
            .forward(&session, HttpRequestData::new("GET", "/"), Duration::from_secs(5))
            .await;

        assert!(matches!(result, Err(ForwardError::DeliveryFailed(_))));
        assert_eq!(correlator.pending().count(), 0);
    }

    #[tokio::test]
    async fn test_session_teardown_fails_waiters() {
        let (correlator, session, mut agent) = setup();

        let waiter = {
            let correlator = correlator.clone();
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                correlator
                    .forward(&session, HttpRequestData::new("GET", "/"), Duration::from_secs(30))
                    .await
            })
        };

        let _id = next_request_id(&mut agent).await;
        assert_eq!(correlator.fail_session(session.id()), 1);

        assert!(matches!(
            waiter.await.unwrap(),
            Err(ForwardError::DeliveryFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_still_times_out() {
        let registry = Arc::new(SessionRegistry::new());
        let stalled = Arc::new(Session::with_id(
            "client_stalled",
            LocalTarget::default(),
            Arc::new(StalledSender),
        ));
        registry.register(Arc::clone(&stalled)).unwrap();
        let correlator = RequestCorrelator::new(registry);

        let result = tokio::time::timeout(
            Duration::from_secs(60),
            correlator.forward(&stalled, HttpRequestData::new("GET", "/"), Duration::from_secs(2)),
        )
        .await
        .expect("forward must respect its own timeout");

        assert_eq!(result, Err(ForwardError::RequestTimeout(Duration::from_secs(2))));
        assert_eq!(correlator.pending().count(), 0);
    }

    #[tokio::test]
    async fn test_forward_any_without_sessions() {
        let correlator = RequestCorrelator::new(Arc::new(SessionRegistry::new()));
        assert_eq!(
            correlator
                .forward_any(HttpRequestData::new("GET", "/"), None)
                .await,
            Err(ForwardError::NoSessionsAvailable)
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_not_crossed() {
        let (correlator, session, mut agent) = setup();

        let mut waiters = Vec::new();
        for i in 0..10 {
            let correlator = correlator.clone();
            let session = Arc::clone(&session);
            waiters.push(tokio::spawn(async move {
                let request = HttpRequestData::new("GET", format!("/item/{}", i));
                let response = correlator
                    .forward(&session, request, Duration::from_secs(5))
                    .await
                    .unwrap();
                (i, response.body)
            }));
        }

        // Answer in reverse arrival order, echoing the path
        let mut received = Vec::new();
        for _ in 0..10 {
            match agent.receiver.recv().await.unwrap() {
                Some(TunnelMessage::HttpRequest { id, data }) => received.push((id, data.url)),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        for (id, url) in received.into_iter().rev() {
            correlator.route_response(&id, HttpResponseData::new(200).with_body(url.as_bytes()));
        }

        for waiter in waiters {
            let (i, body) = waiter.await.unwrap();
            assert_eq!(body, format!("/item/{}", i));
        }
    }
}
