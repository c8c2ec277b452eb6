//! Pending requests tracker
//!
//! Holds one result slot per in-flight request. Whichever of response,
//! timeout, delivery failure or session teardown removes the entry first
//! wins; the others find nothing and do nothing.

use backhaul_proto::HttpResponseData;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("Request {0} is already pending")]
    DuplicateRequest(String),
}

#[derive(Debug)]
struct PendingEntry {
    tx: oneshot::Sender<HttpResponseData>,
    session_id: String,
    created_at: Instant,
}

/// Tracks requests sent to agents that await a response
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    requests: Arc<DashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request owned by `session_id`.
    /// Returns the receiver that will see the response.
    pub fn register(
        &self,
        request_id: &str,
        session_id: &str,
    ) -> Result<oneshot::Receiver<HttpResponseData>, PendingError> {
        match self.requests.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(PendingError::DuplicateRequest(request_id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingEntry {
                    tx,
                    session_id: session_id.to_string(),
                    created_at: Instant::now(),
                });
                debug!(request_id = %request_id, session_id = %session_id, "Registered pending request");
                Ok(rx)
            }
        }
    }

    /// Deliver a response. Returns false if the request is not pending
    /// (already timed out, failed or never existed).
    pub fn resolve(&self, request_id: &str, response: HttpResponseData) -> bool {
        let Some((_, entry)) = self.requests.remove(request_id) else {
            return false;
        };

        debug!(
            request_id = %request_id,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "Routing response"
        );
        if entry.tx.send(response).is_err() {
            warn!(request_id = %request_id, "Response receiver dropped");
            return false;
        }
        true
    }

    /// Remove a pending request. Returns false if it was already gone.
    pub fn cancel(&self, request_id: &str) -> bool {
        let removed = self.requests.remove(request_id).is_some();
        if removed {
            debug!(request_id = %request_id, "Cancelled pending request");
        }
        removed
    }

    /// Drop every request owned by a session; their waiters see the channel close
    pub fn fail_session(&self, session_id: &str) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, entry| entry.session_id != session_id);
        let failed = before.saturating_sub(self.requests.len());
        if failed > 0 {
            debug!(session_id = %session_id, failed, "Failed pending requests of closed session");
        }
        failed
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.requests.contains_key(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let tracker = PendingRequests::new();

        let rx = tracker.register("req_1", "client_a").unwrap();
        assert_eq!(tracker.count(), 1);

        assert!(tracker.resolve("req_1", HttpResponseData::new(200)));
        assert_eq!(rx.await.unwrap().status_code, 200);
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let tracker = PendingRequests::new();
        let _rx = tracker.register("req_1", "client_a").unwrap();

        assert_eq!(
            tracker.register("req_1", "client_b").unwrap_err(),
            PendingError::DuplicateRequest("req_1".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolution_happens_once() {
        let tracker = PendingRequests::new();
        let _rx = tracker.register("req_1", "client_a").unwrap();

        assert!(tracker.cancel("req_1"));
        assert!(!tracker.cancel("req_1"));
        assert!(!tracker.resolve("req_1", HttpResponseData::new(200)));
    }

    #[tokio::test]
    async fn test_unknown_response_is_ignored() {
        let tracker = PendingRequests::new();
        assert!(!tracker.resolve("req_missing", HttpResponseData::new(200)));
    }

    #[tokio::test]
    async fn test_fail_session_only_touches_its_requests() {
        let tracker = PendingRequests::new();
        let rx_a1 = tracker.register("req_1", "client_a").unwrap();
        let rx_a2 = tracker.register("req_2", "client_a").unwrap();
        let _rx_b = tracker.register("req_3", "client_b").unwrap();

        assert_eq!(tracker.fail_session("client_a"), 2);
        assert!(rx_a1.await.is_err());
        assert!(rx_a2.await.is_err());
        assert_eq!(tracker.count(), 1);
        assert!(tracker.contains("req_3"));
    }
}
