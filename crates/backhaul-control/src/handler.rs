//! Relay-side session handler
//!
//! Owns the read loop of one agent session from registration to teardown.

use backhaul_proto::{ConnectedData, TunnelMessage};
use backhaul_transport::{MessageReceiver, TransportError};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::correlator::RequestCorrelator;
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::{Session, WRITE_TIMEOUT};

/// Drives registered sessions
#[derive(Debug, Clone)]
pub struct SessionHandler {
    registry: Arc<SessionRegistry>,
    correlator: RequestCorrelator,
    public_url: String,
}

impl SessionHandler {
    pub fn new(correlator: RequestCorrelator, public_url: impl Into<String>) -> Self {
        Self {
            registry: Arc::clone(correlator.registry()),
            correlator,
            public_url: public_url.into(),
        }
    }

    /// Register the session, greet the agent, then read until the channel ends.
    ///
    /// Whatever ends the loop (peer close, read error, write error, eviction
    /// or shutdown) the session is unregistered, its pending requests are
    /// failed and its channel is closed.
    pub async fn serve(
        &self,
        session: Arc<Session>,
        mut receiver: Box<dyn MessageReceiver>,
    ) -> Result<(), RegistryError> {
        if let Err(e) = self.registry.register(Arc::clone(&session)) {
            warn!(session_id = %session.id(), "Refusing session: {}", e);
            session.close().await;
            return Err(e);
        }

        let welcome = TunnelMessage::Connected {
            data: ConnectedData {
                client_id: session.id().to_string(),
                public_url: self.public_url.clone(),
                local_target: session.target().to_string(),
            },
        };
        if let Err(e) = session.send_within(&welcome, WRITE_TIMEOUT).await {
            warn!(session_id = %session.id(), "Failed to send welcome: {}", e);
            self.teardown(&session).await;
            return Ok(());
        }

        loop {
            let next = tokio::select! {
                _ = session.closed() => {
                    debug!(session_id = %session.id(), "Session closed locally");
                    break;
                }
                next = receiver.recv() => next,
            };

            match next {
                Ok(Some(message)) => {
                    session.touch();
                    if let Err(e) = self.handle_message(&session, message).await {
                        warn!(session_id = %session.id(), "Write to agent failed: {}", e);
                        break;
                    }
                }
                Ok(None) => {
                    info!(session_id = %session.id(), "Agent disconnected");
                    break;
                }
                Err(TransportError::ProtocolError(e)) => {
                    session.touch();
                    warn!(session_id = %session.id(), "Dropping malformed message: {}", e);
                }
                Err(e) => {
                    warn!(session_id = %session.id(), "Read from agent failed: {}", e);
                    break;
                }
            }
        }

        self.teardown(&session).await;
        Ok(())
    }

    async fn handle_message(
        &self,
        session: &Session,
        message: TunnelMessage,
    ) -> Result<(), TransportError> {
        match message {
            TunnelMessage::HttpResponse { id, data } => {
                debug!(
                    session_id = %session.id(),
                    request_id = %id,
                    status = data.status_code,
                    "Received response"
                );
                self.correlator.route_response(&id, data);
            }
            TunnelMessage::Heartbeat { time } => {
                debug!(session_id = %session.id(), time, "Heartbeat");
                session.record_heartbeat(time);
            }
            TunnelMessage::Ping { id } => {
                session
                    .send_within(&TunnelMessage::Pong { id }, WRITE_TIMEOUT)
                    .await?;
            }
            TunnelMessage::Pong { id } => {
                debug!(session_id = %session.id(), ping_id = %id, "Pong");
            }
            other @ (TunnelMessage::Connected { .. } | TunnelMessage::HttpRequest { .. }) => {
                warn!(
                    session_id = %session.id(),
                    kind = other.kind(),
                    "Ignoring relay-bound message from agent"
                );
            }
        }
        Ok(())
    }

    async fn teardown(&self, session: &Session) {
        self.registry.unregister(session.id());
        let failed = self.correlator.fail_session(session.id());
        session.close().await;
        info!(
            session_id = %session.id(),
            failed_requests = failed,
            "Session torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StalledSender;
    use backhaul_proto::{HttpRequestData, HttpResponseData, LocalTarget};
    use backhaul_transport::{memory, MessageSender};
    use std::time::Duration;

    struct Harness {
        handler: SessionHandler,
        registry: Arc<SessionRegistry>,
        correlator: RequestCorrelator,
        session: Arc<Session>,
        agent: memory::MemoryEnd,
        task: tokio::task::JoinHandle<Result<(), RegistryError>>,
    }

    fn start() -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let correlator = RequestCorrelator::new(Arc::clone(&registry));
        let handler = SessionHandler::new(correlator.clone(), "http://relay.test:6000");

        let (relay_end, agent) = memory::pair();
        let session = Arc::new(Session::with_id(
            "client_a",
            LocalTarget::new("app", 8080),
            relay_end.sender,
        ));

        let task = {
            let handler = handler.clone();
            let session = Arc::clone(&session);
            let receiver: Box<dyn MessageReceiver> = Box::new(relay_end.receiver);
            tokio::spawn(async move { handler.serve(session, receiver).await })
        };

        Harness {
            handler,
            registry,
            correlator,
            session,
            agent,
            task,
        }
    }

    #[tokio::test]
    async fn test_welcome_message() {
        let mut h = start();

        match h.agent.receiver.recv().await.unwrap() {
            Some(TunnelMessage::Connected { data }) => {
                assert_eq!(data.client_id, "client_a");
                assert_eq!(data.public_url, "http://relay.test:6000");
                assert_eq!(data.local_target, "app:8080");
            }
            other => panic!("expected connected, got {:?}", other),
        }
        assert_eq!(h.registry.count(), 1);
    }

    #[tokio::test]
    async fn test_ping_answered_and_garbage_tolerated() {
        let mut h = start();
        let _welcome = h.agent.receiver.recv().await.unwrap();

        h.agent.sender.send_raw("{not json").unwrap();
        h.agent.sender.send_raw(r#"{"type":"mystery"}"#).unwrap();
        h.agent
            .sender
            .send(&TunnelMessage::Ping {
                id: "ping_1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            h.agent.receiver.recv().await.unwrap(),
            Some(TunnelMessage::Pong {
                id: "ping_1".to_string()
            })
        );
        assert_eq!(h.registry.count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_recorded() {
        let mut h = start();
        let _welcome = h.agent.receiver.recv().await.unwrap();

        h.agent
            .sender
            .send(&TunnelMessage::Heartbeat {
                time: 1_700_000_123,
            })
            .await
            .unwrap();
        // Round-trip a ping so the heartbeat has been processed
        h.agent
            .sender
            .send(&TunnelMessage::Ping { id: "p".to_string() })
            .await
            .unwrap();
        let _pong = h.agent.receiver.recv().await.unwrap();

        assert_eq!(
            h.session.last_heartbeat().map(|t| t.timestamp()),
            Some(1_700_000_123)
        );
    }

    #[tokio::test]
    async fn test_response_routed_through_session() {
        let mut h = start();
        let _welcome = h.agent.receiver.recv().await.unwrap();

        let waiter = {
            let correlator = h.correlator.clone();
            tokio::spawn(async move {
                correlator
                    .forward_any(HttpRequestData::new("GET", "/ok"), Some(Duration::from_secs(5)))
                    .await
            })
        };

        let id = match h.agent.receiver.recv().await.unwrap() {
            Some(TunnelMessage::HttpRequest { id, .. }) => id,
            other => panic!("expected http_request, got {:?}", other),
        };
        h.agent
            .sender
            .send(&TunnelMessage::HttpResponse {
                id,
                data: HttpResponseData::new(200).with_body(b"ok"),
            })
            .await
            .unwrap();

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.body, "ok");
    }

    #[tokio::test]
    async fn test_peer_close_tears_down() {
        let mut h = start();
        let _welcome = h.agent.receiver.recv().await.unwrap();

        let waiter = {
            let correlator = h.correlator.clone();
            tokio::spawn(async move {
                correlator
                    .forward_any(HttpRequestData::new("GET", "/"), Some(Duration::from_secs(30)))
                    .await
            })
        };
        let _request = h.agent.receiver.recv().await.unwrap();

        h.agent.sender.close().await;
        h.task.await.unwrap().unwrap();

        assert_eq!(h.registry.count(), 0);
        assert!(h.session.is_closed());
        assert!(matches!(
            waiter.await.unwrap(),
            Err(crate::ForwardError::DeliveryFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_agent_is_torn_down() {
        let registry = Arc::new(SessionRegistry::new());
        let handler = SessionHandler::new(RequestCorrelator::new(Arc::clone(&registry)), "http://relay.test");
        let (relay_end, _agent) = memory::pair();
        let session = Arc::new(Session::with_id(
            "client_stalled",
            LocalTarget::default(),
            Arc::new(StalledSender),
        ));

        tokio::time::timeout(
            WRITE_TIMEOUT * 4,
            handler.serve(Arc::clone(&session), Box::new(relay_end.receiver)),
        )
        .await
        .expect("serve must give up on a stalled agent")
        .unwrap();

        assert!(session.is_closed());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_session_refused() {
        let mut h = start();
        let _welcome = h.agent.receiver.recv().await.unwrap();

        let (other_end, _peer) = memory::pair();
        let duplicate = Arc::new(Session::with_id(
            "client_a",
            LocalTarget::default(),
            other_end.sender,
        ));
        let result = h
            .handler
            .serve(duplicate, Box::new(other_end.receiver))
            .await;

        assert_eq!(
            result,
            Err(RegistryError::DuplicateSession("client_a".to_string()))
        );
        assert_eq!(h.registry.count(), 1);
    }
}
