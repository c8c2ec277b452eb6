//! Relay-side view of one connected agent

use backhaul_proto::{LocalTarget, TunnelMessage};
use backhaul_transport::{MessageSender, TransportError, TransportResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

/// Upper bound for control writes (pings, pongs) and for closing the channel
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A live agent session.
///
/// The registry owns sessions through `Arc<Session>`; everyone else holds a
/// short-lived clone obtained from a lookup. Writes go through the shared
/// sender, which serializes them.
#[derive(Debug)]
pub struct Session {
    id: String,
    target: LocalTarget,
    remote_addr: Option<SocketAddr>,
    sender: Arc<dyn MessageSender>,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    closed: CancellationToken,
}

impl Session {
    pub fn new(target: LocalTarget, sender: Arc<dyn MessageSender>) -> Self {
        Self::with_id(generate_session_id(), target, sender)
    }

    pub fn with_id(id: impl Into<String>, target: LocalTarget, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            id: id.into(),
            target,
            remote_addr: None,
            sender,
            connected_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            last_heartbeat: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &LocalTarget {
        &self.target
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Write one message to the agent
    pub async fn send(&self, message: &TunnelMessage) -> TransportResult<()> {
        self.sender.send(message).await
    }

    /// Write one message, giving up after `limit`. A stuck sink counts as a
    /// lost connection.
    pub async fn send_within(&self, message: &TunnelMessage, limit: Duration) -> TransportResult<()> {
        match tokio::time::timeout(limit, self.sender.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionLost(format!(
                "write to {} timed out after {:?}",
                self.id, limit
            ))),
        }
    }

    /// Record inbound traffic
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Record a heartbeat carrying the agent's unix timestamp
    pub fn record_heartbeat(&self, time: i64) {
        let at = Utc.timestamp_opt(time, 0).single().unwrap_or_else(Utc::now);
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Some(at);
        self.touch();
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal the read loop to stop and close the channel.
    ///
    /// The close signal fires immediately; the close frame gets at most
    /// [`WRITE_TIMEOUT`].
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!(session_id = %self.id, "Closing session");
        self.closed.cancel();
        if tokio::time::timeout(WRITE_TIMEOUT, self.sender.close())
            .await
            .is_err()
        {
            warn!(session_id = %self.id, "Channel close timed out");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            host: self.target.host.clone(),
            port: self.target.port,
            last_ping: self.last_heartbeat().unwrap_or(self.connected_at),
            connected: !self.is_closed(),
        }
    }
}

/// Snapshot served by the `/clients` endpoint
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub last_ping: DateTime<Utc>,
    pub connected: bool,
}

fn generate_session_id() -> String {
    format!("client_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StalledSender;
    use backhaul_transport::{memory, MessageReceiver};

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, _b) = memory::pair();
        let first = Session::new(LocalTarget::default(), a.sender.clone());
        let second = Session::new(LocalTarget::default(), a.sender);
        assert!(first.id().starts_with("client_"));
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_idle() {
        let (a, _b) = memory::pair();
        let session = Session::new(LocalTarget::default(), a.sender);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(session.idle_for() >= Duration::from_secs(10));

        session.touch();
        assert!(session.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_heartbeat_shows_in_info() {
        let (a, _b) = memory::pair();
        let session = Session::with_id("client_x", LocalTarget::new("db", 5432), a.sender);

        let info = session.info();
        assert_eq!(info.last_ping, session.connected_at());
        assert!(info.connected);

        session.record_heartbeat(1_700_000_000);
        let info = session.info();
        assert_eq!(info.last_ping.timestamp(), 1_700_000_000);
        assert_eq!(info.host, "db");
        assert_eq!(info.port, 5432);
    }

    #[tokio::test]
    async fn test_close_ends_peer_and_marks_disconnected() {
        let (a, mut b) = memory::pair();
        let session = Session::new(LocalTarget::default(), a.sender);

        session.close().await;
        session.closed().await;

        assert!(session.is_closed());
        assert!(!session.info().connected);
        assert!(b.receiver.recv().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_gives_up() {
        let session = Session::new(LocalTarget::default(), Arc::new(StalledSender));

        let result = session
            .send_within(&TunnelMessage::Ping { id: "p".into() }, Duration::from_secs(2))
            .await;

        assert!(matches!(result, Err(TransportError::ConnectionLost(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_does_not_hang_on_stalled_sink() {
        let session = Session::new(LocalTarget::default(), Arc::new(StalledSender));

        tokio::time::timeout(WRITE_TIMEOUT * 2, session.close())
            .await
            .unwrap();
        assert!(session.is_closed());
    }
}
