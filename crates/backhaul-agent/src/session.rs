//! Agent session manager
//!
//! Keeps one tunnel to the relay alive: connects, serves requests while
//! connected, and reconnects with backoff when the tunnel breaks.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...
//!                      \                          \
//!                       `-- (budget exhausted) ----`--> Stopped
//! ```
//!
//! Shutdown moves any state straight to `Stopped`.

use backhaul_proto::{LocalTarget, TunnelMessage};
use backhaul_transport::{Channel, Connector, MessageSender, TransportError, WebSocketConnector};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::dispatcher::LocalDispatcher;
use crate::reconnect::ReconnectState;
use crate::AgentError;

/// Lifecycle state of the agent's tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a connected session ended
enum SessionEnd {
    Shutdown,
    Lost(String),
}

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    dispatcher: LocalDispatcher,
    target: LocalTarget,
    heartbeat_interval: Duration,
    reconnect: std::sync::Mutex<ReconnectState>,
    state_tx: watch::Sender<SessionState>,
    shutdown: CancellationToken,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("target", &self.target)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

impl SessionManager {
    /// Build a manager that connects over WebSocket
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let connector = WebSocketConnector::new(
            &config.tunnel_url,
            config.auth_token.clone(),
            config.tls.clone(),
        )?;
        Self::with_connector(config, Arc::new(connector))
    }

    /// Build a manager over any connector
    pub fn with_connector(
        config: AgentConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, AgentError> {
        let dispatcher = LocalDispatcher::new(config.target.clone(), config.local_timeout)
            .map_err(|e| AgentError::Config(e.to_string()))?;
        let (state_tx, _) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            connector,
            dispatcher,
            target: config.target,
            heartbeat_interval: config.heartbeat_interval,
            reconnect: std::sync::Mutex::new(ReconnectState::new(config.reconnect)),
            state_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Request a graceful stop; `run` returns `Ok(())`
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    fn stop(&self) {
        self.set_state(SessionState::Stopped);
        info!("Agent stopped");
    }

    /// Record a failure and pick the next delay
    fn next_delay(&self) -> (Option<Duration>, u32) {
        let mut reconnect = self.reconnect.lock().unwrap_or_else(|e| e.into_inner());
        let delay = reconnect.next_delay();
        (delay, reconnect.failures())
    }

    fn reset_reconnect(&self) {
        self.reconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }

    /// Run until shutdown (`Ok`) or until the reconnect budget is exhausted
    pub async fn run(&self) -> Result<(), AgentError> {
        loop {
            if self.shutdown.is_cancelled() {
                self.stop();
                return Ok(());
            }

            self.set_state(SessionState::Connecting);
            info!(local_target = %self.target, "Connecting to relay");

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.stop();
                    return Ok(());
                }
                result = self.connector.connect(&self.target) => result,
            };

            match connected {
                Ok(channel) => {
                    self.reset_reconnect();
                    self.set_state(SessionState::Connected);
                    info!("Tunnel connected");

                    match self.run_session(channel).await {
                        SessionEnd::Shutdown => {
                            self.stop();
                            return Ok(());
                        }
                        SessionEnd::Lost(reason) => {
                            warn!("Tunnel lost: {}", reason);
                        }
                    }
                }
                Err(TransportError::AuthenticationFailed(reason)) => {
                    error!("Relay rejected credentials: {}", reason);
                }
                Err(e) => {
                    warn!("Failed to connect: {}", e);
                }
            }

            self.set_state(SessionState::Reconnecting);
            let (delay, failures) = self.next_delay();
            let Some(delay) = delay else {
                error!(attempts = failures, "Giving up after repeated connection failures");
                self.set_state(SessionState::Stopped);
                return Err(AgentError::ReconnectExhausted { attempts: failures });
            };

            info!(attempt = failures, "Reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.stop();
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(&self, channel: Channel) -> SessionEnd {
        let Channel {
            sender,
            mut receiver,
        } = channel;

        // Cancelled by shutdown or by any failed write on this session
        let session_token = self.shutdown.child_token();

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&sender),
            self.heartbeat_interval,
            session_token.clone(),
        ));

        let end = loop {
            let next = tokio::select! {
                _ = session_token.cancelled() => {
                    if self.shutdown.is_cancelled() {
                        break SessionEnd::Shutdown;
                    }
                    break SessionEnd::Lost("write to relay failed".to_string());
                }
                next = receiver.recv() => next,
            };

            match next {
                Ok(Some(message)) => self.handle_message(message, &sender, &session_token),
                Ok(None) => break SessionEnd::Lost("relay closed the connection".to_string()),
                Err(TransportError::ProtocolError(e)) => {
                    warn!("Dropping malformed message from relay: {}", e);
                }
                Err(e) => break SessionEnd::Lost(e.to_string()),
            }
        };

        session_token.cancel();
        let _ = heartbeat.await;
        sender.close().await;
        end
    }

    fn handle_message(
        &self,
        message: TunnelMessage,
        sender: &Arc<dyn MessageSender>,
        session_token: &CancellationToken,
    ) {
        match message {
            TunnelMessage::Connected { data } => {
                info!(
                    client_id = %data.client_id,
                    public_url = %data.public_url,
                    local_target = %data.local_target,
                    "Registered with relay"
                );
            }
            TunnelMessage::HttpRequest { id, data } => {
                debug!(request_id = %id, method = %data.method, path = %data.url, "Request");
                let dispatcher = self.dispatcher.clone();
                let sender = Arc::clone(sender);
                let session_token = session_token.clone();
                tokio::spawn(async move {
                    let response = dispatcher.dispatch(&data).await;
                    let message = TunnelMessage::HttpResponse {
                        id: id.clone(),
                        data: response,
                    };
                    if let Err(e) = sender.send(&message).await {
                        warn!(request_id = %id, "Failed to send response: {}", e);
                        session_token.cancel();
                    }
                });
            }
            TunnelMessage::Ping { id } => {
                let sender = Arc::clone(sender);
                let session_token = session_token.clone();
                tokio::spawn(async move {
                    if sender.send(&TunnelMessage::Pong { id }).await.is_err() {
                        session_token.cancel();
                    }
                });
            }
            TunnelMessage::Pong { id } => {
                debug!(ping_id = %id, "Pong");
            }
            other @ (TunnelMessage::HttpResponse { .. } | TunnelMessage::Heartbeat { .. }) => {
                warn!(kind = other.kind(), "Ignoring agent-bound message from relay");
            }
        }
    }
}

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Emit a heartbeat every `interval` until the session ends
async fn heartbeat_loop(
    sender: Arc<dyn MessageSender>,
    interval: Duration,
    session_token: CancellationToken,
) {
    // `interval` panics on a zero period
    let mut ticker = tokio::time::interval(interval.max(MIN_HEARTBEAT_INTERVAL));
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = session_token.cancelled() => return,
            _ = ticker.tick() => {
                let time = chrono::Utc::now().timestamp();
                if let Err(e) = sender.send(&TunnelMessage::Heartbeat { time }).await {
                    warn!("Heartbeat failed: {}", e);
                    session_token.cancel();
                    return;
                }
            }
        }
    }
}
