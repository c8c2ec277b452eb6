//! Relay-side tunnel acceptor

use backhaul_proto::{LocalTarget, AUTHORIZATION_HEADER, TARGET_HOST_HEADER, TARGET_PORT_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

use crate::auth::TokenValidator;
use crate::tls::ServerTlsConfig;
use crate::websocket::split_channel;
use crate::{Channel, TransportError, TransportResult};

/// A tunnel that passed the handshake
#[derive(Debug)]
pub struct AcceptedTunnel {
    /// Local target the agent declared (defaults applied)
    pub target: LocalTarget,
    pub remote_addr: SocketAddr,
    pub channel: Channel,
}

/// Performs TLS termination, authentication and the WebSocket upgrade
/// for inbound agent connections
#[derive(Clone)]
pub struct TunnelAcceptor {
    validator: Arc<TokenValidator>,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for TunnelAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAcceptor")
            .field("require_auth", &self.validator.requires_auth())
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl TunnelAcceptor {
    pub fn new(validator: TokenValidator) -> Self {
        Self {
            validator: Arc::new(validator),
            tls_acceptor: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Terminate TLS on the tunnel port
    pub fn with_tls(mut self, tls: &ServerTlsConfig) -> TransportResult<Self> {
        self.tls_acceptor = Some(tls.build_acceptor()?);
        Ok(self)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Run the handshake on a freshly accepted TCP connection
    pub async fn upgrade(
        &self,
        tcp_stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> TransportResult<AcceptedTunnel> {
        match tokio::time::timeout(self.handshake_timeout, self.handshake(tcp_stream, remote_addr))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionError(format!(
                "Handshake from {} timed out",
                remote_addr
            ))),
        }
    }

    async fn handshake(
        &self,
        tcp_stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> TransportResult<AcceptedTunnel> {
        let label = format!("relay<-{}", remote_addr);

        match &self.tls_acceptor {
            None => {
                let (target, ws_stream) = self.accept_ws(tcp_stream, remote_addr).await?;
                Ok(AcceptedTunnel {
                    target,
                    remote_addr,
                    channel: split_channel(ws_stream, label),
                })
            }
            Some(acceptor) => {
                let tls_stream = acceptor.accept(tcp_stream).await.map_err(|e| {
                    TransportError::TlsError(format!("TLS handshake from {} failed: {}", remote_addr, e))
                })?;
                debug!("TLS handshake complete from {}", remote_addr);

                let (target, ws_stream) = self.accept_ws(tls_stream, remote_addr).await?;
                Ok(AcceptedTunnel {
                    target,
                    remote_addr,
                    channel: split_channel(ws_stream, label),
                })
            }
        }
    }

    async fn accept_ws<S>(
        &self,
        stream: S,
        remote_addr: SocketAddr,
    ) -> TransportResult<(LocalTarget, tokio_tungstenite::WebSocketStream<S>)>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let mut target = None;
        let mut rejection = None;

        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let auth = req
                .headers()
                .get(AUTHORIZATION_HEADER)
                .and_then(|v| v.to_str().ok());

            if let Err(e) = self.validator.validate(auth) {
                rejection = Some(e.to_string());
                let mut denied = ErrorResponse::new(Some("Unauthorized".to_string()));
                *denied.status_mut() = StatusCode::UNAUTHORIZED;
                return Err(denied);
            }

            target = Some(target_from_headers(req.headers()));
            Ok(response)
        };

        let result = tokio_tungstenite::accept_hdr_async(stream, callback).await;

        match (result, rejection) {
            (Ok(ws_stream), _) => Ok((target.unwrap_or_default(), ws_stream)),
            (Err(_), Some(reason)) => {
                warn!("Rejected tunnel handshake from {}: {}", remote_addr, reason);
                Err(TransportError::AuthenticationFailed(reason))
            }
            (Err(e), None) => Err(TransportError::ConnectionError(format!(
                "WebSocket handshake from {} failed: {}",
                remote_addr, e
            ))),
        }
    }
}

/// Read the declared target, falling back to `localhost:3000`
fn target_from_headers(headers: &HeaderMap) -> LocalTarget {
    let host = headers
        .get(TARGET_HOST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .unwrap_or(LocalTarget::DEFAULT_HOST);

    let port = headers
        .get(TARGET_PORT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|p| p.trim().parse::<u16>().ok())
        .filter(|p| *p != 0)
        .unwrap_or(LocalTarget::DEFAULT_PORT);

    LocalTarget::new(host, port)
}
