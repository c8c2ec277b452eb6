//! Relay server: tunnel listener plus public HTTP listener

use backhaul_control::{
    LivenessMonitor, RequestCorrelator, Session, SessionHandler, SessionRegistry,
};
use backhaul_transport::{AcceptedTunnel, TunnelAcceptor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::http::{router, AppState};
use crate::RelayError;

/// A bound relay, ready to run
pub struct Relay {
    config: RelayConfig,
    http_listener: TcpListener,
    tunnel_listener: TcpListener,
    registry: Arc<SessionRegistry>,
    correlator: RequestCorrelator,
    handler: SessionHandler,
    acceptor: TunnelAcceptor,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("http_addr", &self.http_listener.local_addr().ok())
            .field("tunnel_addr", &self.tunnel_listener.local_addr().ok())
            .field("sessions", &self.registry.count())
            .finish()
    }
}

impl Relay {
    /// Bind both listeners. Port 0 picks an ephemeral port.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let http_listener = bind_listener(config.http_addr).await?;
        let tunnel_listener = bind_listener(config.tunnel_addr).await?;

        let mut acceptor = TunnelAcceptor::new(config.token_validator());
        if let Some(tls) = &config.tls {
            acceptor = acceptor.with_tls(tls)?;
        }

        let http_port = http_listener.local_addr()?.port();
        let registry = Arc::new(SessionRegistry::new().with_max_sessions(config.max_sessions));
        let correlator =
            RequestCorrelator::new(Arc::clone(&registry)).with_timeout(config.request_timeout);
        let handler = SessionHandler::new(correlator.clone(), config.public_url(http_port));

        Ok(Self {
            config,
            http_listener,
            tunnel_listener,
            registry,
            correlator,
            handler,
            acceptor,
        })
    }

    pub fn http_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.http_listener.local_addr()?)
    }

    pub fn tunnel_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.tunnel_listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    /// Serve until `shutdown` is cancelled, then close every session
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let Relay {
            config,
            http_listener,
            tunnel_listener,
            registry,
            correlator,
            handler,
            acceptor,
        } = self;

        info!(
            http_addr = %http_listener.local_addr()?,
            tunnel_addr = %tunnel_listener.local_addr()?,
            tls = acceptor.is_tls(),
            "Relay started"
        );

        let liveness = LivenessMonitor::new(Arc::clone(&registry), config.liveness);
        let liveness_task = tokio::spawn(liveness.run(shutdown.child_token()));

        let accept_task = tokio::spawn(accept_loop(
            tunnel_listener,
            acceptor,
            handler,
            shutdown.child_token(),
        ));

        let app = router(AppState {
            correlator,
            registry: Arc::clone(&registry),
            started_at: Instant::now(),
        });
        let served = axum::serve(http_listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await;

        // HTTP side can also stop on its own; make sure everything follows
        shutdown.cancel();
        let _ = accept_task.await;
        let _ = liveness_task.await;

        for session in registry.snapshot() {
            session.close().await;
        }
        info!("Relay stopped");

        served.map_err(RelayError::Io)
    }
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        })
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TunnelAcceptor,
    handler: SessionHandler,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Tunnel listener stopped");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        let (tcp_stream, remote_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to accept tunnel connection: {}", e);
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let AcceptedTunnel {
                target,
                remote_addr,
                channel,
            } = match acceptor.upgrade(tcp_stream, remote_addr).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    warn!(%remote_addr, "Tunnel handshake failed: {}", e);
                    return;
                }
            };

            let session = Arc::new(Session::new(target, channel.sender).with_remote_addr(remote_addr));
            info!(
                session_id = %session.id(),
                %remote_addr,
                local_target = %session.target(),
                "Agent connected"
            );

            if let Err(e) = handler.serve(session, channel.receiver).await {
                warn!(%remote_addr, "Session rejected: {}", e);
            }
        });
    }
}
