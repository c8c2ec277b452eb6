//! Tunnel transport layer
//!
//! A tunnel is one WebSocket connection, plain (`ws://`) or TLS (`wss://`),
//! carrying JSON text frames. This crate exposes it through two small seams:
//! [`MessageSender`], shared by every task that writes to the tunnel, and
//! [`MessageReceiver`], owned by the single read loop.
//!
//! - [`connector::WebSocketConnector`] opens the agent side, presenting the
//!   bearer token and local target as upgrade headers.
//! - [`acceptor::TunnelAcceptor`] terminates the relay side and rejects bad
//!   tokens with HTTP 401 before the upgrade completes.
//! - [`memory::pair`] wires two in-process ends together for tests.

pub mod acceptor;
pub mod auth;
pub mod connector;
pub mod memory;
pub mod tls;
mod websocket;

pub use acceptor::{AcceptedTunnel, TunnelAcceptor};
pub use auth::TokenValidator;
pub use connector::WebSocketConnector;
pub use tls::{ClientTlsConfig, ServerTlsConfig, TlsMode};

use async_trait::async_trait;
use backhaul_proto::{CodecError, LocalTarget, TunnelMessage};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The established channel broke mid-session
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The channel could not be established
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] CodecError),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl TransportError {
    /// Whether the failure means the channel is unusable
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::ProtocolError(_))
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Write half of a tunnel.
///
/// Implementations serialize concurrent writers so that frames from
/// different tasks never interleave.
#[async_trait]
pub trait MessageSender: Send + Sync + Debug {
    async fn send(&self, message: &TunnelMessage) -> TransportResult<()>;

    /// Close the channel; later sends fail with `ConnectionLost`
    async fn close(&self);
}

/// Read half of a tunnel
#[async_trait]
pub trait MessageReceiver: Send + Debug {
    /// Receive the next message.
    ///
    /// Returns `Ok(None)` once the peer has closed the channel. A
    /// `ProtocolError` means one frame was malformed; the channel itself is
    /// still usable.
    async fn recv(&mut self) -> TransportResult<Option<TunnelMessage>>;
}

/// Both halves of an established tunnel
#[derive(Debug)]
pub struct Channel {
    pub sender: Arc<dyn MessageSender>,
    pub receiver: Box<dyn MessageReceiver>,
}

/// Opens outbound tunnels (agent side)
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a tunnel declaring `target` as the local forwarding target
    async fn connect(&self, target: &LocalTarget) -> TransportResult<Channel>;
}
