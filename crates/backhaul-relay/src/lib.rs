//! Public relay for reverse HTTP tunnels
//!
//! Agents dial the tunnel listener and keep a WebSocket session open; public
//! HTTP requests arriving on the HTTP listener are forwarded through one of
//! those sessions and answered with whatever the agent reports back.

pub mod config;
pub mod http;
pub mod server;

pub use config::RelayConfig;
pub use server::Relay;

use backhaul_transport::TransportError;
use thiserror::Error;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
