//! Backhaul agent
//!
//! Runs inside the private network. Holds an outbound tunnel to the relay
//! open through [`SessionManager`] and replays each tunneled request against
//! the local service with [`LocalDispatcher`].

pub mod config;
pub mod dispatcher;
pub mod reconnect;
pub mod session;

pub use config::AgentConfig;
pub use dispatcher::{DispatchError, LocalDispatcher, DEFAULT_LOCAL_TIMEOUT};
pub use reconnect::{Backoff, ReconnectPolicy, ReconnectState};
pub use session::{SessionManager, SessionState};

use backhaul_transport::TransportError;
use thiserror::Error;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// `attempts` is the number of consecutive failures seen
    #[error("Gave up reconnecting after {attempts} consecutive failures")]
    ReconnectExhausted { attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),
}
