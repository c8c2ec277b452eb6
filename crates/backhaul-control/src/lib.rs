//! Relay control plane
//!
//! Session bookkeeping and request/response correlation for the relay.
//! The public HTTP side calls [`RequestCorrelator::forward_any`]; each agent
//! connection is driven by [`SessionHandler::serve`].

pub mod correlator;
pub mod handler;
pub mod liveness;
pub mod pending_requests;
pub mod registry;
pub mod session;

#[cfg(test)]
mod testing;

pub use correlator::{ForwardError, RequestCorrelator, DEFAULT_REQUEST_TIMEOUT};
pub use handler::SessionHandler;
pub use liveness::{LivenessConfig, LivenessMonitor, SweepReport};
pub use pending_requests::{PendingError, PendingRequests};
pub use registry::{RegistryError, Selection, SessionRegistry};
pub use session::{Session, SessionInfo, WRITE_TIMEOUT};
