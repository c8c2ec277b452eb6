//! Backhaul tunnel protocol
//!
//! Message types and the JSON text codec shared by the relay and the agent.
//! Every message is a self-contained JSON object tagged by its `type` field;
//! request/response messages carry a correlation `id`.

pub mod body;
pub mod codec;
pub mod headers;
pub mod messages;

pub use body::{Body, BodyEncoding};
pub use codec::{CodecError, TunnelCodec};
pub use headers::is_hop_by_hop;
pub use messages::*;

/// Handshake header carrying the agent's bearer token
///
/// Header names are lowercase; HTTP matches them case-insensitively.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Handshake header declaring the agent's local target host
pub const TARGET_HOST_HEADER: &str = "x-tunnel-host";

/// Handshake header declaring the agent's local target port
pub const TARGET_PORT_HEADER: &str = "x-tunnel-port";
