//! Codec for encoding/decoding tunnel messages

use crate::messages::TunnelMessage;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Invalid JSON, unknown `type` tag or missing fields
    #[error("Protocol parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Invalid body: {0}")]
    InvalidBody(String),
}

/// Tunnel message codec
pub struct TunnelCodec;

impl TunnelCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a tunnel message to a JSON text frame
    pub fn encode(msg: &TunnelMessage) -> Result<String, CodecError> {
        let text = serde_json::to_string(msg)?;

        if text.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(text.len()));
        }

        Ok(text)
    }

    /// Decode one JSON text frame
    pub fn decode(text: &str) -> Result<TunnelMessage, CodecError> {
        if text.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(text.len()));
        }

        Ok(serde_json::from_str(text)?)
    }
}
