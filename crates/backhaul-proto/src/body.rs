//! Body encoding for message payloads
//!
//! Bodies travel inside JSON strings. Valid UTF-8 goes as-is; anything else
//! is base64-encoded and marked so the peer can restore the exact bytes.

use crate::codec::CodecError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// How the `body` string of a message is encoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    /// Body is the literal UTF-8 text (also assumed when the marker is absent)
    #[default]
    Utf8,
    Base64,
}

/// Body encode/decode helpers
pub struct Body;

impl Body {
    /// Encode raw bytes for the wire, picking the cheapest faithful encoding
    pub fn encode(bytes: &[u8]) -> (String, BodyEncoding) {
        match std::str::from_utf8(bytes) {
            Ok(text) => (text.to_string(), BodyEncoding::Utf8),
            Err(_) => (STANDARD.encode(bytes), BodyEncoding::Base64),
        }
    }

    /// Restore raw bytes from a wire body
    pub fn decode(body: &str, encoding: BodyEncoding) -> Result<Vec<u8>, CodecError> {
        match encoding {
            BodyEncoding::Utf8 => Ok(body.as_bytes().to_vec()),
            BodyEncoding::Base64 => STANDARD
                .decode(body)
                .map_err(|e| CodecError::InvalidBody(e.to_string())),
        }
    }
}
