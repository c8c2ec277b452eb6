//! Handshake token validation

use std::collections::HashSet;

use crate::{TransportError, TransportResult};

const BEARER_PREFIX: &str = "Bearer ";

/// Checks the `Authorization` header presented during the tunnel handshake.
///
/// Accepts either `Bearer <token>` or the bare token.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    tokens: HashSet<String>,
    require_auth: bool,
}

impl TokenValidator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            require_auth: true,
        }
    }

    /// Validator that lets every handshake through
    pub fn allow_all() -> Self {
        Self {
            tokens: HashSet::new(),
            require_auth: false,
        }
    }

    pub fn with_require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    pub fn requires_auth(&self) -> bool {
        self.require_auth
    }

    pub fn validate(&self, header: Option<&str>) -> TransportResult<()> {
        if !self.require_auth {
            return Ok(());
        }

        let raw = header.map(str::trim).unwrap_or_default();
        let token = raw.strip_prefix(BEARER_PREFIX).unwrap_or(raw).trim();

        if token.is_empty() {
            return Err(TransportError::AuthenticationFailed(
                "missing token".to_string(),
            ));
        }
        if !self.tokens.contains(token) {
            return Err(TransportError::AuthenticationFailed(
                "invalid token".to_string(),
            ));
        }
        Ok(())
    }
}

/// Format a token for the `Authorization` header
pub fn bearer(token: &str) -> String {
    format!("{}{}", BEARER_PREFIX, token)
}
