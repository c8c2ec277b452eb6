//! Relay configuration

use backhaul_control::{LivenessConfig, DEFAULT_REQUEST_TIMEOUT};
use backhaul_transport::{ServerTlsConfig, TokenValidator};
use std::net::SocketAddr;
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public HTTP listener
    pub http_addr: SocketAddr,
    /// Tunnel (WebSocket) listener for agents
    pub tunnel_addr: SocketAddr,
    /// Host name advertised to agents in the `connected` message
    pub public_domain: String,
    /// How long a public request waits for the agent
    pub request_timeout: Duration,
    pub require_auth: bool,
    pub tokens: Vec<String>,
    /// Terminate TLS on the tunnel listener
    pub tls: Option<ServerTlsConfig>,
    pub liveness: LivenessConfig,
    /// Sessions beyond this count are closed right after the handshake
    pub max_sessions: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 6000)),
            tunnel_addr: SocketAddr::from(([0, 0, 0, 0], 6001)),
            public_domain: "localhost".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            require_auth: true,
            tokens: vec!["default-token".to_string()],
            tls: None,
            liveness: LivenessConfig::default(),
            max_sessions: 100,
        }
    }
}

impl RelayConfig {
    pub fn with_http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = addr;
        self
    }

    pub fn with_tunnel_addr(mut self, addr: SocketAddr) -> Self {
        self.tunnel_addr = addr;
        self
    }

    pub fn with_public_domain(mut self, domain: impl Into<String>) -> Self {
        self.public_domain = domain.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    pub fn with_tls(mut self, tls: ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn token_validator(&self) -> TokenValidator {
        TokenValidator::new(self.tokens.iter().cloned()).with_require_auth(self.require_auth)
    }

    /// URL agents are told their service is reachable at
    pub fn public_url(&self, http_port: u16) -> String {
        let domain = if self.public_domain.is_empty() {
            "localhost"
        } else {
            self.public_domain.as_str()
        };
        format!("http://{}:{}", domain, http_port)
    }
}
