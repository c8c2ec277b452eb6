//! Agent configuration

use backhaul_proto::LocalTarget;
use backhaul_transport::ClientTlsConfig;
use std::time::Duration;

use crate::dispatcher::DEFAULT_LOCAL_TIMEOUT;
use crate::reconnect::ReconnectPolicy;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay tunnel endpoint (`ws://` or `wss://`)
    pub tunnel_url: String,
    pub auth_token: String,
    /// Private service requests are forwarded to
    pub target: LocalTarget,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    /// Timeout for each call to the local service
    pub local_timeout: Duration,
    pub tls: ClientTlsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tunnel_url: "ws://localhost:6001".to_string(),
            auth_token: "default-token".to_string(),
            target: LocalTarget::default(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            local_timeout: DEFAULT_LOCAL_TIMEOUT,
            tls: ClientTlsConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(tunnel_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            tunnel_url: tunnel_url.into(),
            auth_token: auth_token.into(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: LocalTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_local_timeout(mut self, timeout: Duration) -> Self {
        self.local_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = tls;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.tunnel_url, "ws://localhost:6001");
        assert_eq!(config.auth_token, "default-token");
        assert_eq!(config.target.to_string(), "localhost:3000");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, Some(10));
    }
}
