//! Configuration files for the `relay` and `agent` commands
//!
//! Files are YAML or JSON with camelCase keys. A missing file yields the
//! defaults; command-line flags are applied on top by the caller.

use anyhow::{Context, Result};
use backhaul_agent::{AgentConfig, Backoff, ReconnectPolicy};
use backhaul_control::LivenessConfig;
use backhaul_proto::LocalTarget;
use backhaul_relay::RelayConfig;
use backhaul_transport::{ClientTlsConfig, ServerTlsConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_RELAY_CONFIG: &str = "relay.yaml";
pub const DEFAULT_AGENT_CONFIG: &str = "tunnel.json";

/// Read `path` as YAML, then as JSON. Missing or unreadable files give defaults.
pub fn load<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!(path = %path.display(), "No config file ({}), using defaults", e);
            return Ok(T::default());
        }
    };

    match serde_yaml::from_str(&contents) {
        Ok(config) => Ok(config),
        Err(yaml_err) => serde_json::from_str(&contents).with_context(|| {
            format!(
                "Failed to parse {} as YAML ({}) or JSON",
                path.display(),
                yaml_err
            )
        }),
    }
}

// Relay file

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayFileConfig {
    pub server: ServerSection,
    pub auth: AuthSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSection {
    pub http_port: u16,
    pub ws_port: u16,
    pub host: String,
    pub public_domain: String,
    /// Milliseconds
    pub request_timeout: u64,
    pub max_clients: usize,
    /// Milliseconds
    pub heartbeat_interval: u64,
    pub max_missed_heartbeats: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_port: 6000,
            ws_port: 6001,
            host: "0.0.0.0".to_string(),
            public_domain: String::new(),
            request_timeout: 30_000,
            max_clients: 100,
            heartbeat_interval: 30_000,
            max_missed_heartbeats: 3,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthSection {
    pub require_auth: bool,
    pub tokens: Vec<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            require_auth: true,
            tokens: vec!["default-token".to_string()],
        }
    }
}

/// Command-line overrides for `relay start`
#[derive(Debug, Clone, Default)]
pub struct RelayOverrides {
    pub http_port: Option<u16>,
    pub ws_port: Option<u16>,
    pub host: Option<String>,
}

impl RelayFileConfig {
    pub fn apply(&mut self, overrides: RelayOverrides) {
        if let Some(port) = overrides.http_port {
            self.server.http_port = port;
        }
        if let Some(port) = overrides.ws_port {
            self.server.ws_port = port;
        }
        if let Some(host) = overrides.host {
            self.server.host = host;
        }
    }

    pub fn into_relay_config(self) -> Result<RelayConfig> {
        let server = self.server;
        non_zero("server.requestTimeout", server.request_timeout)?;
        non_zero("server.heartbeatInterval", server.heartbeat_interval)?;
        let ip: IpAddr = server
            .host
            .parse()
            .with_context(|| format!("Invalid listen host: {}", server.host))?;

        let mut config = RelayConfig::default()
            .with_http_addr(SocketAddr::new(ip, server.http_port))
            .with_tunnel_addr(SocketAddr::new(ip, server.ws_port))
            .with_request_timeout(Duration::from_millis(server.request_timeout))
            .with_max_sessions(server.max_clients)
            .with_liveness(LivenessConfig {
                interval: Duration::from_millis(server.heartbeat_interval),
                max_missed: server.max_missed_heartbeats,
            })
            .with_require_auth(self.auth.require_auth)
            .with_tokens(self.auth.tokens);

        if !server.public_domain.is_empty() {
            config = config.with_public_domain(server.public_domain);
        }

        match (server.tls_cert, server.tls_key) {
            (Some(cert), Some(key)) => config = config.with_tls(ServerTlsConfig::new(cert, key)),
            (None, None) => {}
            _ => anyhow::bail!("tlsCert and tlsKey must be set together"),
        }

        Ok(config)
    }
}

// Agent file

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentFileConfig {
    pub tunnel: TunnelSection,
    pub local: LocalSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TunnelSection {
    pub url: String,
    pub auth_token: String,
    /// 0 retries forever
    pub reconnect_attempts: u32,
    /// Milliseconds
    pub reconnect_delay: u64,
    pub backoff: Backoff,
    /// Milliseconds
    pub max_reconnect_delay: u64,
    /// Milliseconds
    pub heartbeat_interval: u64,
    pub insecure_skip_verify: bool,
    pub server_name: String,
    pub ca_cert_file: String,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            url: "ws://localhost:6001".to_string(),
            auth_token: "default-token".to_string(),
            reconnect_attempts: 10,
            reconnect_delay: 5_000,
            backoff: Backoff::Linear,
            max_reconnect_delay: 60_000,
            heartbeat_interval: 30_000,
            insecure_skip_verify: false,
            server_name: String::new(),
            ca_cert_file: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalSection {
    pub host: String,
    pub port: u16,
    /// Milliseconds
    pub timeout: u64,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            host: LocalTarget::DEFAULT_HOST.to_string(),
            port: LocalTarget::DEFAULT_PORT,
            timeout: 30_000,
        }
    }
}

/// Command-line overrides for `agent run`
#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub tunnel_url: Option<String>,
    pub auth_token: Option<String>,
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
}

impl AgentFileConfig {
    pub fn apply(&mut self, overrides: AgentOverrides) {
        if let Some(url) = overrides.tunnel_url {
            self.tunnel.url = url;
        }
        if let Some(token) = overrides.auth_token {
            self.tunnel.auth_token = token;
        }
        if let Some(host) = overrides.local_host {
            self.local.host = host;
        }
        if let Some(port) = overrides.local_port {
            self.local.port = port;
        }
    }

    pub fn into_agent_config(self) -> Result<AgentConfig> {
        let tunnel = self.tunnel;
        non_zero("tunnel.reconnectDelay", tunnel.reconnect_delay)?;
        non_zero("tunnel.heartbeatInterval", tunnel.heartbeat_interval)?;
        non_zero("local.timeout", self.local.timeout)?;

        let max_attempts = match tunnel.reconnect_attempts {
            0 => None,
            n => Some(n),
        };
        let reconnect = ReconnectPolicy::default()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(tunnel.reconnect_delay))
            .with_backoff(tunnel.backoff)
            .with_max_delay(Duration::from_millis(tunnel.max_reconnect_delay));

        let mut tls = if tunnel.insecure_skip_verify {
            warn!("TLS certificate verification disabled");
            ClientTlsConfig::insecure()
        } else {
            ClientTlsConfig::default()
        };
        if !tunnel.ca_cert_file.is_empty() && !tunnel.insecure_skip_verify {
            tls = tls.with_custom_ca(tunnel.ca_cert_file);
        }
        if !tunnel.server_name.is_empty() {
            tls = tls.with_server_name(tunnel.server_name);
        }

        Ok(AgentConfig::new(tunnel.url, tunnel.auth_token)
            .with_target(LocalTarget::new(self.local.host, self.local.port))
            .with_reconnect(reconnect)
            .with_heartbeat_interval(Duration::from_millis(tunnel.heartbeat_interval))
            .with_local_timeout(Duration::from_millis(self.local.timeout))
            .with_tls(tls))
    }
}

/// Durations are milliseconds and must be positive
fn non_zero(key: &str, millis: u64) -> Result<()> {
    if millis == 0 {
        anyhow::bail!("{} must be greater than 0", key);
    }
    Ok(())
}
