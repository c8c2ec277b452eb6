//! Backhaul CLI - expose a private HTTP service through a public relay
//!
//! `backhaul relay start` runs the public side; `backhaul agent run` runs next
//! to the private service and keeps a tunnel open to the relay.

mod config;

use anyhow::{Context, Result};
use backhaul_agent::SessionManager;
use backhaul_relay::Relay;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{
    AgentFileConfig, AgentOverrides, RelayFileConfig, RelayOverrides, DEFAULT_AGENT_CONFIG,
    DEFAULT_RELAY_CONFIG,
};

/// Backhaul - reverse HTTP tunnels through a public relay
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Backhaul - expose private HTTP services through a public relay")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error) or an EnvFilter directive
    #[arg(long, global = true, env = "BACKHAUL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Public relay
    Relay {
        #[command(subcommand)]
        command: RelayCommands,
    },
    /// Agent running next to the private service
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(Subcommand, Debug)]
enum RelayCommands {
    /// Start the relay
    #[command(long_about = r#"
Start the relay. Agents connect to the WebSocket port; public HTTP requests
arriving on the HTTP port are forwarded through a connected agent.

EXAMPLES:
  backhaul relay start
  backhaul relay start -c relay.yaml --http-port 8080 --ws-port 8081

ENVIRONMENT VARIABLES:
  BACKHAUL_RELAY_CONFIG  Config file (YAML or JSON)
    "#)]
    Start {
        /// Config file (YAML or JSON)
        #[arg(short, long, env = "BACKHAUL_RELAY_CONFIG", default_value = DEFAULT_RELAY_CONFIG)]
        config: PathBuf,

        /// Public HTTP port
        #[arg(long)]
        http_port: Option<u16>,

        /// Agent (WebSocket) port
        #[arg(long)]
        ws_port: Option<u16>,

        /// Listen address for both ports
        #[arg(long)]
        host: Option<String>,
    },
    /// Manage agent tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommands {
    /// Generate a new token
    Add {
        /// Label embedded in the token
        name: String,
    },
    /// List tokens accepted by the relay
    List {
        #[arg(short, long, env = "BACKHAUL_RELAY_CONFIG", default_value = DEFAULT_RELAY_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum AgentCommands {
    /// Connect to the relay and serve tunneled requests
    #[command(long_about = r#"
Connect to a relay and forward tunneled requests to a local HTTP service.
Reconnects automatically if the connection drops.

EXAMPLES:
  backhaul agent run --tunnel-url ws://relay.example.com:6001 \
    --auth-token $TOKEN --local-port 8080

ENVIRONMENT VARIABLES:
  BACKHAUL_AGENT_CONFIG  Config file (YAML or JSON)
  BACKHAUL_TUNNEL_URL    Relay tunnel URL
  BACKHAUL_AUTH_TOKEN    Authentication token
    "#)]
    Run {
        /// Config file (YAML or JSON)
        #[arg(short, long, env = "BACKHAUL_AGENT_CONFIG", default_value = DEFAULT_AGENT_CONFIG)]
        config: PathBuf,

        /// Relay tunnel URL (ws:// or wss://)
        #[arg(long, env = "BACKHAUL_TUNNEL_URL")]
        tunnel_url: Option<String>,

        /// Authentication token
        #[arg(long, env = "BACKHAUL_AUTH_TOKEN")]
        auth_token: Option<String>,

        /// Host of the local service
        #[arg(long)]
        local_host: Option<String>,

        /// Port of the local service
        #[arg(long)]
        local_port: Option<u16>,
    },
    /// Manage the agent config file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Write an example config file
    Init {
        #[arg(short, long, default_value = DEFAULT_AGENT_CONFIG)]
        config: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show {
        #[arg(short, long, env = "BACKHAUL_AGENT_CONFIG", default_value = DEFAULT_AGENT_CONFIG)]
        config: PathBuf,
    },
}

/// Setup logging with the specified filter
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_relay(config_path: &Path, overrides: RelayOverrides) -> Result<()> {
    let mut file_config: RelayFileConfig = config::load(config_path)?;
    file_config.apply(overrides);
    let relay_config = file_config.into_relay_config()?;

    let relay = Relay::bind(relay_config)
        .await
        .context("Failed to start relay")?;
    info!("Public HTTP on {}", relay.http_addr()?);
    info!("Agent tunnels on {}", relay.tunnel_addr()?);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    relay.run(shutdown).await.context("Relay failed")?;
    Ok(())
}

async fn run_agent(config_path: &Path, overrides: AgentOverrides) -> Result<()> {
    let mut file_config: AgentFileConfig = config::load(config_path)?;
    file_config.apply(overrides);
    let agent_config = file_config.into_agent_config()?;

    info!("Relay: {}", agent_config.tunnel_url);
    info!("Local service: {}", agent_config.target);

    let agent = SessionManager::new(agent_config).context("Failed to create agent")?;
    spawn_signal_handler(agent.shutdown_token());

    agent.run().await.context("Agent stopped")?;
    Ok(())
}

fn add_token(name: &str) {
    let token = format!("token_{}_{}", chrono::Utc::now().timestamp(), name);
    println!("{}", token);
    println!();
    println!("Add it to the relay config to accept it:");
    println!("  auth:");
    println!("    tokens:");
    println!("      - {}", token);
}

fn list_tokens(config_path: &Path) -> Result<()> {
    let config: RelayFileConfig = config::load(config_path)?;
    if !config.auth.require_auth {
        println!("Authentication disabled; any token is accepted");
    }
    for token in &config.auth.tokens {
        println!("{}", token);
    }
    Ok(())
}

fn init_agent_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let contents = serde_json::to_string_pretty(&AgentFileConfig::default())?;
    std::fs::write(path, contents + "\n")
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn show_agent_config(path: &Path) -> Result<()> {
    let config: AgentFileConfig = config::load(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    let result = match cli.command {
        Commands::Relay { command } => match command {
            RelayCommands::Start {
                config,
                http_port,
                ws_port,
                host,
            } => {
                run_relay(
                    &config,
                    RelayOverrides {
                        http_port,
                        ws_port,
                        host,
                    },
                )
                .await
            }
            RelayCommands::Token { command } => match command {
                TokenCommands::Add { name } => {
                    add_token(&name);
                    Ok(())
                }
                TokenCommands::List { config } => list_tokens(&config),
            },
        },
        Commands::Agent { command } => match command {
            AgentCommands::Run {
                config,
                tunnel_url,
                auth_token,
                local_host,
                local_port,
            } => {
                run_agent(
                    &config,
                    AgentOverrides {
                        tunnel_url,
                        auth_token,
                        local_host,
                        local_port,
                    },
                )
                .await
            }
            AgentCommands::Config { command } => match command {
                ConfigCommands::Init { config, force } => init_agent_config(&config, force),
                ConfigCommands::Show { config } => show_agent_config(&config),
            },
        },
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
