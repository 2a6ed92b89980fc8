//! Tether Agent Daemon
//!
//! Makes the device reachable through the server's reverse tunnel.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_agent::auth::fetch_server_info;
use tether_agent::Agent;
use tether_core::config::{self, AgentConfig, TransportKind};

#[derive(Parser)]
#[command(name = "tether-agent")]
#[command(about = "Tether agent - keeps the device reachable through a reverse tunnel")]
#[command(version)]
struct Args {
    /// Server address, e.g. https://cloud.example.com
    #[arg(long, env = "TETHER_SERVER_ADDRESS")]
    server_address: Option<String>,

    /// Path to the device private key (generated if missing)
    #[arg(long, env = "TETHER_PRIVATE_KEY")]
    private_key: Option<PathBuf>,

    /// Tenant the device registers under
    #[arg(long, env = "TETHER_TENANT_ID")]
    tenant_id: Option<String>,

    /// Keepalive interval in seconds
    #[arg(long, env = "TETHER_KEEPALIVE_INTERVAL")]
    keepalive_interval: Option<u64>,

    /// Hostname presented to the server (defaults to the system hostname)
    #[arg(long, env = "TETHER_PREFERRED_HOSTNAME")]
    preferred_hostname: Option<String>,

    /// Identity presented to the server (e.g. a MAC address)
    #[arg(long, env = "TETHER_PREFERRED_IDENTITY")]
    preferred_identity: Option<String>,

    /// Password hash enabling single-user mode
    #[arg(long, env = "TETHER_SINGLE_USER_PASSWORD", hide_env_values = true)]
    single_user_password: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "TETHER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Control connection transport (ssh, tcp)
    #[arg(long, env = "TETHER_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Fixed tunnel endpoint (defaults to the server's SSH endpoint)
    #[arg(long, env = "TETHER_TUNNEL_ADDRESS")]
    tunnel_address: Option<String>,

    /// Path to configuration file
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the server's public information and exit
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let config_result = if config_path.exists() {
        Some(config::load_config::<AgentConfig>(&config_path))
    } else {
        None
    };
    let (mut config, config_error) = match config_result {
        Some(Ok(config)) => (config, None),
        Some(Err(e)) => (AgentConfig::default(), Some(e)),
        None => (AgentConfig::default(), None),
    };
    apply_overrides(&mut config, args.overrides());

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.tracing_level().into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(e) = config_error {
        tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
    }

    if let Some(Command::Info) = args.command {
        if config.server_address.is_empty() {
            anyhow::bail!("Missing required field: server_address");
        }
        let info = fetch_server_info(&config.server_address)
            .await
            .context("Failed to fetch server info")?;
        println!("Version: {}", info.version);
        println!("API endpoint: {}", info.endpoints.api);
        println!("SSH endpoint: {}", info.endpoints.ssh);
        return Ok(());
    }

    config
        .validate(config::running_as_root())
        .context("Invalid configuration")?;

    let mode = if config.is_single_user() {
        "single-user"
    } else {
        "multi-user"
    };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode,
        tenant_id = %config.tenant_id,
        server_address = %config.server_address,
        transport = %config.transport,
        "Tether Agent starting"
    );

    let agent = Agent::from_config(config)
        .await
        .context("Failed to initialize agent")?;
    agent.run().await
}

/// Command-line values that take precedence over the config file
#[derive(Default)]
struct Overrides {
    server_address: Option<String>,
    private_key: Option<PathBuf>,
    tenant_id: Option<String>,
    keepalive_interval: Option<u64>,
    preferred_hostname: Option<String>,
    preferred_identity: Option<String>,
    single_user_password: Option<String>,
    log_level: Option<String>,
    transport: Option<TransportKind>,
    tunnel_address: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            server_address: self.server_address.clone(),
            private_key: self.private_key.clone(),
            tenant_id: self.tenant_id.clone(),
            keepalive_interval: self.keepalive_interval,
            preferred_hostname: self.preferred_hostname.clone(),
            preferred_identity: self.preferred_identity.clone(),
            single_user_password: self.single_user_password.clone(),
            log_level: self.log_level.clone(),
            transport: self.transport,
            tunnel_address: self.tunnel_address.clone(),
        }
    }
}

fn apply_overrides(config: &mut AgentConfig, overrides: Overrides) {
    if let Some(server_address) = overrides.server_address {
        config.server_address = server_address;
    }
    if let Some(key) = overrides.private_key {
        config.private_key_path = key;
    }
    if let Some(tenant_id) = overrides.tenant_id {
        config.tenant_id = tenant_id;
    }
    if let Some(secs) = overrides.keepalive_interval {
        config.keepalive_interval = Duration::from_secs(secs);
    }
    if overrides.preferred_hostname.is_some() {
        config.preferred_hostname = overrides.preferred_hostname;
    }
    if overrides.preferred_identity.is_some() {
        config.preferred_identity = overrides.preferred_identity;
    }
    if overrides.single_user_password.is_some() {
        config.single_user_password = overrides.single_user_password;
    }
    if let Some(level) = overrides.log_level {
        config.log_level = level;
    }
    if let Some(transport) = overrides.transport {
        config.transport = transport;
    }
    if overrides.tunnel_address.is_some() {
        config.tunnel_address = overrides.tunnel_address;
    }
}
