//! Chat Conductor Daemon
//!
//! Serves the chat conductor over HTTP and WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 127.0.0.1:8000, Ollama at localhost:11434
//! chat-conductor-daemon
//!
//! # Mint a development token for user "alice"
//! chat-conductor-daemon --issue-token alice
//!
//! # Custom config file and backend
//! chat-conductor-daemon --config ./conductor.toml --backend-url http://gpu-box:11434
//!
//! # With verbose logging
//! RUST_LOG=debug chat-conductor-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `OLLAMA_BASE_URL`: Inference backend base URL
//! - `CONDUCTOR_BIND`: Listen address
//! - `CONDUCTOR_POOL_SIZE`: Number of backend connections
//! - `CONDUCTOR_DEFAULT_MODEL`: Model used when none is requested
//! - `CONDUCTOR_MAX_TURNS`: Prior turns kept in the prompt
//! - `TAVILY_API_KEY`: Fallback web search credential
//! - `RUST_LOG`: Log filter
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (closes live sessions)

mod server;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use conductor_core::{load_config_from_path, ConfigOverrides};

use crate::server::DaemonServer;

/// Chat conductor daemon
#[derive(Debug, Parser)]
#[command(name = "chat-conductor-daemon", version, about)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/kunlab/conductor.toml)
    #[arg(long, env = "CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, host:port
    #[arg(long)]
    bind: Option<String>,

    /// Inference backend base URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Number of backend connections (0 = number of CPUs)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Model used when neither the request nor the conversation names one
    #[arg(long)]
    default_model: Option<String>,

    /// Log filter directive added to RUST_LOG (e.g. `debug`)
    #[arg(long)]
    log_level: Option<String>,

    /// Mint a bearer token for this user id and print it at startup
    #[arg(long, value_name = "USER")]
    issue_token: Option<String>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref bind) = self.bind {
            overrides = overrides.with_bind_address(bind.clone());
        }
        if let Some(ref url) = self.backend_url {
            overrides = overrides.with_backend_url(url.clone());
        }
        if let Some(size) = self.pool_size {
            overrides = overrides.with_pool_size(size);
        }
        if let Some(ref model) = self.default_model {
            overrides = overrides.with_default_model(model.clone());
        }
        overrides
    }
}

fn init_logging(level: Option<&str>) -> anyhow::Result<()> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("chat_conductor_daemon=info".parse()?)
        .add_directive("conductor_core=info".parse()?);
    if let Some(level) = level {
        filter = filter.add_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level '{level}'"))?,
        );
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref())?;

    info!("Starting Chat Conductor Daemon");
    info!("PID: {}", std::process::id());

    let config_path = args
        .config
        .clone()
        .or_else(conductor_core::default_config_path);
    let mut config = load_config_from_path(config_path).context("failed to load configuration")?;

    args.overrides().apply(&mut config);
    config.validate().context("invalid configuration")?;

    info!(
        source = %config.source(),
        sources = ?config.sources(),
        file = ?config.config_file_path,
        bind = %config.bind_address,
        backend = %config.backend.base_url,
        "Configuration loaded"
    );

    let server = DaemonServer::new(config, args.issue_token.as_deref())?;
    server.run().await
}
