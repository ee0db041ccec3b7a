//! Daemon Server Implementation
//!
//! Builds the long-lived [`Conductor`] from configuration and serves the
//! client-facing router until SIGINT or SIGTERM.
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!     HTTP client     WS session      WS session
//!     (NDJSON)        (conv c1)       (conv c2)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                     Conductor
//!               (pool, router, sessions)
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use conductor_core::{
    transport, Conductor, ConductorConfig, MemoryStore, StaticTokenAuthenticator, UserId,
};

/// The main daemon server
pub struct DaemonServer {
    config: ConductorConfig,
    conductor: Arc<Conductor>,
}

impl DaemonServer {
    /// Build the conductor; with `issue_token`, mint and print a token for
    /// that user
    pub fn new(config: ConductorConfig, issue_token: Option<&str>) -> Result<Self> {
        let mut auth = StaticTokenAuthenticator::from_map(&config.auth_tokens);
        if let Some(user) = issue_token {
            let token = auth.issue(UserId::from(user));
            info!(user, "Issued development token");
            println!("{token}");
        }
        if auth.is_empty() {
            warn!("No bearer tokens configured; every request will be rejected");
        }

        let store = Arc::new(MemoryStore::new());
        let conductor = Conductor::from_config(&config, store, Arc::new(auth))
            .context("failed to build conductor")?;

        Ok(Self {
            config,
            conductor: Arc::new(conductor),
        })
    }

    /// Serve until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!(%addr, pool_size = self.conductor.pool_stats().size, "Chat conductor ready");
        transport::serve(listener, Arc::clone(&self.conductor), shutdown_signal())
            .await
            .context("server error")?;

        info!("Daemon stopped");
        Ok(())
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
