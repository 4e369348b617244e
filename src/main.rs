mod agent;
mod config;
mod connection;
mod fingerprint;
mod handler;
mod ssh;
mod types;

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::connection::ConnectionManager;
use crate::ssh::SshServer;

/// Name baked into the SSH banner and the environment prefix docs.
pub const APP_NAME: &str = "vigil-agent";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    let config = AgentConfig::from_env();

    // Initialize tracing; RUST_LOG wins over LOG_LEVEL when set.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let has_ssh = config.keys.is_some();
    let has_hub = config.hub_url.is_some() && config.token.is_some();
    if !has_ssh && !has_hub {
        bail!("No transport configured: set KEY for SSH and/or HUB_URL + TOKEN for WebSocket");
    }

    let cancel = CancellationToken::new();
    let agent = Arc::new(Agent::new(config.clone(), cancel.clone()).await?);
    info!(fingerprint = %agent.fingerprint(), "Agent initialized");

    // The connection manager owns the state machine and the outbound
    // WebSocket transport; the SSH server feeds it events.
    let manager = ConnectionManager::new(agent.clone());
    let events = manager.event_sink();
    tokio::spawn(manager.clone().run(cancel.clone()));

    let ssh_future: std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> =
        if has_ssh {
            let server = SshServer::new(agent.clone(), events)?;
            let server_cancel = cancel.clone();
            Box::pin(async move { server.run(server_cancel).await })
        } else {
            warn!("KEY not set — inbound SSH transport disabled");
            Box::pin(std::future::pending())
        };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            cancel.cancel();
            // Give collector subprocesses a moment to be reaped.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(())
        }
        // A bind failure or accept-loop error is fatal.
        result = ssh_future => result,
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => {
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
