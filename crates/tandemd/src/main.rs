#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tandemd::config::{Args, ServerConfig};
use tandemd::error::TandemError;
use tandemd::metrics::{start_metrics_server, HealthState};
use tandemd::registry::MatchRegistry;
use tandemd::run;
use tandemd::server::ServerState;
use tandemd::store::SnapshotStore;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config: ServerConfig = args.into();
    config.validate().map_err(TandemError::Config)?;

    let store = SnapshotStore::new(config.state_file.clone());
    let registry = Arc::new(MatchRegistry::open(store, config.cooldown()));
    let stats = registry.stats();
    info!(
        waiting = stats.waiting,
        sessions = stats.sessions,
        admins = config.admin_ids.len(),
        "registry ready"
    );

    let health_state = HealthState::new();
    let state = Arc::new(ServerState::new(
        config.clone(),
        registry,
        health_state.clone(),
    ));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
            warn!("metrics server error: {}", e);
        }
    });

    tokio::select! {
        result = run(listener, state) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}
