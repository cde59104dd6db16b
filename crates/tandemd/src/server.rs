use crate::config::ServerConfig;
use crate::error::TandemError;
use crate::gateway::handle_gateway;
use crate::metrics::HealthState;
use crate::notify::{ActionQueue, GatewayPort, NotificationPort};
use crate::registry::MatchRegistry;
use crate::relay::RelayRouter;
use std::sync::Arc;
use std::time::Duration;
use tandem_common::wire::GatewayAction;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Outbound actions queued before delivery is rejected.
pub const ACTION_BUFFER: usize = 1024;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const REFUSAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state for the daemon.
pub struct ServerState {
    /// Runtime configuration.
    pub config: ServerConfig,
    /// Queue and session bookkeeping.
    pub registry: Arc<MatchRegistry>,
    /// Command and message dispatcher.
    pub router: RelayRouter,
    /// Outbound side used by the router.
    pub port: GatewayPort,
    /// Actions waiting for a gateway writer.
    pub queue: ActionQueue,
    /// Attached gateway count, exposed on `/ready`.
    pub health: HealthState,
}

impl ServerState {
    /// Wire the router and gateway port around `registry`.
    #[must_use]
    pub fn new(config: ServerConfig, registry: Arc<MatchRegistry>, health: HealthState) -> Self {
        let (port, queue) = GatewayPort::new(
            ACTION_BUFFER,
            health.clone(),
            config.monitor_chat,
            config.admin_ids.clone(),
        );
        let notifier: Arc<dyn NotificationPort> = Arc::new(port.clone());
        let router = RelayRouter::new(registry.clone(), notifier, &config);
        Self {
            config,
            registry,
            router,
            port,
            queue,
            health,
        }
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), TandemError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop until the sender behind `shutdown_rx` signals or is
/// dropped.
///
/// In-flight gateways get a bounded grace period to finish.
///
/// # Errors
///
/// Returns an error if the listener address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), TandemError> {
    let local_addr = listener.local_addr()?;
    info!("gateway listener on {}", local_addr);
    let task_tracker = Arc::new(tokio::sync::Notify::new());
    let mut active_tasks: usize = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let max = state.config.max_gateways;
                        if !state.health.try_attach(max) {
                            warn!("max gateways reached, rejecting {}", addr);
                            tokio::spawn(refuse(stream, max));
                            continue;
                        }
                        let state = Arc::clone(&state);
                        let tracker = task_tracker.clone();
                        active_tasks += 1;
                        tokio::spawn(async move {
                            if let Err(e) = handle_gateway(stream, addr, state).await {
                                debug!("gateway {} closed: {}", addr, e);
                            }
                            tracker.notify_one();
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} gateways", active_tasks);
                break;
            }
        }
    }

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while active_tasks > 0 {
        if tokio::time::timeout_at(deadline, task_tracker.notified())
            .await
            .is_err()
        {
            warn!(
                "drain timeout reached with {} gateways still attached",
                active_tasks
            );
            break;
        }
        active_tasks = active_tasks.saturating_sub(1);
    }

    info!("server shut down gracefully");
    Ok(())
}

/// Tell a connection over the gateway limit why it is being closed.
async fn refuse(mut stream: TcpStream, max: usize) {
    let refusal = GatewayAction::Error {
        error: format!("gateway limit reached ({max})"),
    };
    let line = refusal.to_line();
    let write = stream.write_all(line.as_bytes());
    match tokio::time::timeout(REFUSAL_TIMEOUT, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("refusal not sent: {}", e),
        Err(_) => debug!("refusal write timed out"),
    }
}
