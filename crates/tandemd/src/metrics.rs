use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Attached gateway count, shared by the accept loop, the gateway port and
/// `/ready`. Ready while at least one gateway is attached.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    gateways: Arc<AtomicUsize>,
}

impl HealthState {
    /// Create a new state with no gateway attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a gateway slot unless `max` are already attached.
    pub fn try_attach(&self, max: usize) -> bool {
        self.gateways
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Release a slot taken by [`try_attach`](Self::try_attach).
    pub fn detach(&self) {
        let _ = self
            .gateways
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Number of attached gateways.
    #[must_use]
    pub fn gateways(&self) -> usize {
        self.gateways.load(Ordering::SeqCst)
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.gateways() > 0
    }
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the HTTP server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// 200 while a gateway is attached, 503 otherwise.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "no gateway",
                ready: false,
            }),
        )
    }
}

/// Level gauges.
pub mod gauges {
    /// Increment the connected gateways gauge.
    pub fn inc_gateways_active() {
        metrics::gauge!("tandem_gateways_active").increment(1.0);
    }

    /// Decrement the connected gateways gauge.
    pub fn dec_gateways_active() {
        metrics::gauge!("tandem_gateways_active").decrement(1.0);
    }

    /// Publish the waiting queue length.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_len(len: usize) {
        metrics::gauge!("tandem_queue_len").set(len as f64);
    }

    /// Publish the number of active pairs.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_sessions_active(count: usize) {
        metrics::gauge!("tandem_sessions_active").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Increment the pairs-formed counter.
    pub fn matches_total() {
        metrics::counter!("tandem_matches_total").increment(1);
    }

    /// Record a session teardown with the given reason label.
    pub fn sessions_ended_total(reason: &'static str) {
        metrics::counter!("tandem_sessions_ended_total", "reason" => reason).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("tandem_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("tandem_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record a monitor mirror attempt with the given status label.
    pub fn mirrors_total(status: &'static str) {
        metrics::counter!("tandem_mirrors_total", "status" => status).increment(1);
    }

    /// Increment the snapshot save/remove failure counter.
    pub fn snapshot_failures_total() {
        metrics::counter!("tandem_snapshot_failures_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record event handling time in seconds.
    pub fn event_latency_seconds(value: f64) {
        metrics::histogram!("tandem_event_latency_seconds").record(value);
    }
}
