//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  liveness, always 200 while the process runs
//!   GET /readyz   200 once at least one vault is unlocked

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use pvault_model::SharedModel;
use pvault_sync::SyncEvent;
use std::sync::Arc;
use tokio::sync::broadcast;

type Labels = Vec<(String, String)>;

/// Counters fed from the sync event stream.
#[derive(Clone, Default)]
pub struct SyncMetrics {
    pub rounds: Counter,
    pub syncs: Family<Labels, Counter>,
    pub items: Family<Labels, Counter>,
    pub served: Counter,
    pub pairings: Family<Labels, Counter>,
    pub unlocked_vaults: Gauge,
}

impl SyncMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register("pvault_sync_rounds", "Scheduler rounds that attempted a sync", self.rounds.clone());
        registry.register("pvault_syncs", "Vault syncs by outcome", self.syncs.clone());
        registry.register("pvault_items", "Items transferred by direction", self.items.clone());
        registry.register("pvault_served", "Pull or push requests answered for peers", self.served.clone());
        registry.register("pvault_pairings", "Pairing attempts by outcome", self.pairings.clone());
        registry.register("pvault_unlocked_vaults", "Vaults currently unlocked", self.unlocked_vaults.clone());
    }

    pub fn observe(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Synced { pulled, pushed, .. } => {
                self.syncs.get_or_create(&label("outcome", "ok")).inc();
                self.items.get_or_create(&label("direction", "pulled")).inc_by(*pulled as u64);
                self.items.get_or_create(&label("direction", "pushed")).inc_by(*pushed as u64);
            }
            SyncEvent::SyncFailed { .. } => {
                self.syncs.get_or_create(&label("outcome", "failed")).inc();
            }
            SyncEvent::Served { .. } => {
                self.served.inc();
            }
            SyncEvent::RoundFinished { .. } => {
                self.rounds.inc();
            }
            SyncEvent::PairingCompleted { .. } => {
                self.pairings.get_or_create(&label("outcome", "completed")).inc();
            }
            SyncEvent::PairingFailed { .. } => {
                self.pairings.get_or_create(&label("outcome", "failed")).inc();
            }
        }
    }

    /// Feed `events` into the counters until the channel closes.
    pub async fn record(self, mut events: broadcast::Receiver<SyncEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.observe(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "metrics: sync events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

fn label(key: &str, value: &str) -> Labels {
    vec![(key.to_string(), value.to_string())]
}

#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub model: SharedModel,
    pub metrics: SyncMetrics,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9170")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn unlocked(model: &SharedModel) -> usize {
    model.lock().await.get_vaults().iter().filter(|v| !v.locked).count()
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    state.metrics.unlocked_vaults.set(unlocked(&state.model).await as i64);

    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if unlocked(&state.model).await > 0 {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no unlocked vault")
    }
}
