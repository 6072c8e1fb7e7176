//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the controller running?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels identifying a cluster
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ReconcileLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for failures attributed to a pipeline stage
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StageLabels {
    pub stage: String,
}

impl prometheus_client::encoding::EncodeLabelSet for StageLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("stage", self.stage.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    /// Failures by the stage that produced them
    pub stage_failures_total: Family<StageLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// Desired instances per cluster
    pub cluster_instances_desired: Family<ReconcileLabels, Gauge>,
    /// Ready instances per cluster
    pub cluster_instances_ready: Family<ReconcileLabels, Gauge>,
    /// Unix time of the last reconcile that finished without error
    pub last_success_timestamp_seconds: Gauge,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "postgres_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "postgres_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let stage_failures_total = Family::<StageLabels, Counter>::default();
        registry.register(
            "postgres_operator_stage_failures",
            "Total number of pipeline stage failures",
            stage_failures_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "postgres_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let cluster_instances_desired = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "postgres_operator_cluster_instances_desired",
            "Desired number of PostgreSQL instances for each cluster",
            cluster_instances_desired.clone(),
        );

        let cluster_instances_ready = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "postgres_operator_cluster_instances_ready",
            "Number of ready PostgreSQL instances for each cluster",
            cluster_instances_ready.clone(),
        );

        let last_success_timestamp_seconds = Gauge::default();
        registry.register(
            "postgres_operator_last_success_timestamp_seconds",
            "Unix time of the last reconciliation that completed without error",
            last_success_timestamp_seconds.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            stage_failures_total,
            reconcile_duration_seconds,
            cluster_instances_desired,
            cluster_instances_ready,
            last_success_timestamp_seconds,
            registry,
        }
    }

    fn labels(namespace: &str, name: &str) -> ReconcileLabels {
        ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Record a finished reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = Self::labels(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation, attributed to `stage` when known
    pub fn record_error(&self, namespace: &str, name: &str, stage: Option<&str>) {
        self.reconciliation_errors_total
            .get_or_create(&Self::labels(namespace, name))
            .inc();
        if let Some(stage) = stage {
            self.stage_failures_total
                .get_or_create(&StageLabels {
                    stage: stage.to_string(),
                })
                .inc();
        }
    }

    /// Update instance counts of a cluster
    pub fn set_cluster_instances(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = Self::labels(namespace, name);
        self.cluster_instances_desired
            .get_or_create(&labels)
            .set(desired);
        self.cluster_instances_ready.get_or_create(&labels).set(ready);
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the controller is running
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Remember when a reconcile last succeeded
    pub fn touch(&self) {
        self.metrics
            .last_success_timestamp_seconds
            .set(chrono::Utc::now().timestamp());
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the controller is running.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve health and metrics endpoints on all interfaces at `port`
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Health server listening");

    axum::serve(listener, app).await
}
