use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;

use crate::client::ClusterClient;
use crate::config::OperatorConfig;
use crate::controller::error::BackoffConfig;
use crate::crd::PostgresCluster;
use crate::health::HealthState;

/// Shared context for the controller
pub struct Context<C> {
    /// Platform client
    pub client: C,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Cancelled when the operator shuts down; in-flight stages stop at the
    /// next platform call
    pub cancel: CancellationToken,
    /// Retry delays for failed reconciles
    pub backoff: BackoffConfig,
    /// Metrics sink, absent in tests
    pub health_state: Option<Arc<HealthState>>,
    /// Consecutive failed reconciles per `namespace/name`
    failures: Mutex<HashMap<String, u32>>,
}

impl<C: ClusterClient> Context<C> {
    pub fn new(client: C, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            cancel: CancellationToken::new(),
            backoff: BackoffConfig::default(),
            health_state: None,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Count a failed reconcile. Returns the number of failures in a row
    /// before this one, which is the backoff attempt to use.
    pub fn record_failure(&self, namespace: &str, name: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(format!("{}/{}", namespace, name)).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        attempt
    }

    /// Forget earlier failures after a successful reconcile
    pub fn reset_failures(&self, namespace: &str, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&format!("{}/{}", namespace, name));
    }

    /// Publish a Normal event for the cluster
    pub async fn publish_normal_event(&self, cluster: &PostgresCluster, reason: &str, note: &str) {
        self.client
            .publish_event(cluster, EventType::Normal, reason, note)
            .await
    }

    /// Publish a Warning event for the cluster
    pub async fn publish_warning_event(&self, cluster: &PostgresCluster, reason: &str, note: &str) {
        self.client
            .publish_event(cluster, EventType::Warning, reason, note)
            .await
    }
}
