//! Reconciliation logic for PostgresCluster resources
//!
//! One attempt fetches the cluster, applies defaults in memory, handles
//! deletion or a reserved name, runs the stage pipeline and finally writes
//! the status back when it changed.

use std::sync::Arc;
use std::time::Instant;

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ClusterClient;
use crate::controller::context::Context;
use crate::controller::deletion;
use crate::controller::error::{Error, Result};
use crate::controller::pipeline::{PipelineState, run_pipeline};
use crate::controller::result::Requeue;
use crate::controller::status::status_patch;
use crate::crd::{PostgresCluster, PostgresClusterStatus};
use crate::naming::RESERVED_CLUSTER_NAME;

/// Reconcile the cluster `namespace/name` once.
///
/// A cluster that no longer exists is not an error. Status is written only
/// when the whole pipeline succeeded and the result differs from what was
/// stored.
pub async fn reconcile_cluster<C: ClusterClient>(
    ctx: &Context<C>,
    namespace: &str,
    name: &str,
) -> Result<Requeue> {
    let Some(mut cluster) = ctx.client.get::<PostgresCluster>(namespace, name).await? else {
        debug!("PostgresCluster no longer exists");
        return Ok(Requeue::None);
    };

    cluster.set_defaults();
    let before = cluster.status.clone();

    if cluster.metadata.deletion_timestamp.is_some() {
        info!("Handling deletion");
        return deletion::handle_delete(ctx, &cluster)
            .await
            .map_err(|e| Error::Deletion(Box::new(e)));
    }

    if cluster.name_any() == RESERVED_CLUSTER_NAME {
        warn!("Refusing to reconcile a cluster with a reserved name");
        ctx.publish_warning_event(
            &cluster,
            "InvalidName",
            &format!("{:?} is not allowed", RESERVED_CLUSTER_NAME),
        )
        .await;
        return Ok(Requeue::None);
    }

    if let Some(updated) = deletion::add_finalizer(ctx, &cluster).await? {
        cluster.metadata.resource_version = updated.metadata.resource_version;
        cluster.metadata.finalizers = updated.metadata.finalizers;
    }

    let mut state = PipelineState::new(before.clone());
    let requeue = run_pipeline(ctx, &cluster, &mut state).await?;

    let mut after = state.status;
    after.observed_generation = cluster.metadata.generation;
    record_instances(ctx, &cluster, &after);

    if before.as_ref() != Some(&after) {
        let patch = status_patch(before.as_ref(), &after, cluster.resource_version())?;
        ctx.client
            .patch_status::<PostgresCluster>(namespace, name, &patch)
            .await?;
        debug!(observed_generation = ?after.observed_generation, "Updated status");
    }

    Ok(requeue)
}

fn record_instances<C>(ctx: &Context<C>, cluster: &PostgresCluster, status: &PostgresClusterStatus) {
    if let Some(health) = &ctx.health_state {
        let desired = status.instances.iter().map(|i| i64::from(i.replicas)).sum();
        let ready = status
            .instances
            .iter()
            .map(|i| i64::from(i.ready_replicas))
            .sum();
        health.metrics.set_cluster_instances(
            &cluster.namespace().unwrap_or_default(),
            &cluster.name_any(),
            desired,
            ready,
        );
    }
}

/// Entry point for `kube::runtime::Controller`
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile<C: ClusterClient>(
    cluster: Arc<PostgresCluster>,
    ctx: Arc<Context<C>>,
) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let start = Instant::now();

    info!("Reconciling PostgresCluster");

    let deadline = ctx.config.reconcile_timeout;
    let result = match tokio::time::timeout(deadline, reconcile_cluster(&ctx, &ns, &name)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(deadline)),
    };

    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .record_reconcile(&ns, &name, start.elapsed().as_secs_f64());
        match &result {
            Ok(_) => health.touch(),
            Err(e) => {
                let stage = e.stage().map(|s| s.to_string());
                health.metrics.record_error(&ns, &name, stage.as_deref());
            }
        }
    }

    match result {
        Ok(requeue) => {
            ctx.reset_failures(&ns, &name);
            info!(?requeue, "Reconciliation completed successfully");
            Ok(requeue.into())
        }
        Err(e) => {
            error!(error = %e, "Reconciliation failed");
            Err(e)
        }
    }
}

/// Error policy for the controller with exponential backoff. The delay grows
/// with each failure in a row and starts over after a success.
pub fn error_policy<C: ClusterClient>(
    cluster: Arc<PostgresCluster>,
    error: &Error,
    ctx: Arc<Context<C>>,
) -> Action {
    let name = cluster.name_any();
    let attempt = ctx.record_failure(&cluster.namespace().unwrap_or_default(), &name);
    let delay = ctx.backoff.delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(%name, error = %error, attempt, ?delay, "Retryable error, requeuing");
    } else {
        error!(%name, error = %error, ?delay, "Non-retryable error, requeuing for manual intervention");
    }

    Action::requeue(delay)
}
