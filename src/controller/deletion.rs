//! Cleanup when a PostgresCluster is deleted
//!
//! Dependents are removed by the garbage collector through their owner
//! references. The finalizer only holds the cluster until every instance
//! StatefulSet it controls has been scaled to zero, so PostgreSQL shuts down
//! cleanly before its pods are deleted.

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::ownership::is_controlled_by;
use crate::controller::result::Requeue;
use crate::crd::PostgresCluster;
use crate::naming::FINALIZER;
use crate::resources::common::instance_selector;

/// How long to wait for instance pods to stop
pub const DELETION_REQUEUE: Duration = Duration::from_secs(5);

/// Check if the cluster carries the cleanup finalizer
pub fn has_finalizer(cluster: &PostgresCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER)
}

/// Register the cleanup finalizer. Returns the updated cluster, or `None`
/// when it was already registered.
pub async fn add_finalizer<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
) -> Result<Option<PostgresCluster>> {
    if has_finalizer(cluster) {
        return Ok(None);
    }
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = json!({
        "metadata": {
            "resourceVersion": cluster.resource_version(),
            "finalizers": finalizers,
        }
    });
    let updated = ctx
        .client
        .merge_patch::<PostgresCluster>(
            &cluster.namespace().unwrap_or_default(),
            &cluster.name_any(),
            &patch,
        )
        .await?;
    info!("Added finalizer");
    Ok(Some(updated))
}

/// Scale every instance set down, then release the finalizer
pub async fn handle_delete<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
) -> Result<Requeue> {
    if !has_finalizer(cluster) {
        debug!("Finalizer already removed");
        return Ok(Requeue::None);
    }

    let ns = cluster.namespace().unwrap_or_default();
    let mut pods_remaining = false;

    // Sets removed from the spec still have their StatefulSets, so find them
    // by label rather than by the names the spec lists
    let selector = instance_selector(cluster);
    for sts in ctx.client.list::<StatefulSet>(&ns, &selector).await? {
        let name = sts.name_any();
        if !is_controlled_by(cluster, sts.meta()) {
            debug!(statefulset = %name, "Skipping StatefulSet controlled by someone else");
            continue;
        }

        let desired = sts.spec.as_ref().and_then(|s| s.replicas);
        if desired != Some(0) {
            let patch = json!({
                "metadata": { "resourceVersion": sts.resource_version() },
                "spec": { "replicas": 0 },
            });
            ctx.client
                .merge_patch::<StatefulSet>(&ns, &name, &patch)
                .await?;
            info!(statefulset = %name, "Scaled instance set to zero");
            pods_remaining = true;
        }

        let running = sts.status.as_ref().map(|s| s.replicas).unwrap_or(0);
        if running > 0 {
            debug!(statefulset = %name, running, "Waiting for instance pods to stop");
            pods_remaining = true;
        }
    }

    if pods_remaining {
        return Ok(Requeue::After(DELETION_REQUEUE));
    }

    let finalizers: Vec<String> = cluster
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    let patch = json!({
        "metadata": {
            "resourceVersion": cluster.resource_version(),
            "finalizers": finalizers,
        }
    });
    ctx.client
        .merge_patch::<PostgresCluster>(&ns, &cluster.name_any(), &patch)
        .await?;
    info!("Removed finalizer");

    ctx.publish_normal_event(cluster, "DeletionComplete", "Cluster resources released")
        .await;
    Ok(Requeue::None)
}
