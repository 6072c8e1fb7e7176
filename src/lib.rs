pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod naming;
pub mod postgres;
pub mod resources;

pub use client::{ClusterClient, KubeClient, Managed};
pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, Requeue, Result, error_policy, reconcile, reconcile_cluster,
};
pub use crd::PostgresCluster;
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use kube::runtime::Controller;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Number of clusters reconciled in parallel
const CONCURRENCY: u16 = 2;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the PostgresCluster controller until `cancel` fires.
///
/// Watches PostgresCluster resources and every kind the operator creates for
/// them, scoped to `config.watch_namespace` when set. In-flight reconciles
/// see the same token and stop at their next platform call.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    cancel: CancellationToken,
) {
    let namespace = config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    tracing::info!(
        scope = namespace.unwrap_or("cluster-wide"),
        "Starting controller for PostgresCluster resources"
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let mut ctx = Context::new(KubeClient::new(client.clone()), config)
        .with_cancellation(cancel.clone());
    if let Some(state) = health_state {
        ctx = ctx.with_health_state(state);
    }
    let ctx = Arc::new(ctx);

    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(clusters, watcher_config.clone())
        .with_config(ControllerConfig::default().concurrency(CONCURRENCY))
        .owns(
            scoped_api::<StatefulSet>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<Deployment>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<Service>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<Endpoints>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<ConfigMap>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<Secret>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(scoped_api::<Job>(client, namespace), watcher_config)
        .graceful_shutdown_on(cancel.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Watch events for dependents can arrive after their
                    // cluster was deleted
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::info!("Controller stopped");
}
