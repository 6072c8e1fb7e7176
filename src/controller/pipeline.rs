//! Ordered sub-resource pipeline
//!
//! Every reconcile walks [`PIPELINE`] front to back. A stage reads what the
//! stages before it produced from [`PipelineState`], writes its own outputs
//! there, and returns a [`Requeue`]. The first error stops the walk; objects
//! written by earlier stages stay in place and the next reconcile picks up
//! from the start.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::client::{ClusterClient, Managed};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::ownership::{assign_owner, is_controlled_by};
use crate::controller::result::Requeue;
use crate::controller::status::{ConditionBuilder, condition_types};
use crate::crd::{
    BackupStatus, Condition, PgBouncerStatus, PostgresCluster, PostgresClusterStatus,
};
use crate::naming::{self, ROOT_CA_SECRET, TLS_CA_KEY, TLS_CERT_KEY, TLS_KEY_KEY};
use crate::postgres::{HBAs, ParameterSet};
use crate::resources::certificate::{
    LeafCertificate, RootCertificateAuthority, cluster_dns_names, generate_cluster_cert_secret,
    generate_root_ca_secret,
};
use crate::resources::{backup, instance, patroni, pgbouncer, secret, service};

/// How long to wait before checking on stanza creation again
pub const BACKUP_REQUEUE: Duration = Duration::from_secs(10);

/// Steps of a reconcile, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    PatroniStatus,
    BootstrapUserSecret,
    ClusterConfigMap,
    RootCertificate,
    ClusterPodService,
    PatroniLeaderLease,
    ClusterPrimaryService,
    ClusterCertificate,
    PatroniDistributedConfiguration,
    PatroniDynamicConfiguration,
    InstanceSets,
    Backup,
    PgBouncer,
}

/// The fixed stage order
pub const PIPELINE: [Stage; 13] = [
    Stage::PatroniStatus,
    Stage::BootstrapUserSecret,
    Stage::ClusterConfigMap,
    Stage::RootCertificate,
    Stage::ClusterPodService,
    Stage::PatroniLeaderLease,
    Stage::ClusterPrimaryService,
    Stage::ClusterCertificate,
    Stage::PatroniDistributedConfiguration,
    Stage::PatroniDynamicConfiguration,
    Stage::InstanceSets,
    Stage::Backup,
    Stage::PgBouncer,
];

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outputs stages hand to later stages, plus the status being built
#[derive(Default)]
pub struct PipelineState {
    pub status: PostgresClusterStatus,
    pub user_secret: Option<Secret>,
    pub hbas: Option<HBAs>,
    pub parameters: Option<ParameterSet>,
    pub root_ca: Option<RootCertificateAuthority>,
    pub pod_service: Option<Service>,
    pub leader_service: Option<Service>,
    pub primary_service: Option<Service>,
    pub cluster_certificate: Option<Secret>,
    pub distributed_configuration: Option<Endpoints>,
    pub instance_names: Option<Vec<String>>,
}

impl PipelineState {
    /// Start from the status stored on the cluster
    pub fn new(status: Option<PostgresClusterStatus>) -> Self {
        Self {
            status: status.unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn required<'a, T>(output: &'a Option<T>, name: &'static str) -> Result<&'a T> {
    output.as_ref().ok_or(Error::MissingOutput(name))
}

fn namespace(cluster: &PostgresCluster) -> String {
    cluster.namespace().unwrap_or_default()
}

/// Write `intent` given what is stored (`existing`).
///
/// Ownership is checked against the stored object before anything is
/// written, so an object controlled by someone else is never touched. The
/// write is conditional on the stored resourceVersion.
pub async fn apply_owned<C, K>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    mut intent: K,
    existing: Option<K>,
    exclusive: bool,
) -> Result<K>
where
    C: ClusterClient,
    K: Managed,
{
    let ns = namespace(cluster);
    match existing {
        None => {
            assign_owner(cluster, intent.meta_mut(), exclusive)?;
            debug!(kind = %K::kind(&()), name = %intent.name_any(), "Creating");
            ctx.client.create(&ns, &intent).await
        }
        Some(current) => {
            let mut stored = current.meta().clone();
            assign_owner(cluster, &mut stored, exclusive)?;
            let meta = intent.meta_mut();
            meta.owner_references = stored.owner_references;
            meta.resource_version = stored.resource_version;
            ctx.client.apply(&ns, &intent).await
        }
    }
}

/// Create or update `intent` with this cluster as its controller
pub async fn upsert<C, K>(ctx: &Context<C>, cluster: &PostgresCluster, intent: K) -> Result<K>
where
    C: ClusterClient,
    K: Managed,
{
    let existing = ctx
        .client
        .get::<K>(&namespace(cluster), &intent.name_any())
        .await?;
    apply_owned(ctx, cluster, intent, existing, true).await
}

/// Delete an object only when this cluster controls it
async fn delete_controlled<C, K>(ctx: &Context<C>, cluster: &PostgresCluster, name: &str) -> Result<()>
where
    C: ClusterClient,
    K: Managed,
{
    let ns = namespace(cluster);
    if let Some(obj) = ctx.client.get::<K>(&ns, name).await?
        && is_controlled_by(cluster, obj.meta())
    {
        info!(kind = %K::kind(&()), name, "Deleting");
        ctx.client.delete::<K>(&ns, name).await?;
    }
    Ok(())
}

impl Stage {
    async fn run<C: ClusterClient>(
        self,
        ctx: &Context<C>,
        cluster: &PostgresCluster,
        state: &mut PipelineState,
    ) -> Result<Requeue> {
        match self {
            Stage::PatroniStatus => observe_patroni_status(ctx, cluster, state).await,
            Stage::BootstrapUserSecret => ensure_user_secret(ctx, cluster, state).await,
            Stage::ClusterConfigMap => ensure_cluster_config_map(ctx, cluster, state).await,
            Stage::RootCertificate => ensure_root_certificate(ctx, cluster, state).await,
            Stage::ClusterPodService => ensure_pod_service(ctx, cluster, state).await,
            Stage::PatroniLeaderLease => ensure_leader_service(ctx, cluster, state).await,
            Stage::ClusterPrimaryService => ensure_primary_service(ctx, cluster, state).await,
            Stage::ClusterCertificate => ensure_cluster_certificate(ctx, cluster, state).await,
            Stage::PatroniDistributedConfiguration => {
                ensure_distributed_configuration(ctx, cluster, state).await
            }
            Stage::PatroniDynamicConfiguration => {
                ensure_dynamic_configuration(ctx, cluster, state).await
            }
            Stage::InstanceSets => ensure_instance_sets(ctx, cluster, state).await,
            Stage::Backup => ensure_backup(ctx, cluster, state).await,
            Stage::PgBouncer => ensure_pgbouncer(ctx, cluster, state).await,
        }
    }
}

/// Run every stage in order, stopping at the first error.
///
/// Cancellation is checked before each stage and raced against the stage
/// itself, so a shutdown stops at the next platform call.
pub async fn run_pipeline<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let mut requeue = Requeue::None;
    for stage in PIPELINE {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled.in_stage(stage));
        }
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
            outcome = stage.run(ctx, cluster, state) => outcome,
        };
        let outcome = outcome.map_err(|e| e.in_stage(stage))?;
        debug!(%stage, ?outcome, "Stage complete");
        requeue = requeue.merge(outcome);
    }
    Ok(requeue)
}

async fn observe_patroni_status<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let dcs = ctx
        .client
        .get::<Endpoints>(
            &namespace(cluster),
            &naming::patroni_distributed_configuration(cluster),
        )
        .await?;
    if let Some(id) = dcs.as_ref().and_then(patroni::system_identifier) {
        state
            .status
            .patroni
            .get_or_insert_with(Default::default)
            .system_identifier = Some(id);
    }
    Ok(Requeue::None)
}

async fn ensure_user_secret<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let existing = ctx
        .client
        .get::<Secret>(&namespace(cluster), &naming::cluster_user_secret(cluster))
        .await?;
    let intent = secret::generate_user_secret(cluster, existing.as_ref());
    state.user_secret = Some(apply_owned(ctx, cluster, intent, existing, true).await?);
    Ok(Requeue::None)
}

async fn ensure_cluster_config_map<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let hbas = patroni::cluster_hbas(cluster);
    let parameters = patroni::cluster_parameters(cluster);
    let intent = patroni::generate_cluster_config_map(cluster, &hbas, &parameters)?;
    upsert::<_, ConfigMap>(ctx, cluster, intent).await?;
    state.hbas = Some(hbas);
    state.parameters = Some(parameters);
    Ok(Requeue::None)
}

async fn ensure_root_certificate<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let existing = ctx
        .client
        .get::<Secret>(&namespace(cluster), ROOT_CA_SECRET)
        .await?;
    let root = RootCertificateAuthority::from_secret_or_generate(existing.as_ref())?;
    let intent = generate_root_ca_secret(cluster, &root);
    // Shared by every cluster in the namespace, so never the controller
    apply_owned(ctx, cluster, intent, existing, false).await?;
    state.root_ca = Some(root);
    Ok(Requeue::None)
}

async fn ensure_pod_service<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let intent = service::generate_pod_service(cluster);
    state.pod_service = Some(upsert(ctx, cluster, intent).await?);
    Ok(Requeue::None)
}

async fn ensure_leader_service<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let intent = service::generate_leader_service(cluster);
    state.leader_service = Some(upsert(ctx, cluster, intent).await?);
    Ok(Requeue::None)
}

async fn ensure_primary_service<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let leader = required(&state.leader_service, "leader service")?;
    let leader_ip = service::cluster_ip(leader)
        .ok_or_else(|| {
            Error::NotFound(format!("cluster IP of Service {}", leader.name_any()))
        })?
        .to_string();

    let intent = service::generate_primary_service(cluster);
    state.primary_service = Some(upsert(ctx, cluster, intent).await?);

    let endpoints = service::generate_primary_endpoints(cluster, &leader_ip);
    upsert::<_, Endpoints>(ctx, cluster, endpoints).await?;
    Ok(Requeue::None)
}

async fn ensure_cluster_certificate<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let root = required(&state.root_ca, "root certificate authority")?;
    let existing = ctx
        .client
        .get::<Secret>(&namespace(cluster), &naming::cluster_certificate(cluster))
        .await?;
    let leaf = LeafCertificate::from_secret_or_issue(
        existing.as_ref(),
        (TLS_CERT_KEY, TLS_KEY_KEY, TLS_CA_KEY),
        root,
        &naming::cluster_primary_service(cluster),
        &cluster_dns_names(cluster),
    )?;
    let intent = generate_cluster_cert_secret(cluster, root, &leaf);
    state.cluster_certificate = Some(apply_owned(ctx, cluster, intent, existing, true).await?);
    Ok(Requeue::None)
}

async fn ensure_distributed_configuration<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let intent = patroni::generate_distributed_configuration(cluster);
    state.distributed_configuration = Some(upsert(ctx, cluster, intent).await?);
    Ok(Requeue::None)
}

async fn ensure_dynamic_configuration<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let initialized = state
        .status
        .patroni
        .as_ref()
        .and_then(|p| p.system_identifier.as_ref())
        .is_some();
    if !initialized {
        debug!("Patroni has not initialized the cluster yet");
        return Ok(Requeue::None);
    }

    let hbas = required(&state.hbas, "HBA rules")?;
    let parameters = required(&state.parameters, "PostgreSQL parameters")?;
    let dcs = required(&state.distributed_configuration, "distributed configuration")?;

    let desired = patroni::dynamic_configuration(cluster, hbas, parameters);
    if let Some(patch) = patroni::dynamic_configuration_patch(dcs, &desired) {
        let updated = ctx
            .client
            .merge_patch::<Endpoints>(&namespace(cluster), &dcs.name_any(), &patch)
            .await?;
        info!("Updated Patroni dynamic configuration");
        state.distributed_configuration = Some(updated);
    }
    Ok(Requeue::None)
}

async fn ensure_instance_sets<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    upsert(ctx, cluster, patroni::generate_service_account(cluster)).await?;
    upsert(ctx, cluster, patroni::generate_patroni_role(cluster)).await?;
    upsert(ctx, cluster, patroni::generate_patroni_role_binding(cluster)).await?;

    let mut statuses = Vec::with_capacity(cluster.spec.instances.len());
    let mut names = Vec::new();
    for set in &cluster.spec.instances {
        let intent =
            instance::generate_instance_statefulset(cluster, set, &ctx.config.postgres_image);
        let observed: StatefulSet = upsert(ctx, cluster, intent).await?;
        statuses.push(instance::instance_set_status(set, &observed));
        names.extend(instance::instance_names(cluster, set));
    }

    state.status.instances = statuses;
    state.instance_names = Some(names);
    Ok(Requeue::None)
}

async fn ensure_backup<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let generation = cluster.metadata.generation;
    let conditions = std::mem::take(&mut state.status.conditions);

    let Some(spec) = cluster.pgbackrest() else {
        state.status.backups = None;
        state.status.conditions = ConditionBuilder::from_existing(conditions, generation)
            .remove_condition(condition_types::BACKUP_REPO_READY)
            .build();
        return Ok(Requeue::None);
    };

    let instances = required(&state.instance_names, "instance names")?;
    let hosts: Vec<String> = instances
        .iter()
        .map(|pod| naming::instance_host(cluster, pod))
        .collect();
    upsert(ctx, cluster, backup::generate_config_map(cluster, &hosts)).await?;

    let Some(target) = instances.first().cloned() else {
        state.status.backups = Some(BackupStatus::default());
        state.status.conditions = ConditionBuilder::from_existing(conditions, generation)
            .backup_repo_ready(false, "NoInstances", "No instance to create the stanza on")
            .build();
        return Ok(Requeue::After(BACKUP_REQUEUE));
    };

    let ns = namespace(cluster);
    let job_name = naming::pgbackrest_stanza_job(cluster);
    let intent = backup::generate_stanza_job(cluster, spec, &target, &ctx.config.pgbackrest_image);
    let existing = ctx.client.get::<Job>(&ns, &job_name).await?;

    let job = match existing {
        Some(job) if job.metadata.deletion_timestamp.is_some() => {
            debug!(job = %job_name, "Waiting for the previous stanza Job to go away");
            mark_stanza_pending(state, conditions, generation, &target);
            return Ok(Requeue::After(BACKUP_REQUEUE));
        }
        Some(job) if backup::job_target(&job) != Some(target.as_str()) => {
            if !is_controlled_by(cluster, job.meta()) {
                return Err(Error::Conflict(format!(
                    "Job {} is not controlled by this cluster",
                    job_name
                )));
            }
            // The pod template of a Job is immutable. Remove it and create
            // the replacement once the old one is gone.
            info!(job = %job_name, target = %target, "Replacing stanza Job for new target");
            ctx.client.delete::<Job>(&ns, &job_name).await?;
            mark_stanza_pending(state, conditions, generation, &target);
            return Ok(Requeue::Immediately);
        }
        existing => apply_owned(ctx, cluster, intent, existing, true).await?,
    };

    if backup::job_succeeded(&job) {
        state.status.backups = Some(BackupStatus {
            target_instance: Some(target.clone()),
            stanza_created: true,
        });
        state.status.conditions = ConditionBuilder::from_existing(conditions, generation)
            .backup_repo_ready(
                true,
                "StanzaCreated",
                &format!("Stanza {} created on {}", backup::STANZA, target),
            )
            .build();
        Ok(Requeue::None)
    } else {
        mark_stanza_pending(state, conditions, generation, &target);
        Ok(Requeue::After(BACKUP_REQUEUE))
    }
}

fn mark_stanza_pending(
    state: &mut PipelineState,
    conditions: Vec<Condition>,
    generation: Option<i64>,
    target: &str,
) {
    state.status.backups = Some(BackupStatus {
        target_instance: Some(target.to_string()),
        stanza_created: false,
    });
    state.status.conditions = ConditionBuilder::from_existing(conditions, generation)
        .backup_repo_ready(
            false,
            "StanzaPending",
            &format!("Waiting for stanza {} on {}", backup::STANZA, target),
        )
        .build();
}

async fn ensure_pgbouncer<C: ClusterClient>(
    ctx: &Context<C>,
    cluster: &PostgresCluster,
    state: &mut PipelineState,
) -> Result<Requeue> {
    let name = naming::cluster_pgbouncer(cluster);

    let Some(spec) = cluster.pgbouncer() else {
        state.status.proxy = None;
        delete_controlled::<_, Service>(ctx, cluster, &name).await?;
        delete_controlled::<_, Deployment>(ctx, cluster, &name).await?;
        delete_controlled::<_, ConfigMap>(ctx, cluster, &name).await?;
        delete_controlled::<_, Secret>(ctx, cluster, &name).await?;
        return Ok(Requeue::None);
    };

    let root = required(&state.root_ca, "root certificate authority")?;
    let existing = ctx
        .client
        .get::<Secret>(&namespace(cluster), &name)
        .await?;
    let secret = pgbouncer::generate_secret(cluster, existing.as_ref(), root)?;
    apply_owned(ctx, cluster, secret, existing, true).await?;

    upsert(ctx, cluster, pgbouncer::generate_config_map(cluster)).await?;

    let intent = pgbouncer::generate_deployment(cluster, spec, &ctx.config.pgbouncer_image);
    let deployment: Deployment = upsert(ctx, cluster, intent).await?;

    upsert(ctx, cluster, pgbouncer::generate_service(cluster, spec)).await?;

    state.status.proxy = Some(PgBouncerStatus {
        replicas: spec.replicas.unwrap_or(1),
        ready_replicas: deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
    });
    Ok(Requeue::None)
}
