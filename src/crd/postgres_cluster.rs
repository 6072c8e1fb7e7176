use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default PostgreSQL port
pub const DEFAULT_POSTGRES_PORT: i32 = 5432;

/// Default PgBouncer port
pub const DEFAULT_PGBOUNCER_PORT: i32 = 5432;

/// Default Patroni leader lease duration
pub const DEFAULT_LEADER_LEASE_SECONDS: i32 = 30;

/// Default Patroni loop period
pub const DEFAULT_SYNC_PERIOD_SECONDS: i32 = 10;

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1beta1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Version", "type":"integer", "jsonPath":".spec.postgresVersion"}"#,
    printcolumn = r#"{"name":"Observed", "type":"integer", "jsonPath":".status.observedGeneration"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// PostgreSQL and Patroni container image (operator default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Major PostgreSQL version
    #[serde(default = "default_postgres_version")]
    pub postgres_version: i32,

    /// Port PostgreSQL listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Instance sets, reconciled in order
    #[serde(default)]
    pub instances: Vec<PostgresInstanceSetSpec>,

    /// Patroni settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patroni: Option<PatroniSpec>,

    /// Connection pooling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<PostgresProxySpec>,

    /// Backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backups: Option<BackupsSpec>,
}

fn default_postgres_version() -> i32 {
    16
}

impl Default for PostgresClusterSpec {
    fn default() -> Self {
        Self {
            image: None,
            postgres_version: default_postgres_version(),
            port: None,
            instances: Vec::new(),
            patroni: None,
            proxy: None,
            backups: None,
        }
    }
}

/// A set of identical PostgreSQL instances
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresInstanceSetSpec {
    /// Name of the set; defaults to its two-digit position in the list
    #[serde(default)]
    pub name: String,

    /// Number of instances in the set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Persistent storage for each instance
    pub data_volume_claim_spec: StorageSpec,

    /// Resource requirements for instance containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Storage configuration for PostgreSQL data volumes
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of the persistent volume (e.g., "10Gi", "100Gi")
    pub size: String,
}

/// Resource requirements for operator-managed containers
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU and memory limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// CPU and memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Patroni settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatroniSpec {
    /// TTL of the leader lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_lease_duration_seconds: Option<i32>,

    /// Interval between Patroni HA loop runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_period_seconds: Option<i32>,

    /// PostgreSQL parameters applied between the operator defaults and the
    /// mandatory settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dynamic_configuration: BTreeMap<String, String>,
}

/// Proxy configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresProxySpec {
    /// PgBouncer connection pooler
    #[serde(rename = "pgBouncer")]
    pub pgbouncer: PgBouncerSpec,
}

/// PgBouncer connection pooling configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerSpec {
    /// PgBouncer container image (operator default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Port PgBouncer listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Number of PgBouncer pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Resource requirements for PgBouncer containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupsSpec {
    /// pgBackRest settings
    pub pgbackrest: PgBackRestSpec,
}

/// pgBackRest configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBackRestSpec {
    /// pgBackRest container image (operator default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Size limit of the repository volume (e.g., "1Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_volume_size: Option<String>,
}

impl PostgresCluster {
    /// Fill in every optional field that has a default. Applied in memory at
    /// the start of each reconcile; nothing is written back.
    pub fn set_defaults(&mut self) {
        let spec = &mut self.spec;
        if spec.port.is_none() {
            spec.port = Some(DEFAULT_POSTGRES_PORT);
        }

        for (i, set) in spec.instances.iter_mut().enumerate() {
            if set.name.is_empty() {
                set.name = format!("{:02}", i);
            }
            if set.replicas.is_none() {
                set.replicas = Some(1);
            }
        }

        let patroni = spec.patroni.get_or_insert_with(PatroniSpec::default);
        if patroni.leader_lease_duration_seconds.is_none() {
            patroni.leader_lease_duration_seconds = Some(DEFAULT_LEADER_LEASE_SECONDS);
        }
        if patroni.sync_period_seconds.is_none() {
            patroni.sync_period_seconds = Some(DEFAULT_SYNC_PERIOD_SECONDS);
        }

        if let Some(proxy) = spec.proxy.as_mut() {
            let pgbouncer = &mut proxy.pgbouncer;
            if pgbouncer.port.is_none() {
                pgbouncer.port = Some(DEFAULT_PGBOUNCER_PORT);
            }
            if pgbouncer.replicas.is_none() {
                pgbouncer.replicas = Some(1);
            }
        }
    }

    /// PostgreSQL port after defaulting
    pub fn postgres_port(&self) -> i32 {
        self.spec.port.unwrap_or(DEFAULT_POSTGRES_PORT)
    }

    /// PgBouncer spec when a pooler is declared
    pub fn pgbouncer(&self) -> Option<&PgBouncerSpec> {
        self.spec.proxy.as_ref().map(|p| &p.pgbouncer)
    }

    /// pgBackRest spec when backups are declared
    pub fn pgbackrest(&self) -> Option<&PgBackRestSpec> {
        self.spec.backups.as_ref().map(|b| &b.pgbackrest)
    }
}

impl PgBouncerSpec {
    /// PgBouncer port after defaulting
    pub fn port(&self) -> i32 {
        self.port.unwrap_or(DEFAULT_PGBOUNCER_PORT)
    }
}

/// Status of the PostgresCluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Generation of the spec most recently reconciled without error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// What Patroni reported about the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patroni: Option<PatroniStatus>,

    /// One entry per instance set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceSetStatus>,

    /// Connection pooler status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<PgBouncerStatus>,

    /// Backup subsystem status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backups: Option<BackupStatus>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Patroni observations
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatroniStatus {
    /// PostgreSQL system identifier reported by Patroni once initialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_identifier: Option<String>,
}

/// Status of one instance set
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetStatus {
    pub name: String,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
}

/// Status of the PgBouncer Deployment
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
}

/// Status of the backup subsystem
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Instance the stanza was (or is being) created against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_instance: Option<String>,

    /// Whether the pgBackRest stanza exists
    #[serde(default)]
    pub stanza_created: bool,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
