//! Test fixtures and builders for PostgresCluster resources
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let cluster = create_test_cluster("demo", "default");
//!
//! let cluster = PostgresClusterBuilder::new("demo", "default")
//!     .with_instance_set("big", 3)
//!     .with_pgbouncer()
//!     .with_backups()
//!     .build();
//! ```

use std::collections::BTreeMap;

use kube::core::ObjectMeta;
use postgres_cluster_operator::config::OperatorConfig;
use postgres_cluster_operator::controller::Context;
use postgres_cluster_operator::crd::{
    BackupsSpec, PatroniSpec, PgBackRestSpec, PgBouncerSpec, PostgresCluster,
    PostgresClusterSpec, PostgresInstanceSetSpec, PostgresProxySpec, StorageSpec,
};

use super::FakeClient;

pub const TEST_UID: &str = "test-uid-12345";

/// Create a cluster with one instance set of one replica
pub fn create_test_cluster(name: &str, namespace: &str) -> PostgresCluster {
    PostgresClusterBuilder::new(name, namespace).build()
}

/// Context around an in-memory client that already stores `clusters`
pub fn test_context(clusters: &[PostgresCluster]) -> Context<FakeClient> {
    let client = FakeClient::new();
    for cluster in clusters {
        client.seed(cluster);
    }
    Context::new(client, OperatorConfig::default())
}

/// Builder for PostgresCluster test resources
#[allow(dead_code)]
pub struct PostgresClusterBuilder {
    name: String,
    namespace: String,
    uid: Option<String>,
    generation: Option<i64>,
    spec: PostgresClusterSpec,
    finalizers: Vec<String>,
    deleting: bool,
}

#[allow(dead_code)]
impl PostgresClusterBuilder {
    /// Create a new builder with a single instance set of one replica
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: Some(TEST_UID.to_string()),
            generation: Some(1),
            spec: PostgresClusterSpec {
                instances: vec![PostgresInstanceSetSpec {
                    replicas: Some(1),
                    data_volume_claim_spec: StorageSpec {
                        storage_class: None,
                        size: "1Gi".to_string(),
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
            finalizers: Vec::new(),
            deleting: false,
        }
    }

    /// Set the resource UID (for owner references)
    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }

    /// Set the resource generation
    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Replace the instance sets with a single named one
    pub fn with_instance_set(mut self, name: &str, replicas: i32) -> Self {
        self.spec.instances = vec![PostgresInstanceSetSpec {
            name: name.to_string(),
            replicas: Some(replicas),
            data_volume_claim_spec: StorageSpec {
                storage_class: Some("standard".to_string()),
                size: "10Gi".to_string(),
            },
            ..Default::default()
        }];
        self
    }

    /// Append another instance set
    pub fn add_instance_set(mut self, name: &str, replicas: i32) -> Self {
        self.spec.instances.push(PostgresInstanceSetSpec {
            name: name.to_string(),
            replicas: Some(replicas),
            data_volume_claim_spec: StorageSpec {
                storage_class: None,
                size: "1Gi".to_string(),
            },
            ..Default::default()
        });
        self
    }

    /// Add a PostgreSQL parameter to the Patroni dynamic configuration
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.spec
            .patroni
            .get_or_insert_with(PatroniSpec::default)
            .dynamic_configuration
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Enable the PgBouncer pooler with defaults
    pub fn with_pgbouncer(mut self) -> Self {
        self.spec.proxy = Some(PostgresProxySpec {
            pgbouncer: PgBouncerSpec::default(),
        });
        self
    }

    /// Enable the PgBouncer pooler on a given port
    pub fn with_pgbouncer_port(mut self, port: i32) -> Self {
        self.spec.proxy = Some(PostgresProxySpec {
            pgbouncer: PgBouncerSpec {
                port: Some(port),
                ..Default::default()
            },
        });
        self
    }

    /// Enable pgBackRest backups
    pub fn with_backups(mut self) -> Self {
        self.spec.backups = Some(BackupsSpec {
            pgbackrest: PgBackRestSpec {
                image: None,
                repo_volume_size: Some("1Gi".to_string()),
            },
        });
        self
    }

    /// Add a finalizer
    pub fn with_finalizer(mut self, finalizer: &str) -> Self {
        self.finalizers.push(finalizer.to_string());
        self
    }

    /// Mark the cluster as being deleted
    pub fn deleting(mut self) -> Self {
        self.deleting = true;
        self
    }

    /// Build the PostgresCluster
    pub fn build(self) -> PostgresCluster {
        let deletion_timestamp = self
            .deleting
            .then(|| serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap());
        PostgresCluster {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: self.uid,
                generation: self.generation,
                finalizers: (!self.finalizers.is_empty()).then_some(self.finalizers),
                deletion_timestamp,
                labels: Some(BTreeMap::new()),
                ..Default::default()
            },
            spec: self.spec,
            status: None,
        }
    }
}
