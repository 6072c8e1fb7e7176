//! Naming scheme for everything the operator generates
//!
//! Every dependent resource name, label key, role name and in-container path
//! is defined here so the pipeline and the configuration generators agree on
//! them. Names are derived only from the cluster identity, which keeps them
//! stable across reconciles.

use kube::ResourceExt;

use crate::crd::PostgresCluster;

/// API group of the PostgresCluster resource
pub const GROUP: &str = "postgres-operator.smoketurner.com";

/// Field manager used for every write to the Kubernetes API
pub const FIELD_MANAGER: &str = "postgres-operator";

/// Finalizer registered on clusters so instances can be shut down in order
pub const FINALIZER: &str = "postgres-operator.smoketurner.com/finalizer";

/// Cluster name that is always rejected. The initial user and database are
/// named after the cluster, and "postgres" already exists in every instance.
pub const RESERVED_CLUSTER_NAME: &str = "postgres";

/// Bootstrap superuser role
pub const PG_SUPERUSER: &str = "postgres";

/// Role used by Patroni for streaming replication
pub const PG_REPLICATION_USER: &str = "_replication";

/// Role PgBouncer uses to look up client credentials
pub const PGBOUNCER_USER: &str = "_pgbouncer";

/// Shared root certificate authority for all clusters in a namespace
pub const ROOT_CA_SECRET: &str = "postgres-operator-root-ca";

// Label keys
pub const LABEL_CLUSTER: &str = "postgres-operator.smoketurner.com/cluster";
pub const LABEL_INSTANCE_SET: &str = "postgres-operator.smoketurner.com/instance-set";
pub const LABEL_ROLE: &str = "postgres-operator.smoketurner.com/role";
pub const LABEL_PATRONI: &str = "postgres-operator.smoketurner.com/patroni";

// Role label values
pub const ROLE_PGBOUNCER: &str = "pgbouncer";
pub const ROLE_BACKUP: &str = "pgbackrest";

// Patroni annotations on the distributed configuration Endpoints
pub const PATRONI_INITIALIZE_ANNOTATION: &str = "initialize";
pub const PATRONI_CONFIG_ANNOTATION: &str = "config";

/// Annotation recording which instance the stanza Job was created for
pub const BACKUP_TARGET_ANNOTATION: &str = "postgres-operator.smoketurner.com/backup-target";

// PostgreSQL TLS material inside instance containers
pub const PG_TLS_DIRECTORY: &str = "/pgconf/tls";
pub const PG_TLS_CERT_PATH: &str = "/pgconf/tls/tls.crt";
pub const PG_TLS_KEY_PATH: &str = "/pgconf/tls/tls.key";
pub const PG_TLS_CA_PATH: &str = "/pgconf/tls/ca.crt";

/// Patroni configuration directory inside instance containers
pub const PATRONI_CONFIG_DIRECTORY: &str = "/etc/patroni";

/// Instance data volume mount
pub const PG_DATA_VOLUME_PATH: &str = "/pgdata";

/// pgBackRest configuration directory
pub const PGBACKREST_CONFIG_DIRECTORY: &str = "/etc/pgbackrest/conf.d";

/// PgBouncer configuration directory inside the pooler container
pub const PGBOUNCER_CONFIG_DIRECTORY: &str = "/etc/pgbouncer";

// Keys inside generated ConfigMaps and Secrets
pub const PATRONI_CONFIG_KEY: &str = "patroni.yaml";
pub const PGBACKREST_CONFIG_KEY: &str = "pgbackrest.conf";
pub const PGBOUNCER_INI_KEY: &str = "pgbouncer.ini";
pub const PGBOUNCER_AUTH_FILE_KEY: &str = "pgbouncer-users.txt";
pub const PGBOUNCER_PASSWORD_KEY: &str = "pgbouncer-password";
pub const PGBOUNCER_FRONTEND_CERT_KEY: &str = "pgbouncer-frontend.crt";
pub const PGBOUNCER_FRONTEND_KEY_KEY: &str = "pgbouncer-frontend.key";
pub const PGBOUNCER_FRONTEND_CA_KEY: &str = "pgbouncer-frontend.ca-roots";
pub const PGBOUNCER_BACKEND_CA_KEY: &str = "pgbouncer-backend.ca-roots";
pub const USER_SECRET_USER_KEY: &str = "user";
pub const USER_SECRET_PASSWORD_KEY: &str = "password";
pub const USER_SECRET_REPLICATION_PASSWORD_KEY: &str = "replication-password";
pub const ROOT_CA_CERT_KEY: &str = "root.crt";
pub const ROOT_CA_KEY_KEY: &str = "root.key";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const TLS_CA_KEY: &str = "ca.crt";

fn cluster_name(cluster: &PostgresCluster) -> String {
    cluster.name_any()
}

/// ConfigMap holding the rendered Patroni configuration
pub fn cluster_config_map(cluster: &PostgresCluster) -> String {
    format!("{}-config", cluster_name(cluster))
}

/// Secret holding the bootstrap superuser credentials
pub fn cluster_user_secret(cluster: &PostgresCluster) -> String {
    format!("{}-pguser", cluster_name(cluster))
}

/// Headless Service giving every instance pod a stable DNS name
pub fn cluster_pod_service(cluster: &PostgresCluster) -> String {
    format!("{}-pods", cluster_name(cluster))
}

/// Service whose Endpoints Patroni uses as its leader lease. This is also
/// the Patroni scope.
pub fn patroni_leader_service(cluster: &PostgresCluster) -> String {
    format!("{}-ha", cluster_name(cluster))
}

/// Endpoints Patroni uses as its distributed configuration store
pub fn patroni_distributed_configuration(cluster: &PostgresCluster) -> String {
    format!("{}-config", patroni_leader_service(cluster))
}

/// Service (and Endpoints) that always point at the current leader
pub fn cluster_primary_service(cluster: &PostgresCluster) -> String {
    format!("{}-primary", cluster_name(cluster))
}

/// Secret holding the cluster's leaf certificate
pub fn cluster_certificate(cluster: &PostgresCluster) -> String {
    format!("{}-cluster-cert", cluster_name(cluster))
}

/// ServiceAccount, Role and RoleBinding used by instance pods
pub fn instance_rbac(cluster: &PostgresCluster) -> String {
    format!("{}-instance", cluster_name(cluster))
}

/// StatefulSet for one instance set
pub fn instance_set(cluster: &PostgresCluster, set_name: &str) -> String {
    format!("{}-{}", cluster_name(cluster), set_name)
}

/// Pod name of the instance with the given ordinal
pub fn instance_pod(statefulset: &str, ordinal: i32) -> String {
    format!("{}-{}", statefulset, ordinal)
}

/// ConfigMap holding the pgBackRest configuration
pub fn pgbackrest_config(cluster: &PostgresCluster) -> String {
    format!("{}-pgbackrest", cluster_name(cluster))
}

/// Job that creates the pgBackRest stanza
pub fn pgbackrest_stanza_job(cluster: &PostgresCluster) -> String {
    format!("{}-backup-init", cluster_name(cluster))
}

/// Name shared by every PgBouncer object of a cluster
pub fn cluster_pgbouncer(cluster: &PostgresCluster) -> String {
    format!("{}-pgbouncer", cluster_name(cluster))
}

/// Fully qualified DNS name of an instance pod behind the pod Service
pub fn instance_host(cluster: &PostgresCluster, pod: &str) -> String {
    format!(
        "{}.{}.{}.svc",
        pod,
        cluster_pod_service(cluster),
        cluster.namespace().unwrap_or_default()
    )
}

/// DNS names a certificate for `service` must cover
pub fn service_dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{}.{}", service, namespace),
        format!("{}.{}.svc", service, namespace),
        format!("{}.{}.svc.cluster.local", service, namespace),
    ]
}
