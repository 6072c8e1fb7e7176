//! Patroni-based PostgreSQL HA resources
//!
//! Patroni runs next to PostgreSQL in every instance pod and uses the
//! Kubernetes API as its distributed configuration store:
//! - the Endpoints of the leader Service (`<cluster>-ha`) hold the leader lease
//! - the `<cluster>-ha-config` Endpoints hold the cluster-wide settings, and
//!   carry the system identifier in their `initialize` annotation once the
//!   cluster has been bootstrapped
//!
//! Reference: https://github.com/patroni/patroni

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::ResourceExt;
use serde_json::{Value, json};

use crate::controller::error::Result;
use crate::crd::PostgresCluster;
use crate::naming::{
    self, LABEL_PATRONI, LABEL_ROLE, PATRONI_CONFIG_ANNOTATION, PATRONI_CONFIG_KEY,
    PATRONI_INITIALIZE_ANNOTATION, PG_DATA_VOLUME_PATH, PG_REPLICATION_USER, PG_SUPERUSER,
    PG_TLS_CA_PATH, PG_TLS_CERT_PATH, PG_TLS_KEY_PATH,
};
use crate::postgres::{HBAs, ParameterSet, default_hbas, mandatory_hbas, new_parameters};
use crate::resources::common::{cluster_labels, object_meta, patroni_labels};
use crate::resources::pgbouncer;

/// Port of the Patroni REST API
pub const PATRONI_API_PORT: i32 = 8008;

/// HBA rules of the cluster, including those the pooler needs
pub fn cluster_hbas(cluster: &PostgresCluster) -> HBAs {
    let mut hbas = HBAs {
        mandatory: mandatory_hbas(),
        default: default_hbas(),
    };
    if cluster.pgbouncer().is_some() {
        hbas.mandatory.extend(pgbouncer::postgres_hbas());
    }
    hbas
}

/// Effective PostgreSQL parameters of the cluster
pub fn cluster_parameters(cluster: &PostgresCluster) -> ParameterSet {
    let user: ParameterSet = cluster
        .spec
        .patroni
        .iter()
        .flat_map(|p| p.dynamic_configuration.iter())
        .collect();
    new_parameters().effective(&user)
}

/// PostgreSQL data directory for the cluster's major version
pub fn data_directory(cluster: &PostgresCluster) -> String {
    format!("{}/pg{}", PG_DATA_VOLUME_PATH, cluster.spec.postgres_version)
}

/// Settings Patroni shares across all members through its configuration
/// store. Pure function of the cluster spec.
pub fn dynamic_configuration(
    cluster: &PostgresCluster,
    hbas: &HBAs,
    parameters: &ParameterSet,
) -> Value {
    let patroni = cluster.spec.patroni.clone().unwrap_or_default();
    json!({
        "ttl": patroni.leader_lease_duration_seconds,
        "loop_wait": patroni.sync_period_seconds,
        "postgresql": {
            "parameters": parameters.as_map(),
            "pg_hba": hbas.rendered(),
            "use_pg_rewind": true,
            "use_slots": false,
        },
    })
}

/// Render patroni.yaml. Pure function of the cluster spec.
pub fn cluster_yaml(
    cluster: &PostgresCluster,
    hbas: &HBAs,
    parameters: &ParameterSet,
) -> Result<String> {
    let tls_auth = |user: &str| {
        json!({
            "username": user,
            "sslmode": "verify-ca",
            "sslrootcert": PG_TLS_CA_PATH,
            "sslcert": PG_TLS_CERT_PATH,
            "sslkey": PG_TLS_KEY_PATH,
        })
    };

    let config = json!({
        "bootstrap": {
            "dcs": dynamic_configuration(cluster, hbas, parameters),
            "initdb": [{ "encoding": "UTF8" }, "data-checksums"],
        },
        "kubernetes": {
            "namespace": cluster.namespace().unwrap_or_default(),
            "labels": cluster_labels(cluster),
            "scope_label": LABEL_PATRONI,
            "role_label": LABEL_ROLE,
            "use_endpoints": true,
            "bypass_api_service": true,
        },
        "postgresql": {
            "authentication": {
                "replication": tls_auth(PG_REPLICATION_USER),
                "rewind": tls_auth(PG_REPLICATION_USER),
                "superuser": { "username": PG_SUPERUSER },
            },
            "data_dir": data_directory(cluster),
            "pgpass": "/tmp/.pgpass",
            "use_unix_socket": true,
        },
        "restapi": {
            "listen": format!("*:{}", PATRONI_API_PORT),
        },
        "scope": naming::patroni_leader_service(cluster),
        "watchdog": { "mode": "off" },
    });

    Ok(serde_yaml::to_string(&config)?)
}

/// Generate the cluster ConfigMap holding patroni.yaml
pub fn generate_cluster_config_map(
    cluster: &PostgresCluster,
    hbas: &HBAs,
    parameters: &ParameterSet,
) -> Result<ConfigMap> {
    let yaml = cluster_yaml(cluster, hbas, parameters)?;
    Ok(ConfigMap {
        metadata: object_meta(
            cluster,
            naming::cluster_config_map(cluster),
            cluster_labels(cluster),
        ),
        data: Some(BTreeMap::from([(PATRONI_CONFIG_KEY.to_string(), yaml)])),
        ..Default::default()
    })
}

/// Generate the Endpoints Patroni uses for its cluster-wide settings. Patroni
/// owns the annotations; the operator only sets labels and ownership.
pub fn generate_distributed_configuration(cluster: &PostgresCluster) -> Endpoints {
    Endpoints {
        metadata: object_meta(
            cluster,
            naming::patroni_distributed_configuration(cluster),
            patroni_labels(cluster),
        ),
        subsets: None,
    }
}

/// System identifier Patroni recorded after bootstrapping the cluster
pub fn system_identifier(dcs: &Endpoints) -> Option<String> {
    dcs.annotations()
        .get(PATRONI_INITIALIZE_ANNOTATION)
        .filter(|v| !v.is_empty())
        .cloned()
}

/// Merge patch that sets the dynamic configuration annotation, or `None`
/// when the stored configuration already matches
pub fn dynamic_configuration_patch(dcs: &Endpoints, desired: &Value) -> Option<Value> {
    let current = dcs
        .annotations()
        .get(PATRONI_CONFIG_ANNOTATION)
        .and_then(|v| serde_json::from_str::<Value>(v).ok());
    if current.as_ref() == Some(desired) {
        return None;
    }
    Some(json!({
        "metadata": {
            "resourceVersion": dcs.resource_version(),
            "annotations": { PATRONI_CONFIG_ANNOTATION: desired.to_string() },
        }
    }))
}

/// Generate the ServiceAccount of instance pods
pub fn generate_service_account(cluster: &PostgresCluster) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(
            cluster,
            naming::instance_rbac(cluster),
            cluster_labels(cluster),
        ),
        automount_service_account_token: Some(true),
        ..Default::default()
    }
}

fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec!["".to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Generate the Role Patroni needs to use Kubernetes as its store
pub fn generate_patroni_role(cluster: &PostgresCluster) -> Role {
    Role {
        metadata: object_meta(
            cluster,
            naming::instance_rbac(cluster),
            cluster_labels(cluster),
        ),
        rules: Some(vec![
            rule(
                &["endpoints"],
                &["create", "deletecollection", "get", "list", "patch", "watch"],
            ),
            rule(&["pods"], &["get", "list", "patch", "watch"]),
            rule(&["services"], &["create"]),
        ]),
    }
}

/// Generate the RoleBinding granting the Role to the instance ServiceAccount
pub fn generate_patroni_role_binding(cluster: &PostgresCluster) -> RoleBinding {
    let name = naming::instance_rbac(cluster);
    RoleBinding {
        metadata: object_meta(cluster, name.clone(), cluster_labels(cluster)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: cluster.namespace(),
            ..Default::default()
        }]),
    }
}
