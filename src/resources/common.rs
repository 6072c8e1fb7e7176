//! Common utilities for Kubernetes resource generation
//!
//! This module provides shared functions used across all resource generators
//! so every generated object carries the same labels and metadata shape.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use rand::Rng;

use crate::crd::{self, PostgresCluster};
use crate::naming::{
    self, FIELD_MANAGER, LABEL_CLUSTER, LABEL_INSTANCE_SET, LABEL_PATRONI, LABEL_ROLE,
};

/// Labels carried by every object that belongs to a cluster
pub fn cluster_labels(cluster: &PostgresCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (LABEL_CLUSTER.to_string(), cluster.name_any()),
    ])
}

/// Labels Patroni uses to find the members of a cluster
pub fn patroni_labels(cluster: &PostgresCluster) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(
        LABEL_PATRONI.to_string(),
        naming::patroni_leader_service(cluster),
    );
    labels
}

/// Labels of the pods of one instance set
pub fn instance_set_labels(cluster: &PostgresCluster, set_name: &str) -> BTreeMap<String, String> {
    let mut labels = patroni_labels(cluster);
    labels.insert(LABEL_INSTANCE_SET.to_string(), set_name.to_string());
    labels
}

/// Labels of a cluster component identified by its role
pub fn role_labels(cluster: &PostgresCluster, role: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(LABEL_ROLE.to_string(), role.to_string());
    labels
}

/// Selector matching every instance pod of the cluster
pub fn instance_selector(cluster: &PostgresCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.name_any()),
        (
            LABEL_PATRONI.to_string(),
            naming::patroni_leader_service(cluster),
        ),
    ])
}

/// Metadata for a generated object in the cluster's namespace. Owner
/// references are added when the object is written.
pub fn object_meta(
    cluster: &PostgresCluster,
    name: String,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Convert declared resources into container resource requirements
pub fn resource_requirements(
    resources: Option<&crd::ResourceRequirements>,
) -> Option<ResourceRequirements> {
    fn quantities(list: &crd::ResourceList) -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &list.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &list.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        map
    }

    resources.map(|r| ResourceRequirements {
        limits: r.limits.as_ref().map(quantities),
        requests: r.requests.as_ref().map(quantities),
        ..Default::default()
    })
}

/// Generate a random alphanumeric password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Read a UTF-8 value from Secret data
pub fn secret_value(data: Option<&BTreeMap<String, ByteString>>, key: &str) -> Option<String> {
    data?
        .get(key)
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .filter(|v| !v.is_empty())
}
