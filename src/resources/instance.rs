//! Instance set StatefulSets
//!
//! Each entry of `spec.instances` becomes one StatefulSet. Every pod runs
//! PostgreSQL with Patroni; which pod is primary is decided by Patroni, not
//! by the operator.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMapProjection, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, KeyToPath,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSecurityContext,
    PodSpec, PodTemplateSpec, Probe, ProjectedVolumeSource, SeccompProfile, SecretKeySelector,
    SecretProjection, Volume, VolumeMount, VolumeProjection, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::crd::{InstanceSetStatus, PostgresCluster, PostgresInstanceSetSpec};
use crate::naming::{
    self, PATRONI_CONFIG_DIRECTORY, PATRONI_CONFIG_KEY, PG_DATA_VOLUME_PATH, PG_TLS_DIRECTORY,
    TLS_CA_KEY, TLS_CERT_KEY, TLS_KEY_KEY, USER_SECRET_REPLICATION_PASSWORD_KEY,
};
use crate::resources::common::{instance_set_labels, object_meta, resource_requirements};
use crate::resources::patroni::{PATRONI_API_PORT, data_directory};
use crate::resources::service::POSTGRES_PORT_NAME;

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn item(key: &str, path: &str) -> KeyToPath {
    KeyToPath {
        key: key.to_string(),
        path: path.to_string(),
        ..Default::default()
    }
}

/// Patroni configuration and TLS material projected into every instance
fn config_volumes(cluster: &PostgresCluster) -> Vec<Volume> {
    vec![
        Volume {
            name: "patroni-config".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: naming::cluster_config_map(cluster),
                        items: Some(vec![item(PATRONI_CONFIG_KEY, PATRONI_CONFIG_KEY)]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "cert-volume".to_string(),
            projected: Some(ProjectedVolumeSource {
                default_mode: Some(0o600),
                sources: Some(vec![VolumeProjection {
                    secret: Some(SecretProjection {
                        name: naming::cluster_certificate(cluster),
                        items: Some(vec![
                            item(TLS_CERT_KEY, TLS_CERT_KEY),
                            item(TLS_KEY_KEY, TLS_KEY_KEY),
                            item(TLS_CA_KEY, TLS_CA_KEY),
                        ]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        },
    ]
}

/// Generate the StatefulSet of one instance set. `set.name` and
/// `set.replicas` must already be defaulted.
pub fn generate_instance_statefulset(
    cluster: &PostgresCluster,
    set: &PostgresInstanceSetSpec,
    default_image: &str,
) -> StatefulSet {
    let name = naming::instance_set(cluster, &set.name);
    let labels = instance_set_labels(cluster, &set.name);
    let port = cluster.postgres_port();

    let env = vec![
        field_env("PATRONI_NAME", "metadata.name"),
        field_env("PATRONI_KUBERNETES_NAMESPACE", "metadata.namespace"),
        field_env("PATRONI_KUBERNETES_POD_IP", "status.podIP"),
        value_env(
            "PATRONI_POSTGRESQL_CONNECT_ADDRESS",
            format!("$(PATRONI_NAME).{}:{}", naming::cluster_pod_service(cluster), port),
        ),
        value_env("PATRONI_POSTGRESQL_LISTEN", format!("*:{}", port)),
        value_env(
            "PATRONI_RESTAPI_CONNECT_ADDRESS",
            format!(
                "$(PATRONI_NAME).{}:{}",
                naming::cluster_pod_service(cluster),
                PATRONI_API_PORT
            ),
        ),
        EnvVar {
            name: "PATRONI_REPLICATION_PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: naming::cluster_user_secret(cluster),
                    key: USER_SECRET_REPLICATION_PASSWORD_KEY.to_string(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        value_env("PGDATA", data_directory(cluster)),
    ];

    let patroni_probe = |path: &str, initial_delay_seconds, failure_threshold| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(PATRONI_API_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    };

    let container = Container {
        name: "database".to_string(),
        image: Some(
            cluster
                .spec
                .image
                .clone()
                .unwrap_or_else(|| default_image.to_string()),
        ),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "patroni".to_string(),
            format!("{}/{}", PATRONI_CONFIG_DIRECTORY, PATRONI_CONFIG_KEY),
        ]),
        ports: Some(vec![
            ContainerPort {
                container_port: port,
                name: Some(POSTGRES_PORT_NAME.to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: PATRONI_API_PORT,
                name: Some("patroni".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(env),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "pgdata".to_string(),
                mount_path: PG_DATA_VOLUME_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "patroni-config".to_string(),
                mount_path: PATRONI_CONFIG_DIRECTORY.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "cert-volume".to_string(),
                mount_path: PG_TLS_DIRECTORY.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        resources: resource_requirements(set.resources.as_ref()),
        readiness_probe: Some(patroni_probe("/readiness", 5, 3)),
        liveness_probe: Some(patroni_probe("/liveness", 30, 6)),
        ..Default::default()
    };

    let storage = &set.data_volume_claim_spec;
    let pvc_template = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("pgdata".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: object_meta(cluster, name, labels.clone()),
        spec: Some(StatefulSetSpec {
            service_name: Some(naming::cluster_pod_service(cluster)),
            replicas: set.replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    partition: Some(0),
                    ..Default::default()
                }),
            }),
            // Patroni elects the primary; pods may start in any order
            pod_management_policy: Some("Parallel".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(naming::instance_rbac(cluster)),
                    containers: vec![container],
                    volumes: Some(config_volumes(cluster)),
                    termination_grace_period_seconds: Some(30),
                    security_context: Some(PodSecurityContext {
                        fs_group: Some(26),
                        run_as_non_root: Some(true),
                        seccomp_profile: Some(SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![pvc_template]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod names of an instance set, in ordinal order
pub fn instance_names(cluster: &PostgresCluster, set: &PostgresInstanceSetSpec) -> Vec<String> {
    let sts = naming::instance_set(cluster, &set.name);
    (0..set.replicas.unwrap_or(1).max(0))
        .map(|ordinal| naming::instance_pod(&sts, ordinal))
        .collect()
}

/// Status of an instance set as observed on its StatefulSet
pub fn instance_set_status(set: &PostgresInstanceSetSpec, observed: &StatefulSet) -> InstanceSetStatus {
    let status = observed.status.as_ref();
    InstanceSetStatus {
        name: set.name.clone(),
        replicas: set.replicas.unwrap_or(1),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        updated_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
    }
}
