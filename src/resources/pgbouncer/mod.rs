//! PgBouncer connection pooler resources
//!
//! The pooler runs as a Deployment in front of the primary Service. It logs
//! in to PostgreSQL as a dedicated role and looks up client credentials with
//! `auth_query`, so only its own password lives in the credential file.
//!
//! Reference: https://www.pgbouncer.org/

pub mod config;

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapProjection, Container, ContainerPort, KeyToPath, PodSecurityContext,
    PodSpec, PodTemplateSpec, Probe, ProjectedVolumeSource, SeccompProfile, Secret,
    SecretProjection, SecurityContext, Service, ServicePort, ServiceSpec, TCPSocketAction, Volume,
    VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::error::Result;
use crate::crd::{PgBouncerSpec, PostgresCluster};
use crate::naming::{
    self, PGBOUNCER_AUTH_FILE_KEY, PGBOUNCER_BACKEND_CA_KEY, PGBOUNCER_CONFIG_DIRECTORY,
    PGBOUNCER_FRONTEND_CA_KEY, PGBOUNCER_FRONTEND_CERT_KEY, PGBOUNCER_FRONTEND_KEY_KEY,
    PGBOUNCER_INI_KEY, PGBOUNCER_PASSWORD_KEY, PGBOUNCER_USER, ROLE_PGBOUNCER,
};
use crate::postgres::HostBasedAuthentication;
use crate::resources::certificate::{LeafCertificate, RootCertificateAuthority};
use crate::resources::common::{
    generate_password, object_meta, resource_requirements, role_labels, secret_value,
};
use crate::resources::secret::PASSWORD_LENGTH;

use config::{
    AUTH_FILE_PROJECTION_PATH, BACKEND_CA_PROJECTION_PATH, FRONTEND_CA_PROJECTION_PATH,
    FRONTEND_CERT_PROJECTION_PATH, FRONTEND_KEY_PROJECTION_PATH, INI_FILE_PROJECTION_PATH,
};

/// HBA rules PostgreSQL needs so the pooler can log in, and only over TLS
pub fn postgres_hbas() -> Vec<HostBasedAuthentication> {
    vec![
        HostBasedAuthentication::new()
            .tls()
            .user(PGBOUNCER_USER)
            .method("scram-sha-256"),
        HostBasedAuthentication::new()
            .tcp()
            .user(PGBOUNCER_USER)
            .method("reject"),
    ]
}

/// DNS names of the pooler's frontend certificate
pub fn dns_names(cluster: &PostgresCluster) -> Vec<String> {
    naming::service_dns_names(
        &naming::cluster_pgbouncer(cluster),
        &cluster.namespace().unwrap_or_default(),
    )
}

/// Generate the pooler Secret: its password, the credential file, the
/// frontend certificate and the CA bundles.
///
/// The password and a still-valid frontend certificate are taken from
/// `existing` so the Secret is stable across reconciles.
pub fn generate_secret(
    cluster: &PostgresCluster,
    existing: Option<&Secret>,
    root: &RootCertificateAuthority,
) -> Result<Secret> {
    let data = existing.and_then(|s| s.data.as_ref());
    let password = secret_value(data, PGBOUNCER_PASSWORD_KEY)
        .unwrap_or_else(|| generate_password(PASSWORD_LENGTH));

    let leaf = LeafCertificate::from_secret_or_issue(
        existing,
        (
            PGBOUNCER_FRONTEND_CERT_KEY,
            PGBOUNCER_FRONTEND_KEY_KEY,
            PGBOUNCER_FRONTEND_CA_KEY,
        ),
        root,
        &naming::cluster_pgbouncer(cluster),
        &dns_names(cluster),
    )?;

    let ca = ByteString(root.cert_pem().as_bytes().to_vec());
    let data = BTreeMap::from([
        (
            PGBOUNCER_AUTH_FILE_KEY.to_string(),
            ByteString(config::auth_file_contents(&password)),
        ),
        (
            PGBOUNCER_PASSWORD_KEY.to_string(),
            ByteString(password.into_bytes()),
        ),
        (
            PGBOUNCER_FRONTEND_CERT_KEY.to_string(),
            ByteString(leaf.cert_pem.into_bytes()),
        ),
        (
            PGBOUNCER_FRONTEND_KEY_KEY.to_string(),
            ByteString(leaf.key_pem.into_bytes()),
        ),
        (PGBOUNCER_FRONTEND_CA_KEY.to_string(), ca.clone()),
        (PGBOUNCER_BACKEND_CA_KEY.to_string(), ca),
    ]);

    Ok(Secret {
        metadata: object_meta(
            cluster,
            naming::cluster_pgbouncer(cluster),
            role_labels(cluster, ROLE_PGBOUNCER),
        ),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    })
}

/// Generate the pooler ConfigMap holding pgbouncer.ini
pub fn generate_config_map(cluster: &PostgresCluster) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(
            cluster,
            naming::cluster_pgbouncer(cluster),
            role_labels(cluster, ROLE_PGBOUNCER),
        ),
        data: Some(BTreeMap::from([(
            PGBOUNCER_INI_KEY.to_string(),
            config::cluster_ini(cluster),
        )])),
        ..Default::default()
    }
}

fn key_to_path(key: &str, path: &str) -> KeyToPath {
    KeyToPath {
        key: key.to_string(),
        path: path.to_string(),
        ..Default::default()
    }
}

/// Files projected into the pooler's configuration directory
fn config_volume(cluster: &PostgresCluster) -> Volume {
    let name = naming::cluster_pgbouncer(cluster);
    Volume {
        name: "pgbouncer-config".to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(0o600),
            sources: Some(vec![
                VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: name.clone(),
                        items: Some(vec![key_to_path(
                            PGBOUNCER_INI_KEY,
                            INI_FILE_PROJECTION_PATH,
                        )]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    secret: Some(SecretProjection {
                        name,
                        items: Some(vec![
                            key_to_path(PGBOUNCER_AUTH_FILE_KEY, AUTH_FILE_PROJECTION_PATH),
                            key_to_path(PGBOUNCER_FRONTEND_CERT_KEY, FRONTEND_CERT_PROJECTION_PATH),
                            key_to_path(PGBOUNCER_FRONTEND_KEY_KEY, FRONTEND_KEY_PROJECTION_PATH),
                            key_to_path(PGBOUNCER_FRONTEND_CA_KEY, FRONTEND_CA_PROJECTION_PATH),
                            key_to_path(PGBOUNCER_BACKEND_CA_KEY, BACKEND_CA_PROJECTION_PATH),
                        ]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
        }),
        ..Default::default()
    }
}

/// Generate the pooler Deployment
pub fn generate_deployment(
    cluster: &PostgresCluster,
    spec: &PgBouncerSpec,
    default_image: &str,
) -> Deployment {
    let labels = role_labels(cluster, ROLE_PGBOUNCER);
    let port = spec.port();

    let probe = |initial_delay_seconds, failure_threshold| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    };

    let container = Container {
        name: "pgbouncer".to_string(),
        image: Some(
            spec.image
                .clone()
                .unwrap_or_else(|| default_image.to_string()),
        ),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "pgbouncer".to_string(),
            format!("{}/{}", PGBOUNCER_CONFIG_DIRECTORY, INI_FILE_PROJECTION_PATH),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: port,
            name: Some("pgbouncer".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "pgbouncer-config".to_string(),
            mount_path: PGBOUNCER_CONFIG_DIRECTORY.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        resources: resource_requirements(spec.resources.as_ref()),
        readiness_probe: Some(probe(5, 3)),
        liveness_probe: Some(probe(30, 6)),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(cluster, naming::cluster_pgbouncer(cluster), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: spec.replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![config_volume(cluster)]),
                    termination_grace_period_seconds: Some(10),
                    security_context: Some(PodSecurityContext {
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
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the pooler Service
pub fn generate_service(cluster: &PostgresCluster, spec: &PgBouncerSpec) -> Service {
    let labels = role_labels(cluster, ROLE_PGBOUNCER);
    Service {
        metadata: object_meta(cluster, naming::cluster_pgbouncer(cluster), labels.clone()),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("pgbouncer".to_string()),
                port: spec.port(),
                target_port: Some(IntOrString::String("pgbouncer".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
