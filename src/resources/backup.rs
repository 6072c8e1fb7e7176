//! pgBackRest configuration and stanza initialization
//!
//! The repository configuration lists every instance as a `pgN-host` so
//! pgBackRest can find the primary on its own. The stanza is created once by
//! a Job that targets one instance; the Job is replaced if that instance goes
//! away.
//!
//! # References
//! - pgBackRest: https://pgbackrest.org/configuration.html

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{PgBackRestSpec, PostgresCluster};
use crate::naming::{
    self, BACKUP_TARGET_ANNOTATION, PGBACKREST_CONFIG_DIRECTORY, PGBACKREST_CONFIG_KEY,
    PG_SUPERUSER, ROLE_BACKUP,
};
use crate::resources::common::{object_meta, role_labels};
use crate::resources::ini::{GENERATED_HEADER, IniValueSet, section};
use crate::resources::patroni::data_directory;

/// Name of the pgBackRest stanza of every cluster
pub const STANZA: &str = "db";

/// Mount point of the first repository
pub const REPO_PATH: &str = "/pgbackrest/repo1";

/// Render pgbackrest.conf. Pure function of the cluster and its instances.
pub fn cluster_config(cluster: &PostgresCluster, instance_hosts: &[String]) -> String {
    let global = IniValueSet::from([
        ("log-path", "/tmp".to_string()),
        ("repo1-path", REPO_PATH.to_string()),
    ]);

    let mut stanza = IniValueSet::new();
    for (i, host) in instance_hosts.iter().enumerate() {
        let n = i + 1;
        stanza.set(&format!("pg{}-host", n), host.clone());
        stanza.set(&format!("pg{}-host-user", n), PG_SUPERUSER);
        stanza.set(&format!("pg{}-path", n), data_directory(cluster));
        stanza.set(&format!("pg{}-port", n), cluster.postgres_port().to_string());
    }

    let mut out = String::from(GENERATED_HEADER);
    out.push_str(&section("global", &global));
    out.push_str(&section(STANZA, &stanza));
    out
}

/// Generate the ConfigMap holding pgbackrest.conf
pub fn generate_config_map(cluster: &PostgresCluster, instance_hosts: &[String]) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(
            cluster,
            naming::pgbackrest_config(cluster),
            role_labels(cluster, ROLE_BACKUP),
        ),
        data: Some(BTreeMap::from([(
            PGBACKREST_CONFIG_KEY.to_string(),
            cluster_config(cluster, instance_hosts),
        )])),
        ..Default::default()
    }
}

/// Generate the Job that creates the stanza against `target`
pub fn generate_stanza_job(
    cluster: &PostgresCluster,
    spec: &PgBackRestSpec,
    target: &str,
    default_image: &str,
) -> Job {
    let labels = role_labels(cluster, ROLE_BACKUP);
    let mut metadata = object_meta(cluster, naming::pgbackrest_stanza_job(cluster), labels.clone());
    metadata.annotations = Some(BTreeMap::from([(
        BACKUP_TARGET_ANNOTATION.to_string(),
        target.to_string(),
    )]));

    let container = Container {
        name: "pgbackrest".to_string(),
        image: Some(
            spec.image
                .clone()
                .unwrap_or_else(|| default_image.to_string()),
        ),
        command: Some(vec![
            "pgbackrest".to_string(),
            "stanza-create".to_string(),
            format!("--stanza={}", STANZA),
            format!("--pg1-host={}", naming::instance_host(cluster, target)),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "pgbackrest-config".to_string(),
                mount_path: PGBACKREST_CONFIG_DIRECTORY.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "pgbackrest-repo".to_string(),
                mount_path: REPO_PATH.to_string(),
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    Job {
        metadata,
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    volumes: Some(vec![
                        Volume {
                            name: "pgbackrest-config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: naming::pgbackrest_config(cluster),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "pgbackrest-repo".to_string(),
                            empty_dir: Some(EmptyDirVolumeSource {
                                size_limit: spec.repo_volume_size.clone().map(Quantity),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Instance a stanza Job was created for
pub fn job_target(job: &Job) -> Option<&str> {
    job.annotations()
        .get(BACKUP_TARGET_ANNOTATION)
        .map(String::as_str)
}

/// Whether a stanza Job has finished successfully
pub fn job_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .is_some_and(|n| n > 0)
}
