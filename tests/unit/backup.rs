//! pgBackRest stanza lifecycle

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;

use postgres_cluster_operator::controller::{Requeue, Stage, reconcile_cluster};
use postgres_cluster_operator::controller::{condition_status, condition_types};
use postgres_cluster_operator::crd::PostgresCluster;
use postgres_cluster_operator::naming::{BACKUP_TARGET_ANNOTATION, PGBACKREST_CONFIG_KEY};

use crate::common::*;

const NS: &str = "ns1";
const JOB: &str = "demo-backup-init";

fn backup_cluster() -> PostgresCluster {
    PostgresClusterBuilder::new("demo", NS).with_backups().build()
}

fn backup_condition(cluster: &PostgresCluster) -> (String, String) {
    let status = cluster.status.as_ref().unwrap();
    let condition = status
        .conditions
        .iter()
        .find(|c| c.type_ == condition_types::BACKUP_REPO_READY)
        .unwrap();
    (condition.status.clone(), condition.reason.clone())
}

#[tokio::test]
async fn test_pending_stanza_requeues() {
    let ctx = test_context(&[backup_cluster()]);

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));

    let job: Job = ctx.client.object(NS, JOB).unwrap();
    assert_eq!(
        job.metadata.annotations.unwrap()[BACKUP_TARGET_ANNOTATION],
        "demo-00-0"
    );

    let config: ConfigMap = ctx.client.object(NS, "demo-pgbackrest").unwrap();
    let data = config.data.unwrap();
    assert!(data[PGBACKREST_CONFIG_KEY].contains("pg1-host = demo-00-0.demo-pods.ns1.svc"));

    let stored: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    let backups = stored.status.as_ref().unwrap().backups.clone().unwrap();
    assert_eq!(backups.target_instance.as_deref(), Some("demo-00-0"));
    assert!(!backups.stanza_created);
    assert_eq!(
        backup_condition(&stored),
        (
            condition_status::FALSE.to_string(),
            "StanzaPending".to_string()
        )
    );
}

#[tokio::test]
async fn test_completed_stanza_stops_requeueing() {
    let ctx = test_context(&[backup_cluster()]);
    reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    ctx.client.modify::<Job>(NS, JOB, |job| {
        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
    });

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    assert_eq!(requeue, Requeue::None);

    let stored: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    assert!(stored.status.as_ref().unwrap().backups.as_ref().unwrap().stanza_created);
    assert_eq!(
        backup_condition(&stored),
        (
            condition_status::TRUE.to_string(),
            "StanzaCreated".to_string()
        )
    );
}

#[tokio::test]
async fn test_no_instances_requeues_without_job() {
    let cluster = PostgresClusterBuilder::new("demo", NS)
        .with_instance_set("empty", 0)
        .with_backups()
        .build();
    let ctx = test_context(&[cluster]);

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));
    assert!(!ctx.client.contains::<Job>(NS, JOB));
    let stored: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    assert_eq!(
        backup_condition(&stored),
        (
            condition_status::FALSE.to_string(),
            "NoInstances".to_string()
        )
    );
}

#[tokio::test]
async fn test_job_replaced_when_target_changes() {
    let ctx = test_context(&[backup_cluster()]);
    reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    ctx.client.modify::<Job>(NS, JOB, |job| {
        job.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(BACKUP_TARGET_ANNOTATION.to_string(), "demo-old-0".to_string());
        job.status = Some(JobStatus {
            failed: Some(3),
            ..Default::default()
        });
    });

    // The old Job is removed first; its replacement comes on the next pass
    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    assert_eq!(requeue, Requeue::Immediately);
    assert!(!ctx.client.contains::<Job>(NS, JOB));

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));
    let job: Job = ctx.client.object(NS, JOB).unwrap();
    assert_eq!(
        job.metadata.annotations.unwrap()[BACKUP_TARGET_ANNOTATION],
        "demo-00-0"
    );
    assert!(job.status.is_none());
}

#[tokio::test]
async fn test_waits_for_terminating_job() {
    let ctx = test_context(&[backup_cluster()]);
    reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    ctx.client.modify::<Job>(NS, JOB, |job| {
        job.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(BACKUP_TARGET_ANNOTATION.to_string(), "demo-old-0".to_string());
        job.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap());
    });
    let mutations = ctx.client.mutation_count();

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));
    assert_eq!(ctx.client.mutation_count(), mutations);
    let job: Job = ctx.client.object(NS, JOB).unwrap();
    assert!(job.metadata.deletion_timestamp.is_some());
}

#[tokio::test]
async fn test_foreign_job_is_not_replaced() {
    let ctx = test_context(&[backup_cluster()]);
    let seeded = ctx.client.seed(&Job {
        metadata: ObjectMeta {
            name: Some(JOB.to_string()),
            namespace: Some(NS.to_string()),
            annotations: Some(BTreeMap::from([(
                BACKUP_TARGET_ANNOTATION.to_string(),
                "elsewhere-0".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    });

    let err = reconcile_cluster(&ctx, NS, "demo").await.unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(err.stage(), Some(Stage::Backup));
    let stored: Job = ctx.client.object(NS, JOB).unwrap();
    assert_eq!(stored, seeded);
}

#[tokio::test]
async fn test_disabling_backups_clears_status() {
    let ctx = test_context(&[backup_cluster()]);
    reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    ctx.client
        .modify::<PostgresCluster>(NS, "demo", |c| c.spec.backups = None);
    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert_eq!(requeue, Requeue::None);
    let stored: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    let status = stored.status.unwrap();
    assert!(status.backups.is_none());
    assert!(
        !status
            .conditions
            .iter()
            .any(|c| c.type_ == condition_types::BACKUP_REPO_READY)
    );
}
