//! Deletion handling

use std::time::Duration;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use postgres_cluster_operator::controller::{Requeue, reconcile_cluster};
use postgres_cluster_operator::crd::PostgresCluster;
use postgres_cluster_operator::naming::FINALIZER;
use postgres_cluster_operator::resources::common::instance_set_labels;

use crate::common::*;

const NS: &str = "ns1";

fn mark_deleted(client: &FakeClient) {
    client.modify::<PostgresCluster>(NS, "demo", |c| {
        c.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap());
    });
}

#[tokio::test]
async fn test_scale_down_then_release() {
    let ctx = test_context(&[create_test_cluster("demo", NS)]);
    reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    mark_deleted(&ctx.client);
    let keys = ctx.client.keys();

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    assert_eq!(requeue, Requeue::After(Duration::from_secs(5)));

    let sts: StatefulSet = ctx.client.object(NS, "demo-00").unwrap();
    assert_eq!(sts.spec.unwrap().replicas, Some(0));
    let cluster: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    assert!(cluster.finalizers().contains(&FINALIZER.to_string()));

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    assert_eq!(requeue, Requeue::None);

    let cluster: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    assert!(cluster.finalizers().is_empty());
    assert_eq!(ctx.client.keys(), keys);

    let events = ctx.client.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].warning);
    assert_eq!(events[0].reason, "DeletionComplete");
}

#[tokio::test]
async fn test_waits_for_running_pods() {
    let ctx = test_context(&[create_test_cluster("demo", NS)]);
    reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    ctx.client.modify::<StatefulSet>(NS, "demo-00", |sts| {
        sts.spec.as_mut().unwrap().replicas = Some(0);
        sts.status = Some(StatefulSetStatus {
            replicas: 1,
            ..Default::default()
        });
    });
    mark_deleted(&ctx.client);

    let mutations = ctx.client.mutation_count();
    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert_eq!(requeue, Requeue::After(Duration::from_secs(5)));
    assert_eq!(ctx.client.mutation_count(), mutations);
    assert!(ctx.client.events().is_empty());
}

#[tokio::test]
async fn test_deletion_before_first_reconcile() {
    let cluster = PostgresClusterBuilder::new("demo", NS)
        .with_finalizer(FINALIZER)
        .deleting()
        .build();
    let ctx = test_context(&[cluster]);

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert_eq!(requeue, Requeue::None);
    assert_eq!(ctx.client.keys(), vec!["PostgresCluster/demo".to_string()]);
    let cluster: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    assert!(cluster.finalizers().is_empty());
}

#[tokio::test]
async fn test_released_cluster_is_left_alone() {
    let cluster = PostgresClusterBuilder::new("demo", NS)
        .with_finalizer("example.com/other")
        .deleting()
        .build();
    let ctx = test_context(&[cluster]);

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert_eq!(requeue, Requeue::None);
    assert_eq!(ctx.client.write_count(), 0);
    assert!(ctx.client.events().is_empty());
}

#[tokio::test]
async fn test_removed_instance_set_is_scaled_down() {
    let cluster = PostgresClusterBuilder::new("demo", NS)
        .with_instance_set("a", 1)
        .add_instance_set("b", 1)
        .build();
    let ctx = test_context(&[cluster]);
    reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    assert!(ctx.client.contains::<StatefulSet>(NS, "demo-b"));

    ctx.client.modify::<PostgresCluster>(NS, "demo", |c| {
        c.spec.instances.retain(|set| set.name == "a");
    });
    mark_deleted(&ctx.client);

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    assert_eq!(requeue, Requeue::After(Duration::from_secs(5)));
    for name in ["demo-a", "demo-b"] {
        let sts: StatefulSet = ctx.client.object(NS, name).unwrap();
        assert_eq!(sts.spec.unwrap().replicas, Some(0), "{}", name);
    }

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();
    assert_eq!(requeue, Requeue::None);
    let cluster: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    assert!(cluster.finalizers().is_empty());
}

#[tokio::test]
async fn test_foreign_statefulset_is_not_scaled() {
    let cluster = PostgresClusterBuilder::new("demo", NS)
        .with_finalizer(FINALIZER)
        .deleting()
        .build();
    let seeded = StatefulSet {
        metadata: ObjectMeta {
            name: Some("demo-00".to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(instance_set_labels(&cluster, "00")),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "someone-else".to_string(),
                uid: "foreign-uid".to_string(),
                controller: Some(true),
                block_owner_deletion: None,
            }]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(2),
            ..Default::default()
        }),
        ..Default::default()
    };
    let ctx = test_context(&[cluster]);
    let seeded = ctx.client.seed(&seeded);

    let requeue = reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert_eq!(requeue, Requeue::None);
    let stored: StatefulSet = ctx.client.object(NS, "demo-00").unwrap();
    assert_eq!(stored, seeded);
    let cluster: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    assert!(cluster.finalizers().is_empty());
}
