//! PgBouncer pooler lifecycle

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::core::ObjectMeta;

use postgres_cluster_operator::controller::reconcile_cluster;
use postgres_cluster_operator::crd::PostgresCluster;
use postgres_cluster_operator::naming::{
    PGBOUNCER_AUTH_FILE_KEY, PGBOUNCER_INI_KEY, PGBOUNCER_PASSWORD_KEY,
};

use crate::common::*;

const NS: &str = "ns1";
const POOLER: &str = "demo-pgbouncer";

#[tokio::test]
async fn test_pooler_objects() {
    let cluster = PostgresClusterBuilder::new("demo", NS)
        .with_pgbouncer_port(6432)
        .build();
    let ctx = test_context(&[cluster]);

    reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert!(ctx.client.contains::<Deployment>(NS, POOLER));
    let service: Service = ctx.client.object(NS, POOLER).unwrap();
    assert_eq!(service.spec.unwrap().ports.unwrap()[0].port, 6432);

    let config: ConfigMap = ctx.client.object(NS, POOLER).unwrap();
    let data = config.data.unwrap();
    assert!(data[PGBOUNCER_INI_KEY].contains("listen_port = 6432"));
    assert!(data[PGBOUNCER_INI_KEY].contains("* = host=demo-primary port=5432"));

    let secret: Secret = ctx.client.object(NS, POOLER).unwrap();
    let data = secret.data.unwrap();
    let password = String::from_utf8(data[PGBOUNCER_PASSWORD_KEY].0.clone()).unwrap();
    let auth_file = String::from_utf8(data[PGBOUNCER_AUTH_FILE_KEY].0.clone()).unwrap();
    assert_eq!(auth_file, format!("\"_pgbouncer\" \"{}\"\n", password));

    let stored: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    let proxy = stored.status.unwrap().proxy.unwrap();
    assert_eq!(proxy.replicas, 1);
    assert_eq!(proxy.ready_replicas, 0);
}

#[tokio::test]
async fn test_pooler_teardown() {
    let cluster = PostgresClusterBuilder::new("demo", NS)
        .with_pgbouncer()
        .build();
    let ctx = test_context(&[cluster]);
    reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    ctx.client
        .modify::<PostgresCluster>(NS, "demo", |c| c.spec.proxy = None);
    reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert!(!ctx.client.contains::<Deployment>(NS, POOLER));
    assert!(!ctx.client.contains::<Service>(NS, POOLER));
    assert!(!ctx.client.contains::<ConfigMap>(NS, POOLER));
    assert!(!ctx.client.contains::<Secret>(NS, POOLER));
    let stored: PostgresCluster = ctx.client.object(NS, "demo").unwrap();
    assert!(stored.status.unwrap().proxy.is_none());
    assert!(ctx.client.contains::<Service>(NS, "demo-primary"));
}

#[tokio::test]
async fn test_teardown_keeps_foreign_objects() {
    let ctx = test_context(&[create_test_cluster("demo", NS)]);
    ctx.client.seed(&ConfigMap {
        metadata: ObjectMeta {
            name: Some(POOLER.to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("owner".to_string(), "someone".to_string())])),
        ..Default::default()
    });

    reconcile_cluster(&ctx, NS, "demo").await.unwrap();

    assert!(ctx.client.contains::<ConfigMap>(NS, POOLER));
}
