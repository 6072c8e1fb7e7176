//! Unit tests for configuration generators
//!
//! Rendered configuration must be a pure function of the cluster spec, with
//! HBA rules in a fixed precedence order.

use postgres_cluster_operator::crd::PostgresCluster;
use postgres_cluster_operator::resources::pgbouncer::config::cluster_ini;
use postgres_cluster_operator::resources::{patroni, pgbouncer};

use crate::common::*;

fn defaulted(mut cluster: PostgresCluster) -> PostgresCluster {
    cluster.set_defaults();
    cluster
}

mod hba_tests {
    use super::*;

    #[test]
    fn test_mandatory_rules_precede_defaults() {
        let cluster = defaulted(create_test_cluster("demo", "ns1"));
        let rendered = patroni::cluster_hbas(&cluster).rendered();

        assert_eq!(rendered[0], "local all \"postgres\" peer");
        assert_eq!(rendered.last().unwrap(), "hostssl all all all md5");
        let default_at = rendered
            .iter()
            .position(|r| r == "hostssl all all all md5")
            .unwrap();
        assert_eq!(default_at, rendered.len() - 1);
    }

    #[test]
    fn test_pooler_rules_are_mandatory() {
        let cluster = defaulted(
            PostgresClusterBuilder::new("demo", "ns1")
                .with_pgbouncer()
                .build(),
        );
        let hbas = patroni::cluster_hbas(&cluster);
        let rendered = hbas.rendered();

        let pooler: Vec<String> = pgbouncer::postgres_hbas()
            .iter()
            .map(ToString::to_string)
            .collect();
        let first = rendered.iter().position(|r| *r == pooler[0]).unwrap();
        let second = rendered.iter().position(|r| *r == pooler[1]).unwrap();
        let default_at = rendered
            .iter()
            .position(|r| r == "hostssl all all all md5")
            .unwrap();

        assert!(first < second);
        assert!(second < default_at);
        assert_eq!(
            rendered[first],
            "hostssl all \"_pgbouncer\" all scram-sha-256"
        );
        assert_eq!(rendered[second], "host all \"_pgbouncer\" all reject");
    }

    #[test]
    fn test_no_pooler_rules_without_pooler() {
        let cluster = defaulted(create_test_cluster("demo", "ns1"));
        let rendered = patroni::cluster_hbas(&cluster).rendered();
        assert!(!rendered.iter().any(|r| r.contains("_pgbouncer")));
    }
}

mod determinism_tests {
    use super::*;

    fn cluster() -> PostgresCluster {
        defaulted(
            PostgresClusterBuilder::new("demo", "ns1")
                .with_param("max_connections", "200")
                .with_param("work_mem", "8MB")
                .with_pgbouncer()
                .build(),
        )
    }

    #[test]
    fn test_patroni_yaml_is_stable() {
        let a = cluster();
        let b = cluster();
        let yaml_a = patroni::cluster_yaml(
            &a,
            &patroni::cluster_hbas(&a),
            &patroni::cluster_parameters(&a),
        )
        .unwrap();
        let yaml_b = patroni::cluster_yaml(
            &b,
            &patroni::cluster_hbas(&b),
            &patroni::cluster_parameters(&b),
        )
        .unwrap();
        assert_eq!(yaml_a, yaml_b);
        assert!(yaml_a.contains("max_connections: '200'"));
    }

    #[test]
    fn test_pgbouncer_ini_is_stable() {
        assert_eq!(cluster_ini(&cluster()), cluster_ini(&cluster()));
    }

    #[test]
    fn test_mandatory_parameters_win() {
        let cluster = defaulted(
            PostgresClusterBuilder::new("demo", "ns1")
                .with_param("wal_level", "minimal")
                .with_param("SSL", "off")
                .build(),
        );
        let parameters = patroni::cluster_parameters(&cluster);
        assert_eq!(parameters.get("wal_level"), Some("logical"));
        assert_eq!(parameters.get("ssl"), Some("on"));
    }

    #[test]
    fn test_dynamic_configuration_carries_hbas_in_order() {
        let cluster = cluster();
        let hbas = patroni::cluster_hbas(&cluster);
        let dcs = patroni::dynamic_configuration(
            &cluster,
            &hbas,
            &patroni::cluster_parameters(&cluster),
        );
        let pg_hba: Vec<String> = dcs["postgresql"]["pg_hba"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(pg_hba, hbas.rendered());
        assert_eq!(dcs["ttl"], 30);
        assert_eq!(dcs["loop_wait"], 10);
    }
}
