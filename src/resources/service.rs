//! Services and Endpoints that route traffic to cluster instances
//!
//! Patroni holds its leader lease on the Endpoints of the leader Service, so
//! that Service has no selector. The primary Service mirrors the leader by
//! pointing its own Endpoints at the leader Service's cluster IP.

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort,
    ServiceSpec as K8sServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::PostgresCluster;
use crate::naming;
use crate::resources::common::{cluster_labels, instance_selector, object_meta, patroni_labels};

/// Name of the PostgreSQL port on every Service
pub const POSTGRES_PORT_NAME: &str = "postgres";

fn postgres_port(cluster: &PostgresCluster) -> ServicePort {
    let port = cluster.postgres_port();
    ServicePort {
        name: Some(POSTGRES_PORT_NAME.to_string()),
        port,
        target_port: Some(IntOrString::String(POSTGRES_PORT_NAME.to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate the headless Service that gives every instance pod a DNS name
pub fn generate_pod_service(cluster: &PostgresCluster) -> Service {
    Service {
        metadata: object_meta(
            cluster,
            naming::cluster_pod_service(cluster),
            cluster_labels(cluster),
        ),
        spec: Some(K8sServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(instance_selector(cluster)),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the Service whose Endpoints Patroni uses as its leader lease
pub fn generate_leader_service(cluster: &PostgresCluster) -> Service {
    Service {
        metadata: object_meta(
            cluster,
            naming::patroni_leader_service(cluster),
            patroni_labels(cluster),
        ),
        spec: Some(K8sServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![postgres_port(cluster)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the headless Service clients use to reach the primary
pub fn generate_primary_service(cluster: &PostgresCluster) -> Service {
    Service {
        metadata: object_meta(
            cluster,
            naming::cluster_primary_service(cluster),
            cluster_labels(cluster),
        ),
        spec: Some(K8sServiceSpec {
            cluster_ip: Some("None".to_string()),
            ports: Some(vec![postgres_port(cluster)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the Endpoints of the primary Service, pointing at `leader_ip`
pub fn generate_primary_endpoints(cluster: &PostgresCluster, leader_ip: &str) -> Endpoints {
    Endpoints {
        metadata: object_meta(
            cluster,
            naming::cluster_primary_service(cluster),
            cluster_labels(cluster),
        ),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: leader_ip.to_string(),
                ..Default::default()
            }]),
            ports: Some(vec![EndpointPort {
                name: Some(POSTGRES_PORT_NAME.to_string()),
                port: cluster.postgres_port(),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

/// Cluster IP of a Service once the platform assigned one
pub fn cluster_ip(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
}
