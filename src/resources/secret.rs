use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use crate::crd::PostgresCluster;
use crate::naming::{
    self, USER_SECRET_PASSWORD_KEY, USER_SECRET_REPLICATION_PASSWORD_KEY, USER_SECRET_USER_KEY,
};
use crate::resources::common::{cluster_labels, generate_password, object_meta, secret_value};

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 24;

/// Generate the bootstrap credentials Secret.
///
/// Passwords already stored in `existing` are kept so the Secret only changes
/// when it is first created.
pub fn generate_user_secret(cluster: &PostgresCluster, existing: Option<&Secret>) -> Secret {
    let data = existing.and_then(|s| s.data.as_ref());
    let password = secret_value(data, USER_SECRET_PASSWORD_KEY)
        .unwrap_or_else(|| generate_password(PASSWORD_LENGTH));
    let replication_password = secret_value(data, USER_SECRET_REPLICATION_PASSWORD_KEY)
        .unwrap_or_else(|| generate_password(PASSWORD_LENGTH));

    let host = format!(
        "{}.{}.svc",
        naming::cluster_primary_service(cluster),
        cluster.namespace().unwrap_or_default()
    );

    let data = BTreeMap::from([
        (
            USER_SECRET_USER_KEY.to_string(),
            ByteString(cluster.name_any().into_bytes()),
        ),
        (
            USER_SECRET_PASSWORD_KEY.to_string(),
            ByteString(password.into_bytes()),
        ),
        (
            USER_SECRET_REPLICATION_PASSWORD_KEY.to_string(),
            ByteString(replication_password.into_bytes()),
        ),
        ("host".to_string(), ByteString(host.into_bytes())),
        (
            "port".to_string(),
            ByteString(cluster.postgres_port().to_string().into_bytes()),
        ),
    ]);

    Secret {
        metadata: object_meta(
            cluster,
            naming::cluster_user_secret(cluster),
            cluster_labels(cluster),
        ),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}
