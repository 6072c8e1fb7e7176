//! Platform access used by the reconciler
//!
//! The pipeline never talks to `kube::Api` directly. Every read and write
//! goes through [`ClusterClient`], which [`KubeClient`] implements against a
//! live API server and the test suite implements in memory.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::controller::error::Result;
use crate::crd::PostgresCluster;
use crate::naming::FIELD_MANAGER;

/// Namespaced object kinds the operator reads and writes
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Operations the reconciler needs from the platform
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Fetch an object; `None` when it does not exist
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List the objects in `namespace` carrying every label in `selector`
    async fn list<K: Managed>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>>;

    /// Create an object that does not exist yet
    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Server-side apply of the full intent under the operator's field
    /// manager. When `metadata.resourceVersion` is set the write only
    /// succeeds against that version.
    async fn apply<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// JSON merge patch of an object
    async fn merge_patch<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// JSON merge patch of an object's status subresource
    async fn patch_status<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// Delete an object; deleting something already gone is not an error
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()>;

    /// Record an event against a cluster. Best effort.
    async fn publish_event(
        &self,
        cluster: &PostgresCluster,
        type_: EventType,
        reason: &str,
        note: &str,
    );
}

/// Render a selector as `key=value` pairs joined by commas
pub fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    recorder: Recorder,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    fn api<K: Managed>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn merge_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&label_selector(selector));
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn apply<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .api::<K>(namespace)
            .patch(&name, &params, &Patch::Apply(obj))
            .await?)
    }

    async fn merge_patch<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .patch(name, &Self::merge_params(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .patch_status(name, &Self::merge_params(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(kind = %K::kind(&()), name, "Already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_event(
        &self,
        cluster: &PostgresCluster,
        type_: EventType,
        reason: &str,
        note: &str,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&event, &cluster.object_ref(&()))
            .await
        {
            warn!(reason, error = %e, "Failed to publish event");
        }
    }
}
