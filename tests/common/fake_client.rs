//! In-memory [`ClusterClient`] for reconciler tests
//!
//! Objects are stored as JSON keyed by (kind, namespace, name). Writes follow
//! the API server closely enough for the reconciler's needs:
//! - every stored object carries a `resourceVersion`, bumped only when its
//!   content changes
//! - a write carrying a stale `resourceVersion` fails with a conflict
//! - apply merges the intent into the stored object, merge patches follow
//!   RFC 7386
//! - Services that are not headless get a cluster IP on creation

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use kube::runtime::events::EventType;
use serde_json::{Value, json};

use postgres_cluster_operator::client::{ClusterClient, Managed};
use postgres_cluster_operator::controller::{Error, Result};
use postgres_cluster_operator::crd::PostgresCluster;

type Key = (String, String, String);

/// Event recorded by [`FakeClient::publish_event`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
pub struct FakeClient {
    store: Mutex<BTreeMap<Key, Value>>,
    events: Mutex<Vec<RecordedEvent>>,
    version: AtomicU64,
    next_ip: AtomicU64,
    writes: AtomicUsize,
    mutations: AtomicUsize,
}

fn key<K: Managed>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge_patch(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn resource_version(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

#[allow(dead_code)]
impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_version(stored: &Value, requested: Option<&str>, name: &str) -> Result<()> {
        match requested {
            Some(v) if Some(v) != resource_version(stored) => Err(Error::Conflict(format!(
                "{} was modified (have {:?}, requested {})",
                name,
                resource_version(stored),
                v
            ))),
            _ => Ok(()),
        }
    }

    /// Replace the stored object when `updated` differs from it
    fn commit(&self, key: Key, stored: Value, mut updated: Value) -> Value {
        updated["metadata"]["resourceVersion"] = stored["metadata"]["resourceVersion"].clone();
        if updated == stored {
            return stored;
        }
        updated["metadata"]["resourceVersion"] = json!(self.bump());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.store
            .lock()
            .unwrap()
            .insert(key, updated.clone());
        updated
    }

    fn insert_value(&self, key: Key, mut value: Value) -> Value {
        let (kind, namespace, name) = &key;
        value["metadata"]["namespace"] = json!(namespace);
        value["metadata"]["resourceVersion"] = json!(self.bump());
        if value.pointer("/metadata/uid").is_none() {
            value["metadata"]["uid"] = json!(format!("uid-{}-{}", kind.to_lowercase(), name));
        }
        if kind == "Service" {
            let cluster_ip = value.pointer("/spec/clusterIP").and_then(Value::as_str);
            if cluster_ip.is_none() {
                let n = self.next_ip.fetch_add(1, Ordering::SeqCst) + 10;
                value["spec"]["clusterIP"] = json!(format!("10.96.0.{}", n));
            }
        }
        self.store
            .lock()
            .unwrap()
            .insert(key, value.clone());
        value
    }

    /// Seed an object without counting it as a write
    pub fn seed<K: Managed>(&self, obj: &K) -> K {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let value = serde_json::to_value(obj).unwrap();
        let stored = self.insert_value(key::<K>(&namespace, &name), value);
        serde_json::from_value(stored).unwrap()
    }

    /// Mutate a stored object out of band, as another writer would
    pub fn modify<K: Managed>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let key = key::<K>(namespace, name);
        let stored = self.store.lock().unwrap().get(&key).cloned().unwrap();
        let mut obj: K = serde_json::from_value(stored.clone()).unwrap();
        f(&mut obj);
        let updated = serde_json::to_value(&obj).unwrap();
        self.commit(key, stored, updated);
    }

    pub fn object<K: Managed>(&self, namespace: &str, name: &str) -> Option<K> {
        self.store
            .lock()
            .unwrap()
            .get(&key::<K>(namespace, name))
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap())
    }

    pub fn contains<K: Managed>(&self, namespace: &str, name: &str) -> bool {
        self.store
            .lock()
            .unwrap()
            .contains_key(&key::<K>(namespace, name))
    }

    /// Stored objects as `Kind/name`
    pub fn keys(&self) -> Vec<String> {
        self.store
            .lock()
            .unwrap()
            .keys()
            .map(|(kind, _, name)| format!("{}/{}", kind, name))
            .collect()
    }

    /// Number of write calls, whether or not they changed anything
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of writes that changed stored state
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let stored = self
            .store
            .lock()
            .unwrap()
            .get(&key::<K>(namespace, name))
            .cloned();
        Ok(stored.map(serde_json::from_value).transpose()?)
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let matching: Vec<Value> = self
            .store
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter(|(_, obj)| {
                selector.iter().all(|(label, value)| {
                    obj.pointer("/metadata/labels")
                        .and_then(|labels| labels.get(label))
                        .and_then(Value::as_str)
                        == Some(value.as_str())
                })
            })
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(matching
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let name = obj.meta().name.clone().unwrap_or_default();
        let key = key::<K>(namespace, &name);
        if self.store.lock().unwrap().contains_key(&key) {
            return Err(Error::Conflict(format!("{} already exists", name)));
        }
        let mut value = serde_json::to_value(obj)?;
        if let Some(metadata) = value["metadata"].as_object_mut() {
            metadata.remove("resourceVersion");
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(self.insert_value(key, value))?)
    }

    async fn apply<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let name = obj.meta().name.clone().unwrap_or_default();
        let key = key::<K>(namespace, &name);
        let intent = serde_json::to_value(obj)?;
        let stored = self.store.lock().unwrap().get(&key).cloned();
        let Some(stored) = stored else {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            return Ok(serde_json::from_value(self.insert_value(key, intent))?);
        };
        Self::check_version(&stored, resource_version(&intent), &name)?;
        let mut updated = stored.clone();
        merge_patch(&mut updated, &intent);
        Ok(serde_json::from_value(self.commit(key, stored, updated))?)
    }

    async fn merge_patch<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = key::<K>(namespace, name);
        let stored = self
            .store
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Self::check_version(&stored, resource_version(patch), name)?;
        let mut updated = stored.clone();
        merge_patch(&mut updated, patch);
        Ok(serde_json::from_value(self.commit(key, stored, updated))?)
    }

    async fn patch_status<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = key::<K>(namespace, name);
        let stored = self
            .store
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Self::check_version(&stored, resource_version(patch), name)?;
        let mut updated = stored.clone();
        if let Some(status) = patch.get("status") {
            merge_patch(&mut updated, &json!({ "status": status }));
        }
        Ok(serde_json::from_value(self.commit(key, stored, updated))?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self
            .store
            .lock()
            .unwrap()
            .remove(&key::<K>(namespace, name))
            .is_some()
        {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn publish_event(
        &self,
        _cluster: &PostgresCluster,
        type_: EventType,
        reason: &str,
        note: &str,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note: note.to_string(),
        });
    }
}
