//! Weft object store seam.
//!
//! The real cluster store is an external collaborator; the reconciler only
//! sees the [`ObjectStore`] trait. [`MemoryStore`] is the in-process
//! implementation used by tests and by `weftctl render`, faithful enough to
//! exercise the eventual-consistency properties: uid identity, generation
//! bumps on spec changes, owner-reference cascade delete, and change events.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value as Json};
use tokio::sync::broadcast;
use tracing::debug;
use weft_core::StoreError;

/// Fully-qualified object address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.into(),
        }
    }

    /// Address a weft-owned kind.
    pub fn weft(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self::new(weft_core::API_VERSION, kind, namespace, name)
    }
}

/// Change notification emitted on every mutation.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, r: &ObjectRef) -> Result<Option<Json>, StoreError>;
    /// All objects of a kind, across namespaces, name-ordered.
    async fn list(&self, api_version: &str, kind: &str) -> Result<Vec<Json>, StoreError>;
    async fn create(&self, obj: Json) -> Result<Json, StoreError>;
    async fn update(&self, obj: Json) -> Result<Json, StoreError>;
    /// Atomic replacement of the status subresource. Never bumps generation.
    async fn update_status(&self, r: &ObjectRef, status: Json) -> Result<Json, StoreError>;
    async fn delete(&self, r: &ObjectRef) -> Result<(), StoreError>;
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, StoreError>;
}

/// Build a k8s-style envelope object. Used by tests and the CLI loader.
pub fn make_object(api_version: &str, kind: &str, namespace: Option<&str>, name: &str, spec: Json) -> Json {
    let mut metadata = json!({ "name": name });
    if let Some(ns) = namespace {
        metadata["namespace"] = Json::String(ns.to_string());
    }
    json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": metadata,
        "spec": spec,
    })
}

type Key = (String, String, Option<String>, String);

fn envelope(obj: &Json) -> Result<(String, String, Option<String>, String), StoreError> {
    let api_version = obj
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StoreError::Api("object missing apiVersion".into()))?;
    let kind = obj
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StoreError::Api("object missing kind".into()))?;
    let meta = obj.get("metadata").ok_or_else(|| StoreError::Api("object missing metadata".into()))?;
    let name = meta
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StoreError::Api("object missing metadata.name".into()))?;
    let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok((api_version.to_string(), kind.to_string(), namespace, name.to_string()))
}

/// In-memory store with broadcast change events and a write counter.
pub struct MemoryStore {
    objects: Mutex<FxHashMap<Key, Json>>,
    cluster_scoped: Mutex<FxHashSet<(String, String)>>,
    writes: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let mut cluster_scoped = FxHashSet::default();
        // Weft definitions are cluster-scoped, like the CRDs they model.
        for kind in [
            weft_core::kinds::SUPPLY_CHAIN,
            weft_core::kinds::SOURCE_TEMPLATE,
            weft_core::kinds::IMAGE_TEMPLATE,
            weft_core::kinds::CONFIG_TEMPLATE,
            weft_core::kinds::GENERIC_TEMPLATE,
        ] {
            cluster_scoped.insert((weft_core::API_VERSION.to_string(), kind.to_string()));
        }
        Self {
            objects: Mutex::new(FxHashMap::default()),
            cluster_scoped: Mutex::new(cluster_scoped),
            writes: AtomicU64::new(0),
            events,
        }
    }

    /// Declare a kind cluster-scoped (no namespace in its identity).
    pub fn mark_cluster_scoped(&self, api_version: &str, kind: &str) {
        self.cluster_scoped
            .lock()
            .expect("cluster_scoped lock")
            .insert((api_version.to_string(), kind.to_string()));
    }

    /// Total mutations so far; lets tests assert "zero additional writes".
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn scoped(&self, api_version: &str, kind: &str) -> bool {
        !self
            .cluster_scoped
            .lock()
            .expect("cluster_scoped lock")
            .contains(&(api_version.to_string(), kind.to_string()))
    }

    fn key_for(&self, r: &ObjectRef) -> Key {
        let ns = if self.scoped(&r.api_version, &r.kind) { r.namespace.clone() } else { None };
        (r.api_version.clone(), r.kind.clone(), ns, r.name.clone())
    }

    fn emit(&self, key: &Key) {
        let _ = self.events.send(StoreEvent {
            api_version: key.0.clone(),
            kind: key.1.clone(),
            namespace: key.2.clone(),
            name: key.3.clone(),
        });
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, r: &ObjectRef) -> Result<Option<Json>, StoreError> {
        let key = self.key_for(r);
        Ok(self.objects.lock().expect("objects lock").get(&key).cloned())
    }

    async fn list(&self, api_version: &str, kind: &str) -> Result<Vec<Json>, StoreError> {
        let mut out: Vec<Json> = self
            .objects
            .lock()
            .expect("objects lock")
            .iter()
            .filter(|((av, k, _, _), _)| av == api_version && k == kind)
            .map(|(_, v)| v.clone())
            .collect();
        out.sort_by(|a, b| {
            let an = a["metadata"]["name"].as_str().unwrap_or("");
            let bn = b["metadata"]["name"].as_str().unwrap_or("");
            an.cmp(bn)
        });
        Ok(out)
    }

    async fn create(&self, mut obj: Json) -> Result<Json, StoreError> {
        let (api_version, kind, namespace, name) = envelope(&obj)?;
        let ns = if self.scoped(&api_version, &kind) { namespace } else { None };
        let key = (api_version, kind, ns, name.clone());
        let mut objects = self.objects.lock().expect("objects lock");
        if objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("already exists: {name}")));
        }
        let meta = obj["metadata"]
            .as_object_mut()
            .ok_or_else(|| StoreError::Api("metadata is not an object".into()))?;
        meta.entry("uid".to_string())
            .or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
        meta.insert("resourceVersion".into(), Json::String("1".into()));
        meta.insert("generation".into(), json!(1));
        objects.insert(key.clone(), obj.clone());
        drop(objects);
        self.record_write();
        self.emit(&key);
        debug!(kind = %key.1, name = %key.3, "store: created");
        Ok(obj)
    }

    async fn update(&self, mut obj: Json) -> Result<Json, StoreError> {
        let (api_version, kind, namespace, name) = envelope(&obj)?;
        let ns = if self.scoped(&api_version, &kind) { namespace } else { None };
        let key = (api_version, kind, ns, name.clone());
        let mut objects = self.objects.lock().expect("objects lock");
        let old = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        let old_rv: u64 = old["metadata"]["resourceVersion"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0);
        let old_gen = old["metadata"]["generation"].as_i64().unwrap_or(1);
        let spec_changed = old.get("spec") != obj.get("spec");
        {
            let meta = obj["metadata"]
                .as_object_mut()
                .ok_or_else(|| StoreError::Api("metadata is not an object".into()))?;
            if let Some(uid) = old["metadata"]["uid"].as_str() {
                meta.insert("uid".into(), Json::String(uid.to_string()));
            }
            meta.insert("resourceVersion".into(), Json::String((old_rv + 1).to_string()));
            meta.insert("generation".into(), json!(if spec_changed { old_gen + 1 } else { old_gen }));
        }
        // Status only moves through update_status.
        if let Some(status) = old.get("status") {
            obj["status"] = status.clone();
        } else if let Some(map) = obj.as_object_mut() {
            map.remove("status");
        }
        objects.insert(key.clone(), obj.clone());
        drop(objects);
        self.record_write();
        self.emit(&key);
        debug!(kind = %key.1, name = %key.3, spec_changed, "store: updated");
        Ok(obj)
    }

    async fn update_status(&self, r: &ObjectRef, status: Json) -> Result<Json, StoreError> {
        let key = self.key_for(r);
        let mut objects = self.objects.lock().expect("objects lock");
        let obj = objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(r.name.clone()))?;
        // An unchanged status is not a write: keeps rewrites of the same
        // conditions from generating fresh change events.
        if obj.get("status") == Some(&status) {
            return Ok(obj.clone());
        }
        let old_rv: u64 = obj["metadata"]["resourceVersion"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0);
        obj["status"] = status;
        obj["metadata"]["resourceVersion"] = Json::String((old_rv + 1).to_string());
        let out = obj.clone();
        drop(objects);
        self.record_write();
        self.emit(&key);
        Ok(out)
    }

    async fn delete(&self, r: &ObjectRef) -> Result<(), StoreError> {
        let key = self.key_for(r);
        let mut objects = self.objects.lock().expect("objects lock");
        let removed = objects.remove(&key).ok_or_else(|| StoreError::NotFound(r.name.clone()))?;
        let mut removed_keys = vec![key];
        // Cascade: anything owned (transitively) by a removed uid goes too.
        let mut owner_uids: Vec<String> =
            removed["metadata"]["uid"].as_str().map(|s| vec![s.to_string()]).unwrap_or_default();
        while let Some(uid) = owner_uids.pop() {
            let dependents: Vec<Key> = objects
                .iter()
                .filter(|(_, v)| {
                    v["metadata"]["ownerReferences"]
                        .as_array()
                        .map(|refs| refs.iter().any(|or| or["uid"].as_str() == Some(uid.as_str())))
                        .unwrap_or(false)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for dep in dependents {
                if let Some(gone) = objects.remove(&dep) {
                    if let Some(dep_uid) = gone["metadata"]["uid"].as_str() {
                        owner_uids.push(dep_uid.to_string());
                    }
                    removed_keys.push(dep);
                }
            }
        }
        drop(objects);
        for k in &removed_keys {
            self.record_write();
            self.emit(k);
        }
        debug!(count = removed_keys.len(), "store: deleted (with cascade)");
        Ok(())
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, StoreError> {
        Ok(self.scoped(api_version, kind))
    }
}
