//! Weft kubehub: discovery, the kube-backed object store, and watcher wiring.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, OnceLock};

use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashSet;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};
use weft_core::{kinds, StoreError, WorkloadKey};
use weft_runtime::{MemoryQueue, Reconciler};
use weft_stamp::WatchHub;
use weft_store::{ObjectRef, ObjectStore};

fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    GroupVersionKind { group, version, kind: kind.to_string() }
}

fn store_err(e: kube::Error) -> StoreError {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message.clone()),
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(resp.message.clone()),
        _ => StoreError::Api(e.to_string()),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), StoreError> {
    let discovery = Discovery::new(client).run().await.map_err(store_err)?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(StoreError::Api(format!("GVK not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Cluster-backed [`ObjectStore`]. Resolves kinds through discovery once and
/// caches the result for the process lifetime.
pub struct KubeStore {
    client: Client,
    resolved: Mutex<rustc_hash::FxHashMap<(String, String), (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: Mutex::new(rustc_hash::FxHashMap::default()) }
    }

    pub async fn connect() -> Result<Self, StoreError> {
        let client = Client::try_default().await.map_err(store_err)?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    async fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), StoreError> {
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(hit) = self.resolved.lock().expect("resolve lock").get(&cache_key) {
            return Ok(hit.clone());
        }
        let found = find_api_resource(self.client.clone(), &gvk_of(api_version, kind)).await?;
        self.resolved.lock().expect("resolve lock").insert(cache_key, found.clone());
        Ok(found)
    }

    async fn api_for(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resolve(api_version, kind).await?;
        Ok(if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, r: &ObjectRef) -> Result<Option<Json>, StoreError> {
        let api = self.api_for(&r.api_version, &r.kind, r.namespace.as_deref()).await?;
        match api.get_opt(&r.name).await.map_err(store_err)? {
            Some(obj) => {
                let mut v = serde_json::to_value(&obj).map_err(|e| StoreError::Api(e.to_string()))?;
                strip_managed_fields(&mut v);
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, api_version: &str, kind: &str) -> Result<Vec<Json>, StoreError> {
        let api = self.api_for(api_version, kind, None).await?;
        let listed = api.list(&ListParams::default()).await.map_err(store_err)?;
        let mut out = Vec::with_capacity(listed.items.len());
        for obj in &listed.items {
            let mut v = serde_json::to_value(obj).map_err(|e| StoreError::Api(e.to_string()))?;
            strip_managed_fields(&mut v);
            out.push(v);
        }
        out.sort_by(|a, b| {
            let an = a["metadata"]["name"].as_str().unwrap_or("");
            let bn = b["metadata"]["name"].as_str().unwrap_or("");
            an.cmp(bn)
        });
        Ok(out)
    }

    async fn create(&self, obj: Json) -> Result<Json, StoreError> {
        let api_version = obj["apiVersion"].as_str().unwrap_or_default().to_string();
        let kind = obj["kind"].as_str().unwrap_or_default().to_string();
        let namespace = obj["metadata"]["namespace"].as_str().map(|s| s.to_string());
        let api = self.api_for(&api_version, &kind, namespace.as_deref()).await?;
        let dynamic: DynamicObject =
            serde_json::from_value(obj).map_err(|e| StoreError::Api(e.to_string()))?;
        let created = api.create(&PostParams::default(), &dynamic).await.map_err(store_err)?;
        serde_json::to_value(&created).map_err(|e| StoreError::Api(e.to_string()))
    }

    async fn update(&self, obj: Json) -> Result<Json, StoreError> {
        let api_version = obj["apiVersion"].as_str().unwrap_or_default().to_string();
        let kind = obj["kind"].as_str().unwrap_or_default().to_string();
        let namespace = obj["metadata"]["namespace"].as_str().map(|s| s.to_string());
        let name = obj["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let api = self.api_for(&api_version, &kind, namespace.as_deref()).await?;
        let dynamic: DynamicObject =
            serde_json::from_value(obj).map_err(|e| StoreError::Api(e.to_string()))?;
        let updated =
            api.replace(&name, &PostParams::default(), &dynamic).await.map_err(store_err)?;
        serde_json::to_value(&updated).map_err(|e| StoreError::Api(e.to_string()))
    }

    async fn update_status(&self, r: &ObjectRef, status: Json) -> Result<Json, StoreError> {
        let api = self.api_for(&r.api_version, &r.kind, r.namespace.as_deref()).await?;
        let patch = json!({ "status": status });
        let patched = api
            .patch_status(&r.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(store_err)?;
        serde_json::to_value(&patched).map_err(|e| StoreError::Api(e.to_string()))
    }

    async fn delete(&self, r: &ObjectRef) -> Result<(), StoreError> {
        let api = self.api_for(&r.api_version, &r.kind, r.namespace.as_deref()).await?;
        api.delete(&r.name, &DeleteParams::default()).await.map_err(store_err)?;
        Ok(())
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, StoreError> {
        Ok(self.resolve(api_version, kind).await?.1)
    }
}

/// Watch hub that spawns one list+watch task per subscribed kind and routes
/// events into the work queue: workload events wake their own key, anything
/// else wakes every workload.
#[derive(Clone)]
pub struct ClusterWatchHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    client: Client,
    queue: Arc<MemoryQueue>,
    spawned: Mutex<FxHashSet<(String, String)>>,
    reconciler: OnceLock<Arc<Reconciler>>,
    workload_ar: OnceLock<ApiResource>,
}

impl ClusterWatchHub {
    pub fn new(client: Client, queue: Arc<MemoryQueue>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                client,
                queue,
                spawned: Mutex::new(FxHashSet::default()),
                reconciler: OnceLock::new(),
                workload_ar: OnceLock::new(),
            }),
        }
    }

    /// Wire in the reconciler after construction; supply-chain events then
    /// also refresh chain status.
    pub fn set_reconciler(&self, reconciler: Arc<Reconciler>) {
        let _ = self.inner.reconciler.set(reconciler);
    }
}

impl HubInner {
    async fn wake_all_workloads(&self) {
        let ar = match self.workload_ar.get() {
            Some(ar) => ar.clone(),
            None => {
                let gvk = gvk_of(weft_core::API_VERSION, kinds::WORKLOAD);
                match find_api_resource(self.client.clone(), &gvk).await {
                    Ok((ar, _)) => {
                        let _ = self.workload_ar.set(ar.clone());
                        ar
                    }
                    Err(e) => {
                        warn!(error = %e, "workload kind not served, cannot fan out watch event");
                        return;
                    }
                }
            }
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        match api.list(&ListParams::default()).await {
            Ok(listed) => {
                for obj in listed.items {
                    if let Some(name) = obj.metadata.name {
                        let ns = obj.metadata.namespace.unwrap_or_default();
                        self.queue.enqueue(WorkloadKey::new(ns, name));
                    }
                }
            }
            Err(e) => warn!(error = %e, "listing workloads for fan-out failed"),
        }
    }

    async fn route(&self, api_version: &str, kind: &str, obj: &DynamicObject) {
        let name = obj.metadata.name.clone().unwrap_or_default();
        if api_version == weft_core::API_VERSION && kind == kinds::WORKLOAD {
            let ns = obj.metadata.namespace.clone().unwrap_or_default();
            self.queue.enqueue(WorkloadKey::new(ns, name));
            return;
        }
        if api_version == weft_core::API_VERSION && kind == kinds::SUPPLY_CHAIN {
            if let Some(reconciler) = self.reconciler.get() {
                let reconciler = Arc::clone(reconciler);
                let chain = name.clone();
                tokio::spawn(async move {
                    if let Err(e) = reconciler.reconcile_chain(&chain).await {
                        warn!(chain = %chain, error = %e, "supply chain status refresh failed");
                    }
                });
            }
        }
        self.wake_all_workloads().await;
    }
}

#[async_trait::async_trait]
impl WatchHub for ClusterWatchHub {
    async fn subscribe(&self, api_version: &str, kind: &str) -> Result<(), StoreError> {
        {
            let mut spawned = self.inner.spawned.lock().expect("spawned lock");
            if !spawned.insert((api_version.to_string(), kind.to_string())) {
                return Ok(());
            }
        }
        let gvk = gvk_of(api_version, kind);
        let (ar, _) = find_api_resource(self.inner.client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.inner.client.clone(), &ar);
        let hub = Arc::clone(&self.inner);
        let api_version = api_version.to_string();
        let kind = kind.to_string();
        tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default());
            futures::pin_mut!(stream);
            info!(api_version = %api_version, kind = %kind, "watcher started");
            loop {
                match stream.try_next().await {
                    Ok(Some(Event::Applied(obj))) | Ok(Some(Event::Deleted(obj))) => {
                        debug!(kind = %kind, name = ?obj.metadata.name, "watch event");
                        hub.route(&api_version, &kind, &obj).await;
                    }
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(kind = %kind, count = list.len(), "watch restarted");
                        for obj in &list {
                            hub.route(&api_version, &kind, obj).await;
                        }
                    }
                    Ok(None) => {
                        warn!(kind = %kind, "watcher stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "watcher error, stream continues");
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_splits_grouped_and_core_api_versions() {
        let g = gvk_of("weft.dev/v1alpha1", "Workload");
        assert_eq!(g.group, "weft.dev");
        assert_eq!(g.version, "v1alpha1");
        assert_eq!(g.kind, "Workload");

        let core = gvk_of("v1", "ConfigMap");
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");
    }

    #[test]
    fn managed_fields_are_stripped() {
        let mut v = json!({ "metadata": { "name": "x", "managedFields": [ {} ] } });
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
    }
}
