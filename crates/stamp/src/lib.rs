//! Stamping: materialize a rendered template as a live owned object.
//!
//! A stamp is idempotent: the derived object's identity is a pure function of
//! (workload, resource name), and a write only happens when a templated field
//! differs from the live object. Fields the reconciler does not own are left
//! untouched.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;
use serde_json::{json, Value as Json};
use tracing::debug;
use weft_core::{stamped_name, CycleError, StampedRef, StoreError, Workload};
use weft_store::{ObjectRef, ObjectStore};

pub mod health;

pub use health::{extract, Extraction, Health};

/// External watch/informer seam: subscribe to change events by kind.
#[async_trait::async_trait]
pub trait WatchHub: Send + Sync {
    async fn subscribe(&self, api_version: &str, kind: &str) -> Result<(), StoreError>;
}

/// Process-wide registry of watched kinds. Registering an already-watched
/// kind is a no-op; kinds are never unregistered during process lifetime.
pub struct WatchRegistrar {
    hub: Arc<dyn WatchHub>,
    watched: Mutex<FxHashSet<(String, String)>>,
}

impl WatchRegistrar {
    pub fn new(hub: Arc<dyn WatchHub>) -> Self {
        Self { hub, watched: Mutex::new(FxHashSet::default()) }
    }

    /// Returns true when this call actually registered a new subscription.
    pub async fn ensure_watch(&self, api_version: &str, kind: &str) -> Result<bool, StoreError> {
        let key = (api_version.to_string(), kind.to_string());
        {
            let mut watched = self.watched.lock().expect("watched lock");
            if !watched.insert(key.clone()) {
                return Ok(false);
            }
        }
        if let Err(e) = self.hub.subscribe(api_version, kind).await {
            self.watched.lock().expect("watched lock").remove(&key);
            return Err(e);
        }
        debug!(api_version, kind, "watch registered");
        Ok(true)
    }

    pub fn is_watched(&self, api_version: &str, kind: &str) -> bool {
        self.watched
            .lock()
            .expect("watched lock")
            .contains(&(api_version.to_string(), kind.to_string()))
    }
}

/// Result of one stamp: the live object after the call and whether the store
/// was written.
#[derive(Debug, Clone)]
pub struct StampOutcome {
    pub object: Json,
    pub reference: StampedRef,
    pub wrote: bool,
}

pub struct Stamper<'a> {
    store: &'a dyn ObjectStore,
    registrar: &'a WatchRegistrar,
}

impl<'a> Stamper<'a> {
    pub fn new(store: &'a dyn ObjectStore, registrar: &'a WatchRegistrar) -> Self {
        Self { store, registrar }
    }

    pub async fn stamp(
        &self,
        workload: &Workload,
        resource_name: &str,
        mut rendered: Json,
    ) -> Result<StampOutcome, CycleError> {
        let api_version = rendered
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CycleError::Internal("rendered template missing apiVersion".into()))?
            .to_string();
        let kind = rendered
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CycleError::Internal("rendered template missing kind".into()))?
            .to_string();

        let name = stamped_name(&workload.metadata.name, resource_name);
        let namespaced = self.store.is_namespaced(&api_version, &kind).await?;
        let namespace = if namespaced { workload.metadata.namespace.clone() } else { None };

        let meta = rendered
            .as_object_mut()
            .ok_or_else(|| CycleError::Internal("rendered template is not an object".into()))?
            .entry("metadata")
            .or_insert_with(|| json!({}));
        let meta = meta
            .as_object_mut()
            .ok_or_else(|| CycleError::Internal("rendered metadata is not an object".into()))?;
        meta.insert("name".into(), Json::String(name.clone()));
        if let Some(ns) = &namespace {
            meta.insert("namespace".into(), Json::String(ns.clone()));
        } else {
            meta.remove("namespace");
        }
        if let Some(uid) = &workload.metadata.uid {
            meta.insert(
                "ownerReferences".into(),
                json!([{
                    "apiVersion": weft_core::API_VERSION,
                    "kind": weft_core::kinds::WORKLOAD,
                    "name": workload.metadata.name,
                    "uid": uid,
                    "controller": true,
                    "blockOwnerDeletion": true,
                }]),
            );
        }

        let reference = StampedRef {
            api_version: api_version.clone(),
            kind: kind.clone(),
            namespace: namespace.clone(),
            name: name.clone(),
        };
        let obj_ref = ObjectRef::new(&api_version, &kind, namespace.as_deref(), &name);

        let outcome = match self.store.get(&obj_ref).await? {
            None => {
                let created = self.store.create(rendered).await?;
                debug!(kind = %kind, name = %name, "stamped: created");
                StampOutcome { object: created, reference, wrote: true }
            }
            Some(live) => {
                if fields_subset(&rendered, &live) {
                    StampOutcome { object: live, reference, wrote: false }
                } else {
                    let merged = merge_desired(live, &rendered);
                    let updated = self.store.update(merged).await?;
                    debug!(kind = %kind, name = %name, "stamped: updated");
                    StampOutcome { object: updated, reference, wrote: true }
                }
            }
        };

        self.registrar.ensure_watch(&api_version, &kind).await?;
        Ok(outcome)
    }
}

/// True when every field `desired` declares is already equal in `live`.
/// Extra live fields (status, server-assigned metadata, foreign writers) are
/// ignored; arrays compare wholesale.
fn fields_subset(desired: &Json, live: &Json) -> bool {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => d
            .iter()
            .all(|(k, dv)| l.get(k).map(|lv| fields_subset(dv, lv)).unwrap_or(false)),
        (a, b) => a == b,
    }
}

/// Overlay `desired` onto `live`: objects merge key-by-key, everything else
/// is replaced by the desired value.
fn merge_desired(mut live: Json, desired: &Json) -> Json {
    match (&mut live, desired) {
        (Json::Object(l), Json::Object(d)) => {
            for (k, dv) in d {
                match l.get_mut(k) {
                    Some(lv) if lv.is_object() && dv.is_object() => {
                        let merged = merge_desired(lv.take(), dv);
                        l.insert(k.clone(), merged);
                    }
                    _ => {
                        l.insert(k.clone(), dv.clone());
                    }
                }
            }
        }
        (slot, dv) => *slot = dv.clone(),
    }
    live
}
