#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};
use weft_core::{kinds, Condition};
use weft_runtime::{BackoffConfig, Reconciler, ReconcilerConfig, RouterHub};
use weft_stamp::WatchRegistrar;
use weft_store::{make_object, MemoryStore, ObjectRef, ObjectStore};

pub const TEST_API: &str = "test.run/v1alpha1";

pub fn reconciler(store: &Arc<MemoryStore>, base: Duration) -> (Arc<Reconciler>, RouterHub) {
    let hub = RouterHub::new();
    let registrar = WatchRegistrar::new(Arc::new(hub.clone()));
    let cfg = ReconcilerConfig {
        backoff: BackoffConfig { base, max: base * 32 },
        ..Default::default()
    };
    (Arc::new(Reconciler::new(store.clone(), registrar, cfg)), hub)
}

pub async fn create_workload(store: &MemoryStore, name: &str, labels: &[(&str, &str)]) -> Json {
    let mut obj =
        make_object(weft_core::API_VERSION, kinds::WORKLOAD, Some("default"), name, json!({
            "params": [ { "name": "foo", "value": "bar" } ]
        }));
    let labels: serde_json::Map<String, Json> =
        labels.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
    obj["metadata"]["labels"] = Json::Object(labels);
    store.create(obj).await.unwrap()
}

pub async fn create_chain(store: &MemoryStore, name: &str, selector: &[(&str, &str)], resources: Json) -> Json {
    let selector: serde_json::Map<String, Json> =
        selector.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
    let spec = json!({ "selector": Json::Object(selector), "resources": resources });
    store
        .create(make_object(weft_core::API_VERSION, kinds::SUPPLY_CHAIN, None, name, spec))
        .await
        .unwrap()
}

/// A config template that stamps a `Test` object and reads the output back
/// out of its Ready condition, mirroring an out-of-band controller filling
/// in status.
pub async fn create_test_config_template(store: &MemoryStore, name: &str) -> Json {
    let spec = json!({
        "template": {
            "apiVersion": TEST_API,
            "kind": "Test",
            "metadata": { "name": "from-template" },
            "spec": { "foo": "$(params.foo)" }
        },
        "configPath": "status.conditions[?(@.type==\"Ready\")]"
    });
    store
        .create(make_object(weft_core::API_VERSION, kinds::CONFIG_TEMPLATE, None, name, spec))
        .await
        .unwrap()
}

pub async fn create_generic_template(store: &MemoryStore, name: &str) -> Json {
    let spec = json!({
        "template": {
            "apiVersion": TEST_API,
            "kind": "Test",
            "metadata": { "name": "from-template" },
            "spec": { "foo": "static" }
        }
    });
    store
        .create(make_object(weft_core::API_VERSION, kinds::GENERIC_TEMPLATE, None, name, spec))
        .await
        .unwrap()
}

pub fn test_object_ref(workload: &str, resource: &str) -> ObjectRef {
    ObjectRef::new(TEST_API, "Test", Some("default"), format!("{workload}-{resource}"))
}

pub async fn set_test_ready(store: &MemoryStore, workload: &str, resource: &str, status: &str, reason: &str) {
    store
        .update_status(
            &test_object_ref(workload, resource),
            json!({ "conditions": [ { "type": "Ready", "status": status, "reason": reason } ] }),
        )
        .await
        .unwrap();
}

pub async fn workload_status(store: &MemoryStore, name: &str) -> Json {
    store
        .get(&ObjectRef::weft(kinds::WORKLOAD, Some("default"), name))
        .await
        .unwrap()
        .unwrap()
        .get("status")
        .cloned()
        .unwrap_or(Json::Null)
}

pub async fn workload_conditions(store: &MemoryStore, name: &str) -> Vec<Condition> {
    let status = workload_status(store, name).await;
    serde_json::from_value(status.get("conditions").cloned().unwrap_or(json!([]))).unwrap_or_default()
}

pub fn condition<'a>(conditions: &'a [Condition], type_: &str) -> &'a Condition {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .unwrap_or_else(|| panic!("no {type_} condition in {conditions:?}"))
}

/// Poll until the workload's conditions satisfy `pred` or the deadline hits.
pub async fn wait_for_conditions<F>(store: &MemoryStore, name: &str, timeout: Duration, pred: F) -> Vec<Condition>
where
    F: Fn(&[Condition]) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let conditions = workload_conditions(store, name).await;
        if pred(&conditions) {
            return conditions;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("conditions never converged within {timeout:?}: {conditions:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
