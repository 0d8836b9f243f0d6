//! End-to-end: router, workers, and an out-of-band controller driving a
//! stamped object from pending to ready.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use weft_core::condition_types::{READY, RESOURCES_SUBMITTED};
use weft_core::{kinds, reasons, CondStatus};
use weft_runtime::{spawn_router, spawn_workers, MemoryQueue};
use weft_store::{MemoryStore, ObjectRef, ObjectStore};

#[tokio::test]
async fn workload_follows_its_stamped_object_to_ready() {
    let store = Arc::new(MemoryStore::new());
    let (reconciler, hub) = reconciler(&store, Duration::from_secs(10));
    let queue = Arc::new(MemoryQueue::new());
    let _router = spawn_router(store.clone(), queue.clone(), hub, reconciler.clone());
    let _workers = spawn_workers(2, reconciler.clone(), queue.clone());

    create_test_config_template(&store, "my-config-template").await;
    create_chain(
        &store,
        "my-chain",
        &[("name", "webapp")],
        json!([{
            "name": "my-first-resource",
            "templateRef": { "kind": "ConfigTemplate", "name": "my-config-template" }
        }]),
    )
    .await;
    create_workload(&store, "workload-joe", &[("name", "webapp")]).await;

    // The workload settles in a pending state: stamped, waiting for status.
    wait_for_conditions(&store, "workload-joe", Duration::from_secs(2), |conds| {
        conds.iter().any(|c| {
            c.type_ == RESOURCES_SUBMITTED
                && c.status == CondStatus::Unknown
                && c.reason == reasons::MISSING_VALUE_AT_PATH
        })
    })
    .await;

    // An out-of-band controller marks the Test object ready. The Test kind
    // was registered for watching during stamping, so recovery rides the
    // change event.
    set_test_ready(&store, "workload-joe", "my-first-resource", "True", "LifeIsGood").await;
    let flipped_at = tokio::time::Instant::now();
    let conditions = wait_for_conditions(&store, "workload-joe", Duration::from_secs(2), |conds| {
        conds.iter().any(|c| c.type_ == READY && c.status == CondStatus::True)
    })
    .await;
    assert!(flipped_at.elapsed() < Duration::from_millis(500));
    assert_eq!(condition(&conditions, READY).reason, reasons::READY);

    let status = workload_status(&store, "workload-joe").await;
    assert_eq!(status["resources"][0]["output"]["reason"], "LifeIsGood");
    assert_eq!(status["observedGeneration"], 1);

    // The supply chain's own status was refreshed along the way.
    let chain = store.get(&ObjectRef::weft(kinds::SUPPLY_CHAIN, None, "my-chain")).await.unwrap().unwrap();
    assert_eq!(chain["status"]["conditions"][0]["type"], "Ready");
    assert_eq!(chain["status"]["conditions"][0]["status"], "True");
}

#[tokio::test]
async fn deleting_the_workload_cascades_to_stamped_objects() {
    let store = Arc::new(MemoryStore::new());
    let (reconciler, hub) = reconciler(&store, Duration::from_secs(10));
    let queue = Arc::new(MemoryQueue::new());
    let _router = spawn_router(store.clone(), queue.clone(), hub, reconciler.clone());
    let _workers = spawn_workers(2, reconciler.clone(), queue.clone());

    create_test_config_template(&store, "my-config-template").await;
    create_chain(
        &store,
        "my-chain",
        &[("name", "webapp")],
        json!([{
            "name": "my-first-resource",
            "templateRef": { "kind": "ConfigTemplate", "name": "my-config-template" }
        }]),
    )
    .await;
    create_workload(&store, "workload-joe", &[("name", "webapp")]).await;

    let stamped = test_object_ref("workload-joe", "my-first-resource");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while store.get(&stamped).await.unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline, "stamped object never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    store.delete(&ObjectRef::weft(kinds::WORKLOAD, Some("default"), "workload-joe")).await.unwrap();
    assert!(store.get(&stamped).await.unwrap().is_none(), "owner deletion cascades");
}

#[tokio::test]
async fn two_resource_chain_threads_outputs_downstream() {
    let store = Arc::new(MemoryStore::new());
    let (reconciler, hub) = reconciler(&store, Duration::from_secs(10));
    let queue = Arc::new(MemoryQueue::new());
    let _router = spawn_router(store.clone(), queue.clone(), hub, reconciler.clone());
    let _workers = spawn_workers(2, reconciler.clone(), queue.clone());

    create_test_config_template(&store, "my-config-template").await;
    // Second step consumes the first step's extracted output.
    let consumer_spec = json!({
        "template": {
            "apiVersion": TEST_API,
            "kind": "Test",
            "metadata": { "name": "placeholder" },
            "spec": { "upstreamReason": "$(outputs.my-first-resource.reason)" }
        }
    });
    store
        .create(weft_store::make_object(
            weft_core::API_VERSION,
            kinds::GENERIC_TEMPLATE,
            None,
            "my-consumer-template",
            consumer_spec,
        ))
        .await
        .unwrap();
    create_chain(
        &store,
        "my-chain",
        &[("name", "webapp")],
        json!([
            {
                "name": "my-first-resource",
                "templateRef": { "kind": "ConfigTemplate", "name": "my-config-template" }
            },
            {
                "name": "my-second-resource",
                "templateRef": { "kind": "GenericTemplate", "name": "my-consumer-template" },
                "inputs": ["my-first-resource"]
            }
        ]),
    )
    .await;
    create_workload(&store, "workload-joe", &[("name", "webapp")]).await;

    // Pending until the first stamped object reports.
    wait_for_conditions(&store, "workload-joe", Duration::from_secs(2), |conds| {
        conds
            .iter()
            .any(|c| c.type_ == RESOURCES_SUBMITTED && c.reason == reasons::MISSING_VALUE_AT_PATH)
    })
    .await;
    set_test_ready(&store, "workload-joe", "my-first-resource", "True", "LifeIsGood").await;

    wait_for_conditions(&store, "workload-joe", Duration::from_secs(2), |conds| {
        conds.iter().any(|c| c.type_ == READY && c.status == CondStatus::True)
    })
    .await;

    let downstream = store
        .get(&test_object_ref("workload-joe", "my-second-resource"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(downstream["spec"]["upstreamReason"], "LifeIsGood");
}
