//! Wiring: watch router, worker loop, and the in-process watch hub.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use weft_core::{kinds, StoreError, Workload, WorkloadKey};
use weft_stamp::WatchHub;
use weft_store::{MemoryStore, ObjectStore, StoreEvent};

use crate::queue::MemoryQueue;
use crate::reconciler::Reconciler;

/// Watch hub backed by the in-memory store's broadcast channel. Subscribing
/// just marks the kind interesting; the router fans matching events out to
/// workload keys.
#[derive(Clone)]
pub struct RouterHub {
    kinds: Arc<Mutex<FxHashSet<(String, String)>>>,
}

impl Default for RouterHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterHub {
    pub fn new() -> Self {
        Self { kinds: Arc::new(Mutex::new(FxHashSet::default())) }
    }

    fn interesting(&self, api_version: &str, kind: &str) -> bool {
        self.kinds
            .lock()
            .expect("router kinds lock")
            .contains(&(api_version.to_string(), kind.to_string()))
    }
}

#[async_trait::async_trait]
impl WatchHub for RouterHub {
    async fn subscribe(&self, api_version: &str, kind: &str) -> Result<(), StoreError> {
        self.kinds
            .lock()
            .expect("router kinds lock")
            .insert((api_version.to_string(), kind.to_string()));
        Ok(())
    }
}

async fn all_workload_keys(store: &dyn ObjectStore) -> Result<Vec<WorkloadKey>, StoreError> {
    let raw = store.list(weft_core::API_VERSION, kinds::WORKLOAD).await?;
    Ok(raw
        .iter()
        .filter_map(|obj| Workload::from_object(obj).ok())
        .map(|w| w.key())
        .collect())
}

fn is_weft_definition(ev: &StoreEvent) -> bool {
    ev.api_version == weft_core::API_VERSION
        && matches!(
            ev.kind.as_str(),
            kinds::SUPPLY_CHAIN
                | kinds::SOURCE_TEMPLATE
                | kinds::IMAGE_TEMPLATE
                | kinds::CONFIG_TEMPLATE
                | kinds::GENERIC_TEMPLATE
        )
}

/// Route store events to the work queue: a workload event wakes its own key;
/// a definition or watched stamped-object event wakes every workload. Supply
/// chain events additionally refresh the chain's own status.
pub fn spawn_router(
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    hub: RouterHub,
    reconciler: Arc<Reconciler>,
) -> JoinHandle<()> {
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        loop {
            let ev = match rx.recv().await {
                Ok(ev) => ev,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "router lagged behind store events, waking all workloads");
                    if let Ok(keys) = all_workload_keys(store.as_ref()).await {
                        for key in keys {
                            queue.enqueue(key);
                        }
                    }
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if ev.api_version == weft_core::API_VERSION && ev.kind == kinds::WORKLOAD {
                let key = WorkloadKey::new(ev.namespace.clone().unwrap_or_default(), ev.name.clone());
                debug!(key = %key, "router: workload event");
                queue.enqueue(key);
                continue;
            }

            if ev.api_version == weft_core::API_VERSION && ev.kind == kinds::SUPPLY_CHAIN {
                let reconciler = Arc::clone(&reconciler);
                let name = ev.name.clone();
                tokio::spawn(async move {
                    if let Err(e) = reconciler.reconcile_chain(&name).await {
                        warn!(chain = %name, error = %e, "supply chain status refresh failed");
                    }
                });
            }

            if is_weft_definition(&ev) || hub.interesting(&ev.api_version, &ev.kind) {
                debug!(kind = %ev.kind, name = %ev.name, "router: definition or stamped-object event, waking workloads");
                match all_workload_keys(store.as_ref()).await {
                    Ok(keys) => {
                        for key in keys {
                            queue.enqueue(key);
                        }
                    }
                    Err(e) => warn!(error = %e, "router: listing workloads failed"),
                }
            }
        }
    })
}

pub async fn run_worker(reconciler: Arc<Reconciler>, queue: Arc<MemoryQueue>) {
    loop {
        let key = queue.next().await;
        let outcome = reconciler.reconcile(&key).await;
        if let Some(delay) = outcome.requeue_after {
            Arc::clone(&queue).enqueue_after(key.clone(), delay);
        }
        // Releases the key; events that landed mid-cycle redeliver it.
        queue.done(&key);
    }
}

pub fn spawn_workers(
    count: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<MemoryQueue>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|_| {
            let reconciler = Arc::clone(&reconciler);
            let queue = Arc::clone(&queue);
            tokio::spawn(run_worker(reconciler, queue))
        })
        .collect()
}
