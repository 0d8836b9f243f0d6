//! Work queue with per-key dedup, in-flight tracking, and delayed requeue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use weft_core::WorkloadKey;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<WorkloadKey>,
    // Every key the queue has accepted and not yet finished with: waiting in
    // `ready`, or in flight with a re-enqueue pending.
    members: FxHashSet<WorkloadKey>,
    processing: FxHashSet<WorkloadKey>,
}

/// FIFO queue of workload keys. At most one delivery per key is outstanding
/// at a time: a key already waiting is never enqueued a second time, and a
/// key handed to a worker is held back until that worker calls [`done`].
/// Events landing mid-cycle are remembered and redelivered at `done`, so two
/// workers never reconcile the same key concurrently.
///
/// [`done`]: MemoryQueue::done
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self { state: Mutex::new(QueueState::default()), notify: Notify::new() }
    }

    /// Returns true when the key was not already tracked. A key currently in
    /// flight is marked for redelivery instead of being queued immediately.
    pub fn enqueue(&self, key: WorkloadKey) -> bool {
        {
            let mut state = self.state.lock().expect("queue lock");
            if !state.members.insert(key.clone()) {
                return false;
            }
            if state.processing.contains(&key) {
                // Redelivered when the in-flight cycle calls done().
                return true;
            }
            state.ready.push_back(key);
        }
        self.notify.notify_one();
        true
    }

    /// Schedule the key after `delay`. Deduplication happens when the timer
    /// fires, so an earlier immediate enqueue wins.
    pub fn enqueue_after(self: Arc<Self>, key: WorkloadKey, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.enqueue(key);
        });
    }

    /// Deliver the next key and mark it in flight. The caller must pair this
    /// with [`done`](MemoryQueue::done) once the cycle finishes.
    pub async fn next(&self) -> WorkloadKey {
        loop {
            {
                let mut state = self.state.lock().expect("queue lock");
                if let Some(key) = state.ready.pop_front() {
                    state.members.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Release a key delivered by [`next`](MemoryQueue::next). If an event
    /// arrived while the cycle ran, the key goes straight back on the queue.
    pub fn done(&self, key: &WorkloadKey) {
        let redeliver = {
            let mut state = self.state.lock().expect("queue lock");
            state.processing.remove(key);
            if state.members.contains(key) {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if redeliver {
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock").ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
