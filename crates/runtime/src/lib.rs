//! Weft reconciliation runtime.
//!
//! Ties the pieces together: a work queue keyed by workload, a reconciler
//! that runs full cycles, per-key exponential backoff for blocking errors,
//! and a router that turns store change events into queue wake-ups.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod controller;
pub mod queue;
pub mod reconciler;

pub use backoff::{BackoffConfig, BackoffScheduler};
pub use controller::{run_worker, spawn_router, spawn_workers, RouterHub};
pub use queue::MemoryQueue;
pub use reconciler::{Outcome, Reconciler, ReconcilerConfig};
