//! Per-workload exponential backoff with jitter.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use rustc_hash::FxHashMap;
use weft_core::WorkloadKey;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), max: Duration::from_secs(64) }
    }
}

/// Tracks consecutive blocking failures per workload. The delay for failure
/// `n` is `base * 2^(n-1)` capped at `max`, plus up to 25% jitter so a herd
/// of failing workloads does not requeue in lockstep.
pub struct BackoffScheduler {
    cfg: BackoffConfig,
    counters: Mutex<FxHashMap<WorkloadKey, u32>>,
}

impl BackoffScheduler {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, counters: Mutex::new(FxHashMap::default()) }
    }

    pub fn record_failure(&self, key: &WorkloadKey) -> Duration {
        let n = {
            let mut counters = self.counters.lock().expect("backoff lock");
            let n = counters.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let exp = (n - 1).min(16);
        let secs = self.cfg.base.as_secs_f64() * f64::from(1u32 << exp);
        let capped = secs.min(self.cfg.max.as_secs_f64());
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
        Duration::from_secs_f64(capped * jitter)
    }

    /// A clean or benignly-incomplete cycle resets the counter.
    pub fn record_stable(&self, key: &WorkloadKey) {
        self.counters.lock().expect("backoff lock").remove(key);
    }

    pub fn failures(&self, key: &WorkloadKey) -> u32 {
        self.counters.lock().expect("backoff lock").get(key).copied().unwrap_or(0)
    }
}
