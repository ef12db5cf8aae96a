//! Metrics collector — counters shared by every controller worker.
//!
//! Plain counters are atomics; labelled ones sit behind a mutex keyed by
//! their label values. Recording never blocks on I/O.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use vane_state::AnalysisPhase;

/// Reconcile outcome totals for one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStats {
    pub total: u64,
    pub errors: u64,
    pub duration_seconds_sum: f64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Queue name → reconcile totals.
    pub reconciles: BTreeMap<String, ReconcileStats>,
    /// Mutation name → applied count.
    pub mutations: BTreeMap<String, u64>,
    /// Terminal phase → number of analysis runs that finished in it.
    pub analysis_runs_completed: BTreeMap<String, u64>,
    /// Queue name → keys waiting.
    pub queue_depth: BTreeMap<String, u64>,
    pub cache_relists: u64,
}

#[derive(Default)]
struct Inner {
    reconciles: Mutex<BTreeMap<String, ReconcileStats>>,
    mutations: Mutex<BTreeMap<String, u64>>,
    analysis_runs_completed: Mutex<BTreeMap<String, u64>>,
    queue_depth: Mutex<BTreeMap<String, u64>>,
    cache_relists: AtomicU64,
}

/// Controller-wide metrics. Cheap to clone; clones share counters.
#[derive(Clone, Default)]
pub struct ControllerMetrics {
    inner: Arc<Inner>,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one reconcile pass of a key from `queue`.
    pub fn record_reconcile(&self, queue: &str, elapsed: Duration, ok: bool) {
        let mut reconciles = self.inner.reconciles.lock().expect("metrics lock");
        let stats = reconciles.entry(queue.to_string()).or_default();
        stats.total += 1;
        if !ok {
            stats.errors += 1;
        }
        stats.duration_seconds_sum += elapsed.as_secs_f64();
    }

    pub fn record_mutation(&self, name: &str) {
        let mut mutations = self.inner.mutations.lock().expect("metrics lock");
        *mutations.entry(name.to_string()).or_default() += 1;
    }

    /// Record an analysis run reaching a terminal phase.
    pub fn record_analysis_completed(&self, phase: AnalysisPhase) {
        let mut completed = self.inner.analysis_runs_completed.lock().expect("metrics lock");
        *completed.entry(phase.as_str().to_string()).or_default() += 1;
    }

    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        let mut depths = self.inner.queue_depth.lock().expect("metrics lock");
        depths.insert(queue.to_string(), depth as u64);
    }

    pub fn record_relist(&self) {
        let relists = self.inner.cache_relists.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(relists, "cache relist recorded");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconciles: self.inner.reconciles.lock().expect("metrics lock").clone(),
            mutations: self.inner.mutations.lock().expect("metrics lock").clone(),
            analysis_runs_completed: self
                .inner
                .analysis_runs_completed
                .lock()
                .expect("metrics lock")
                .clone(),
            queue_depth: self.inner.queue_depth.lock().expect("metrics lock").clone(),
            cache_relists: self.inner.cache_relists.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics").finish_non_exhaustive()
    }
}
