//! AnalysisRun reconciler — hands runs to the analysis engine and persists
//! the result.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use vane_analysis::AnalysisEngine;
use vane_core::Clock;
use vane_metrics::ControllerMetrics;
use vane_state::{AnalysisRun, StateStore};

use crate::cache::ObjectCache;
use crate::error::ReconcileResult;
use crate::rollout::STALE_CACHE_RETRY;

pub struct AnalysisRunReconciler {
    store: StateStore,
    cache: ObjectCache,
    engine: AnalysisEngine,
    clock: Arc<dyn Clock>,
    metrics: ControllerMetrics,
}

impl AnalysisRunReconciler {
    pub fn new(
        store: StateStore,
        cache: ObjectCache,
        engine: AnalysisEngine,
        clock: Arc<dyn Clock>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            store,
            cache,
            engine,
            clock,
            metrics,
        }
    }

    #[instrument(skip(self), fields(run = %key))]
    pub async fn reconcile(&self, key: &str) -> ReconcileResult<Option<Duration>> {
        let Some(run) = self.cache.get::<AnalysisRun>(key) else {
            return Ok(None);
        };
        if run.status.phase.is_terminal() {
            return Ok(None);
        }
        match self.store.get::<AnalysisRun>(key)? {
            Some(stored) if stored.metadata.resource_version == run.metadata.resource_version => {}
            _ => return Ok(Some(STALE_CACHE_RETRY)),
        }

        let update = self.engine.reconcile(&run, self.clock.now()).await;
        if update.status != run.status {
            let phase = update.status.phase;
            if phase != run.status.phase {
                if phase.is_terminal() {
                    info!(%phase, message = %update.status.message, "analysis run finished");
                    self.metrics.record_analysis_completed(phase);
                } else {
                    debug!(from = %run.status.phase, to = %phase, "analysis run phase changed");
                }
            }
            let mut updated = run;
            updated.status = update.status;
            self.store.update_status(&updated)?;
        }
        Ok(update.requeue_after)
    }
}
