//! Controller — feeds the cache, routes changes to work queues and runs the
//! worker pool.
//!
//! ```text
//! StateStore ──watch──▶ feed loop ──▶ ObjectCache
//!                           │
//!                           ├──▶ rollouts queue ──▶ workers ──▶ RolloutReconciler
//!                           ├──▶ analysis queue ──▶ workers ──▶ AnalysisRunReconciler
//!                           └──▶ replica set queue ─▶ worker ─▶ ReadinessSimulator
//! ```
//!
//! Each queue hands a key to one worker at a time, so passes for the same
//! object never overlap. Children wake their owning rollout; services and
//! templates wake every rollout in their namespace.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use vane_analysis::{AnalysisEngine, ProviderRegistry};
use vane_core::{Clock, VaneConfig};
use vane_metrics::ControllerMetrics;
use vane_state::{
    AnalysisRun, EventType, Kind, Object, ReplicaSet, Rollout, StateResult, StateStore,
    WatchEvent, object_key,
};
use vane_traffic::RouterRegistry;

use crate::analysis::AnalysisRunReconciler;
use crate::cache::ObjectCache;
use crate::error::{ReconcileError, ReconcileResult};
use crate::executor::MutationExecutor;
use crate::queue::WorkQueue;
use crate::readiness::ReadinessSimulator;
use crate::rollout::RolloutReconciler;

pub const ROLLOUT_QUEUE: &str = "rollouts";
pub const ANALYSIS_QUEUE: &str = "analysisruns";
pub const REPLICA_SET_QUEUE: &str = "replicasets";

/// Runtime settings, resolved from `[controller]` and `[backoff]`.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub workers: usize,
    pub resync_interval: Duration,
    pub measurement_timeout: Duration,
    pub router_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub simulate_readiness: bool,
}

impl ControllerOptions {
    pub fn from_config(config: &VaneConfig) -> anyhow::Result<Self> {
        let (backoff_base, backoff_max) = config.backoff()?;
        Ok(Self {
            workers: config.controller.workers,
            resync_interval: config.resync_interval()?,
            measurement_timeout: config.measurement_timeout()?,
            router_timeout: config.router_timeout()?,
            backoff_base,
            backoff_max,
            simulate_readiness: config.controller.simulate_readiness,
        })
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(300),
            measurement_timeout: Duration::from_secs(30),
            router_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            simulate_readiness: false,
        }
    }
}

struct Queues {
    rollouts: Arc<WorkQueue>,
    analysis: Arc<WorkQueue>,
    replica_sets: Arc<WorkQueue>,
}

impl Queues {
    fn all(&self) -> [&Arc<WorkQueue>; 3] {
        [&self.rollouts, &self.analysis, &self.replica_sets]
    }
}

#[derive(Clone)]
pub struct Controller {
    store: StateStore,
    cache: ObjectCache,
    queues: Arc<Queues>,
    rollouts: Arc<RolloutReconciler>,
    analysis: Arc<AnalysisRunReconciler>,
    readiness: Option<Arc<ReadinessSimulator>>,
    metrics: ControllerMetrics,
    options: ControllerOptions,
}

impl Controller {
    pub fn new(
        store: StateStore,
        providers: ProviderRegistry,
        routers: RouterRegistry,
        clock: Arc<dyn Clock>,
        metrics: ControllerMetrics,
        options: ControllerOptions,
    ) -> Self {
        let cache = ObjectCache::new();
        let queue = |name| Arc::new(WorkQueue::new(name, options.backoff_base, options.backoff_max));
        let queues = Arc::new(Queues {
            rollouts: queue(ROLLOUT_QUEUE),
            analysis: queue(ANALYSIS_QUEUE),
            replica_sets: queue(REPLICA_SET_QUEUE),
        });

        let executor = MutationExecutor::new(
            store.clone(),
            routers,
            options.router_timeout,
            metrics.clone(),
        );
        let rollouts = Arc::new(RolloutReconciler::new(
            store.clone(),
            cache.clone(),
            executor,
            clock.clone(),
        ));
        let analysis = Arc::new(AnalysisRunReconciler::new(
            store.clone(),
            cache.clone(),
            AnalysisEngine::new(providers, options.measurement_timeout),
            clock,
            metrics.clone(),
        ));
        let readiness = options
            .simulate_readiness
            .then(|| Arc::new(ReadinessSimulator::new(store.clone(), cache.clone())));

        Self {
            store,
            cache,
            queues,
            rollouts,
            analysis,
            readiness,
            metrics,
            options,
        }
    }

    /// Read handle on the controller's cache.
    pub fn cache(&self) -> ObjectCache {
        self.cache.clone()
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Queue a rollout for an immediate pass.
    pub fn enqueue_rollout(&self, key: &str) {
        self.queues.rollouts.add(key);
    }

    /// Start the feed loop and the workers. The cache is filled before this
    /// returns; everything stops once `shutdown` flips to true.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        // Subscribe first so nothing committed during the relist is missed.
        let events = self.store.subscribe();
        self.resync()?;

        let mut handles = Vec::new();
        let feed = self.clone();
        handles.push(tokio::spawn(async move {
            feed.run_feed(events, shutdown).await;
        }));

        let workers = self.options.workers.max(1);
        for _ in 0..workers {
            let reconciler = self.rollouts.clone();
            handles.push(tokio::spawn(run_worker(
                self.queues.rollouts.clone(),
                self.metrics.clone(),
                move |key| {
                    let reconciler = reconciler.clone();
                    async move { reconciler.reconcile(&key).await }
                },
            )));

            let reconciler = self.analysis.clone();
            handles.push(tokio::spawn(run_worker(
                self.queues.analysis.clone(),
                self.metrics.clone(),
                move |key| {
                    let reconciler = reconciler.clone();
                    async move { reconciler.reconcile(&key).await }
                },
            )));
        }
        if let Some(readiness) = &self.readiness {
            let simulator = readiness.clone();
            handles.push(tokio::spawn(run_worker(
                self.queues.replica_sets.clone(),
                self.metrics.clone(),
                move |key| {
                    let simulator = simulator.clone();
                    async move { simulator.reconcile(&key).await }
                },
            )));
        }

        info!(
            workers,
            simulate_readiness = self.readiness.is_some(),
            resync_interval = ?self.options.resync_interval,
            "controller started"
        );
        Ok(handles)
    }

    /// Relist every kind into the cache and queue everything for a pass.
    pub fn resync(&self) -> StateResult<()> {
        for kind in Kind::ALL {
            let objects = self.store.list_objects(kind)?;
            self.cache.replace(kind, objects);
        }
        self.metrics.record_relist();

        let rollouts = self.cache.list::<Rollout>();
        for rollout in &rollouts {
            self.queues.rollouts.add(&rollout.metadata.key());
        }
        for run in self.cache.list::<AnalysisRun>() {
            if !run.status.phase.is_terminal() {
                self.queues.analysis.add(&run.metadata.key());
            }
        }
        if self.readiness.is_some() {
            for rs in self.cache.list::<ReplicaSet>() {
                self.queues.replica_sets.add(&rs.metadata.key());
            }
        }
        debug!(rollouts = rollouts.len(), "resync queued");
        Ok(())
    }

    async fn run_feed(
        &self,
        mut events: broadcast::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut resync = tokio::time::interval(self.options.resync_interval);
        // The first tick fires immediately; `spawn` has just relisted.
        resync.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        self.cache.apply(&event);
                        self.dispatch(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "watch feed lagged, relisting");
                        self.resync_or_log();
                    }
                    Err(RecvError::Closed) => {
                        warn!("watch feed closed");
                        break;
                    }
                },
                _ = resync.tick() => {
                    debug!("periodic resync");
                    self.resync_or_log();
                }
                _ = shutdown.changed() => {
                    debug!("feed loop shutting down");
                    break;
                }
            }
            for queue in self.queues.all() {
                self.metrics.set_queue_depth(queue.name(), queue.len());
            }
        }

        for queue in self.queues.all() {
            queue.shutdown();
        }
        info!("controller stopped");
    }

    fn resync_or_log(&self) {
        if let Err(e) = self.resync() {
            error!(error = %e, "resync failed");
        }
    }

    /// Route a change to the queues that care about it.
    fn dispatch(&self, event: &WatchEvent) {
        let meta = event.object.meta();
        match &event.object {
            Object::Rollout(_) => self.queues.rollouts.add(&meta.key()),
            Object::ReplicaSet(_) | Object::AnalysisRun(_) | Object::Experiment(_) => {
                if let Some(owner) = &meta.owner
                    && owner.kind == Kind::Rollout.as_str()
                {
                    self.queues
                        .rollouts
                        .add(&object_key(&meta.namespace, &owner.name));
                }
                match &event.object {
                    Object::AnalysisRun(run)
                        if event.event_type != EventType::Deleted
                            && !run.status.phase.is_terminal() =>
                    {
                        self.queues.analysis.add(&meta.key());
                    }
                    Object::ReplicaSet(_)
                        if self.readiness.is_some() && event.event_type != EventType::Deleted =>
                    {
                        self.queues.replica_sets.add(&meta.key());
                    }
                    _ => {}
                }
            }
            Object::Service(_) | Object::AnalysisTemplate(_) => {
                for rollout in self.cache.list_in_namespace::<Rollout>(&meta.namespace) {
                    self.queues.rollouts.add(&rollout.metadata.key());
                }
            }
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("cache", &self.cache)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Take keys off `queue` until it shuts down. Successful passes reset the
/// key's backoff and honour the requested requeue; transient failures are
/// retried with backoff; permanent ones wait for the next change.
///
/// Each pass runs in its own task, so a panic fails that attempt only: the
/// key is released and retried with backoff and the worker keeps going.
async fn run_worker<F, Fut>(queue: Arc<WorkQueue>, metrics: ControllerMetrics, reconcile: F)
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = ReconcileResult<Option<Duration>>> + Send + 'static,
{
    while let Some(key) = queue.get().await {
        let started = Instant::now();
        let result = match tokio::spawn(reconcile(key.clone())).await {
            Ok(result) => result,
            Err(e) => Err(ReconcileError::Panicked(panic_message(e))),
        };
        metrics.record_reconcile(queue.name(), started.elapsed(), result.is_ok());

        match result {
            Ok(requeue) => {
                queue.forget(&key);
                if let Some(after) = requeue {
                    queue.add_after(&key, after);
                }
            }
            Err(e) if e.is_transient() => {
                let delay = queue.add_rate_limited(&key);
                warn!(queue = queue.name(), %key, error = %e, ?delay, "reconcile failed, retrying");
            }
            Err(e) => {
                queue.forget(&key);
                error!(queue = queue.name(), %key, error = %e, "reconcile failed");
            }
        }
        queue.done(&key);
    }
    debug!(queue = queue.name(), "worker stopped");
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn panicking_pass_is_retried_and_the_worker_survives() {
        let queue = Arc::new(WorkQueue::new(
            "test",
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        let metrics = ControllerMetrics::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let done = Arc::new(tokio::sync::Notify::new());

        let worker = tokio::spawn(run_worker(queue.clone(), metrics.clone(), {
            let attempts = attempts.clone();
            let done = done.clone();
            move |key| {
                let attempts = attempts.clone();
                let done = done.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first pass for {key} blew up");
                    }
                    done.notify_one();
                    Ok(None)
                }
            }
        }));

        queue.add("default/web");
        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        // The key was released: a later change is handed out again.
        queue.add("default/web");
        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        queue.shutdown();
        worker.await.unwrap();
    }
}
