//! Rollout reconciler — one pass per dequeued rollout key.
//!
//! Reads the rollout and everything it owns from the cache, asks the
//! traffic router what it has in effect, plans, applies the mutations and
//! writes the new status last. The status write carries the resource
//! version the pass read, so a concurrent user action makes it fail with a
//! conflict and the pass is retried on fresh data.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use vane_core::Clock;
use vane_rollout::conditions::{REASON_INVALID_SPEC, set_condition};
use vane_rollout::{RolloutContext, plan};
use vane_state::{
    AnalysisRun, AnalysisTemplate, ConditionType, Experiment, Kind, ReplicaSet, Resource, Rollout,
    OwnerRef, RolloutPhase, Service, StateStore, object_key, split_key,
};
use vane_traffic::RouterError;

use crate::cache::ObjectCache;
use crate::error::{ReconcileError, ReconcileResult};
use crate::executor::{MutationExecutor, router_for, with_timeout};

/// Retry delay while the cache has not caught up with the store.
pub const STALE_CACHE_RETRY: Duration = Duration::from_millis(50);

pub struct RolloutReconciler {
    store: StateStore,
    cache: ObjectCache,
    executor: MutationExecutor,
    clock: Arc<dyn Clock>,
}

impl RolloutReconciler {
    pub fn new(
        store: StateStore,
        cache: ObjectCache,
        executor: MutationExecutor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            executor,
            clock,
        }
    }

    /// Reconcile one rollout. Returns when the key should next be looked
    /// at, if no object change is expected to trigger it.
    #[instrument(skip(self), fields(rollout = %key))]
    pub async fn reconcile(&self, key: &str) -> ReconcileResult<Option<Duration>> {
        let Some(rollout) = self.cache.get::<Rollout>(key) else {
            self.collect_orphans(key)?;
            return Ok(None);
        };

        // The feed applies events in commit order, so once the cached
        // rollout matches the store every child written before it is
        // cached too.
        match self.store.get::<Rollout>(key)? {
            None => return Ok(Some(STALE_CACHE_RETRY)),
            Some(stored) if stored.metadata.resource_version != rollout.metadata.resource_version => {
                debug!(
                    cached = rollout.metadata.resource_version,
                    stored = stored.metadata.resource_version,
                    "cache behind store"
                );
                return Ok(Some(STALE_CACHE_RETRY));
            }
            Some(_) => {}
        }

        let now = self.clock.now();
        let applied = match router_for(self.executor.routers(), &rollout) {
            Ok(Some((name, router, target))) => Some(
                with_timeout(&name, self.executor.router_timeout(), router.applied(&target))
                    .await?,
            ),
            Ok(None) => None,
            Err(ReconcileError::Router(RouterError::UnknownRouter(name))) => {
                self.reject(rollout, &format!("unknown traffic router {name:?}"), now)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let uid = rollout.metadata.uid.clone();
        let namespace = rollout.metadata.namespace.clone();
        let ctx = RolloutContext {
            replica_sets: self.cache.owned_by::<ReplicaSet>(&uid),
            analysis_runs: self.cache.owned_by::<AnalysisRun>(&uid),
            experiments: self.cache.owned_by::<Experiment>(&uid),
            templates: self.cache.list_in_namespace::<AnalysisTemplate>(&namespace),
            services: self.cache.list_in_namespace::<Service>(&namespace),
            applied,
            now,
            rollout,
        };
        let result = plan(&ctx);
        debug!(
            mutations = result.mutations.len(),
            requeue_after = ?result.requeue_after,
            "planned"
        );

        self.executor.apply_all(&ctx.rollout, &result.mutations).await?;

        let previous = &ctx.rollout.status;
        if result.status != *previous {
            if result.status.phase != previous.phase {
                info!(
                    from = %previous.phase,
                    to = %result.status.phase,
                    message = %result.status.message,
                    "rollout phase changed"
                );
            }
            let mut updated = ctx.rollout.clone();
            updated.status = result.status;
            self.store.update_status(&updated)?;
        }
        Ok(result.requeue_after)
    }

    /// Record a spec the planner cannot act on.
    fn reject(&self, mut rollout: Rollout, message: &str, now: u64) -> ReconcileResult<()> {
        warn!(error = %message, "invalid rollout spec");
        let status = &mut rollout.status;
        set_condition(status, ConditionType::InvalidSpec, true, REASON_INVALID_SPEC, message, now);
        status.message = message.to_string();
        status.phase = RolloutPhase::Degraded;
        status.observed_generation = rollout.metadata.generation;
        self.store.update_status(&rollout)?;
        Ok(())
    }

    /// Delete children left behind by a deleted rollout.
    fn collect_orphans(&self, key: &str) -> ReconcileResult<()> {
        let Some((namespace, name)) = split_key(key) else {
            return Ok(());
        };
        let orphaned = |owner: Option<&OwnerRef>| {
            owner.is_some_and(|o| o.kind == Kind::Rollout.as_str() && o.name == name)
        };
        let mut deleted = 0;
        for rs in self.cache.list_in_namespace::<ReplicaSet>(namespace) {
            if orphaned(rs.metadata.owner.as_ref()) && self.delete_orphan(&rs)? {
                deleted += 1;
            }
        }
        for run in self.cache.list_in_namespace::<AnalysisRun>(namespace) {
            if orphaned(run.metadata.owner.as_ref()) && self.delete_orphan(&run)? {
                deleted += 1;
            }
        }
        for exp in self.cache.list_in_namespace::<Experiment>(namespace) {
            if orphaned(exp.metadata.owner.as_ref()) && self.delete_orphan(&exp)? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, "removed children of deleted rollout");
        }
        Ok(())
    }

    fn delete_orphan<R: Resource>(&self, child: &R) -> ReconcileResult<bool> {
        let meta = child.meta();
        if let Some(owner) = &meta.owner {
            // The cache can lag the store; keep children of the stored rollout.
            let current = self.store.get::<Rollout>(&object_key(&meta.namespace, &owner.name))?;
            if current.is_some_and(|r| r.metadata.uid == owner.uid) {
                return Ok(false);
            }
        }
        Ok(self.store.delete::<R>(&meta.key())?)
    }
}
