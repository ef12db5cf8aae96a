//! Applies planned mutations to the object store and the traffic router.
//!
//! Store writes read the current object first and write with its resource
//! version, so a concurrent change surfaces as a conflict and the pass is
//! retried. Creating an object that already exists counts as success,
//! which keeps a replayed plan harmless.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use vane_metrics::ControllerMetrics;
use vane_rollout::Mutation;
use vane_state::{
    AnalysisRun, Experiment, POD_TEMPLATE_HASH_LABEL, ReplicaSet, Resource, Rollout, Service,
    StateStore, object_key,
};
use vane_traffic::{RouterError, RouterRegistry, RoutingTarget, TrafficRouter};

use crate::error::{ReconcileError, ReconcileResult};

/// The rollout's router, if it routes traffic.
pub fn router_for(
    routers: &RouterRegistry,
    rollout: &Rollout,
) -> ReconcileResult<Option<(String, Arc<dyn TrafficRouter>, RoutingTarget)>> {
    let Some(canary) = rollout.spec.canary() else {
        return Ok(None);
    };
    let Some(routing) = &canary.traffic_routing else {
        return Ok(None);
    };
    let router = routers
        .get(&routing.router)
        .ok_or_else(|| RouterError::UnknownRouter(routing.router.clone()))?;
    let target = RoutingTarget {
        rollout: rollout.metadata.key(),
        stable_service: canary.stable_service.clone(),
        canary_service: canary.canary_service.clone(),
        config: routing.config.clone(),
    };
    Ok(Some((routing.router.clone(), router, target)))
}

/// Bound a router call by `timeout`.
pub async fn with_timeout<T>(
    router: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T, RouterError>>,
) -> ReconcileResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ReconcileError::RouterTimeout {
            router: router.to_string(),
            timeout,
        }),
    }
}

pub struct MutationExecutor {
    store: StateStore,
    routers: RouterRegistry,
    router_timeout: Duration,
    metrics: ControllerMetrics,
}

impl MutationExecutor {
    pub fn new(
        store: StateStore,
        routers: RouterRegistry,
        router_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            store,
            routers,
            router_timeout,
            metrics,
        }
    }

    pub fn routers(&self) -> &RouterRegistry {
        &self.routers
    }

    pub fn router_timeout(&self) -> Duration {
        self.router_timeout
    }

    /// Apply `mutations` in order, stopping at the first failure.
    pub async fn apply_all(&self, rollout: &Rollout, mutations: &[Mutation]) -> ReconcileResult<()> {
        for mutation in mutations {
            self.apply(rollout, mutation).await?;
            self.metrics.record_mutation(mutation.name());
        }
        Ok(())
    }

    pub async fn apply(&self, rollout: &Rollout, mutation: &Mutation) -> ReconcileResult<()> {
        let ns = &rollout.metadata.namespace;
        debug!(rollout = %rollout.metadata.key(), mutation = mutation.name(), "applying mutation");
        match mutation {
            Mutation::CreateReplicaSet(rs) => self.create(rs.clone()),
            Mutation::ScaleReplicaSet { name, replicas } => {
                self.modify::<ReplicaSet>(&object_key(ns, name), |rs| rs.spec.replicas = *replicas)
            }
            Mutation::AnnotateReplicaSet { name, key, value } => {
                self.modify::<ReplicaSet>(&object_key(ns, name), |rs| {
                    rs.metadata.annotations.insert(key.clone(), value.clone());
                })
            }
            Mutation::DeleteReplicaSet { name } => {
                self.store.delete::<ReplicaSet>(&object_key(ns, name))?;
                Ok(())
            }
            Mutation::CreateAnalysisRun(run) => self.create(run.clone()),
            Mutation::TerminateAnalysisRun { name } => {
                self.modify::<AnalysisRun>(&object_key(ns, name), |run| run.spec.terminate = true)
            }
            Mutation::CreateExperiment(exp) => self.create(exp.clone()),
            Mutation::TerminateExperiment { name } => {
                self.modify::<Experiment>(&object_key(ns, name), |exp| exp.spec.terminate = true)
            }
            Mutation::SetServiceSelector { service, pod_hash } => {
                self.modify::<Service>(&object_key(ns, service), |svc| {
                    svc.spec
                        .selector
                        .insert(POD_TEMPLATE_HASH_LABEL.to_string(), pod_hash.clone());
                })
            }
            Mutation::SetWeight(_)
            | Mutation::SetHeaderRoute(_)
            | Mutation::SetMirrorRoute(_)
            | Mutation::RemoveManagedRoutes => self.route(rollout, mutation).await,
        }
    }

    fn create<R: Resource>(&self, obj: R) -> ReconcileResult<()> {
        match self.store.create(obj) {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!(error = %e, "object already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write guarded by the read's resource version. A missing
    /// object is left alone: it was deleted and the next pass will notice.
    fn modify<R: Resource>(&self, key: &str, change: impl FnOnce(&mut R)) -> ReconcileResult<()> {
        let Some(mut obj) = self.store.get::<R>(key)? else {
            debug!(kind = %R::KIND, %key, "mutation target is gone");
            return Ok(());
        };
        change(&mut obj);
        self.store.update(obj)?;
        Ok(())
    }

    async fn route(&self, rollout: &Rollout, mutation: &Mutation) -> ReconcileResult<()> {
        let Some((name, router, target)) = router_for(&self.routers, rollout)? else {
            return Err(ReconcileError::Internal(format!(
                "{} planned for rollout {} without traffic routing",
                mutation.name(),
                rollout.metadata.key()
            )));
        };
        let timeout = self.router_timeout;
        match mutation {
            Mutation::SetWeight(weight) => {
                with_timeout(&name, timeout, router.set_weight(&target, *weight)).await
            }
            Mutation::SetHeaderRoute(route) => {
                with_timeout(&name, timeout, router.set_header_route(&target, route)).await
            }
            Mutation::SetMirrorRoute(route) => {
                with_timeout(&name, timeout, router.set_mirror_route(&target, route)).await
            }
            Mutation::RemoveManagedRoutes => {
                with_timeout(&name, timeout, router.remove_managed_routes(&target)).await
            }
            _ => Ok(()),
        }
    }
}
