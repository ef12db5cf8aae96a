//! Readiness simulation for standalone operation.
//!
//! With no workload controller running pods, replica set status would never
//! move. When enabled, this reconciler reports every desired replica as
//! ready and available as soon as the spec changes.

use std::time::Duration;

use tracing::{debug, instrument};

use vane_state::{ReplicaSet, ReplicaSetStatus, StateStore};

use crate::cache::ObjectCache;
use crate::error::ReconcileResult;

pub struct ReadinessSimulator {
    store: StateStore,
    cache: ObjectCache,
}

impl ReadinessSimulator {
    pub fn new(store: StateStore, cache: ObjectCache) -> Self {
        Self { store, cache }
    }

    #[instrument(skip(self), fields(replica_set = %key))]
    pub async fn reconcile(&self, key: &str) -> ReconcileResult<Option<Duration>> {
        let Some(mut rs) = self.cache.get::<ReplicaSet>(key) else {
            return Ok(None);
        };
        let replicas = rs.spec.replicas;
        let desired = ReplicaSetStatus {
            replicas,
            ready_replicas: replicas,
            available_replicas: replicas,
            observed_generation: rs.metadata.generation,
        };
        if rs.status == desired {
            return Ok(None);
        }
        debug!(replicas, generation = rs.metadata.generation, "marking replicas available");
        rs.status = desired;
        match self.store.update_status(&rs) {
            Ok(_) => Ok(None),
            // Deleted meanwhile.
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vane_state::{EventType, ObjectMeta, PodTemplate, ReplicaSetSpec, Resource, WatchEvent};

    fn sync(cache: &ObjectCache, rs: ReplicaSet) {
        cache.apply(&WatchEvent {
            event_type: EventType::Modified,
            object: rs.into_object(),
        });
    }

    #[tokio::test]
    async fn status_follows_spec() {
        let store = StateStore::open_in_memory().unwrap();
        let cache = ObjectCache::new();
        let created = store
            .create(ReplicaSet {
                metadata: ObjectMeta::new("default", "web-abc"),
                spec: ReplicaSetSpec {
                    replicas: 3,
                    pod_template_hash: "abc".to_string(),
                    template: PodTemplate::default(),
                },
                status: ReplicaSetStatus::default(),
            })
            .unwrap();
        sync(&cache, created);

        let sim = ReadinessSimulator::new(store.clone(), cache.clone());
        sim.reconcile("default/web-abc").await.unwrap();
        let rs: ReplicaSet = store.get("default/web-abc").unwrap().unwrap();
        assert!(rs.is_fully_available());
        assert_eq!(rs.status.available_replicas, 3);

        // Converged: a second pass writes nothing.
        sync(&cache, rs.clone());
        let rv = store.resource_version().unwrap();
        sim.reconcile("default/web-abc").await.unwrap();
        assert_eq!(store.resource_version().unwrap(), rv);
    }
}
