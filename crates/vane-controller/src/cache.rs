//! Object cache — an indexed, in-memory view of the object store.
//!
//! Reconcilers read from the cache rather than the store. The cache is
//! written only by the controller's feed loop (watch events and relists);
//! everything else holds a read-only `ObjectCache` handle.
//!
//! Objects are indexed by kind and `{namespace}/{name}`, plus an owner
//! index from owner uid to the keys of the objects it owns.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use vane_state::{EventType, Kind, Object, Resource, WatchEvent};

#[derive(Default)]
struct Index {
    objects: HashMap<Kind, BTreeMap<String, Object>>,
    /// owner uid → (kind, key) of owned objects.
    owned: HashMap<String, BTreeSet<(Kind, String)>>,
}

impl Index {
    fn insert(&mut self, object: Object) {
        let kind = object.kind();
        let key = object.key();
        self.remove(kind, &key);
        if let Some(owner) = &object.meta().owner {
            self.owned
                .entry(owner.uid.clone())
                .or_default()
                .insert((kind, key.clone()));
        }
        self.objects.entry(kind).or_default().insert(key, object);
    }

    fn remove(&mut self, kind: Kind, key: &str) -> Option<Object> {
        let removed = self.objects.get_mut(&kind)?.remove(key)?;
        if let Some(owner) = &removed.meta().owner
            && let Some(keys) = self.owned.get_mut(&owner.uid)
        {
            keys.remove(&(kind, key.to_string()));
            if keys.is_empty() {
                self.owned.remove(&owner.uid);
            }
        }
        Some(removed)
    }
}

/// Read handle on the cache. Cheap to clone; clones share the same index.
#[derive(Clone, Default)]
pub struct ObjectCache {
    index: Arc<RwLock<Index>>,
}

impl ObjectCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn get<R: Resource>(&self, key: &str) -> Option<R> {
        let index = self.index.read().expect("cache lock");
        index
            .objects
            .get(&R::KIND)?
            .get(key)
            .and_then(R::from_object)
            .cloned()
    }

    pub fn list<R: Resource>(&self) -> Vec<R> {
        let index = self.index.read().expect("cache lock");
        index
            .objects
            .get(&R::KIND)
            .map(|objects| objects.values().filter_map(R::from_object).cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_in_namespace<R: Resource>(&self, namespace: &str) -> Vec<R> {
        let prefix = format!("{namespace}/");
        let index = self.index.read().expect("cache lock");
        index
            .objects
            .get(&R::KIND)
            .map(|objects| {
                objects
                    .range(prefix.clone()..)
                    .take_while(|(key, _)| key.starts_with(&prefix))
                    .filter_map(|(_, object)| R::from_object(object))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Objects of kind `R` whose owner has the given uid.
    pub fn owned_by<R: Resource>(&self, owner_uid: &str) -> Vec<R> {
        let index = self.index.read().expect("cache lock");
        let (Some(keys), Some(objects)) = (index.owned.get(owner_uid), index.objects.get(&R::KIND))
        else {
            return Vec::new();
        };
        keys.iter()
            .filter(|(kind, _)| *kind == R::KIND)
            .filter_map(|(_, key)| objects.get(key))
            .filter_map(R::from_object)
            .cloned()
            .collect()
    }

    /// Resource version of the cached copy, if present.
    pub fn resource_version(&self, kind: Kind, key: &str) -> Option<u64> {
        let index = self.index.read().expect("cache lock");
        index
            .objects
            .get(&kind)?
            .get(key)
            .map(|object| object.meta().resource_version)
    }

    pub fn len(&self, kind: Kind) -> usize {
        let index = self.index.read().expect("cache lock");
        index.objects.get(&kind).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        Kind::ALL.iter().all(|kind| self.len(*kind) == 0)
    }

    // ── Feed side ──────────────────────────────────────────────────

    /// Apply one watch event. Events older than the cached copy are
    /// ignored, which makes replays after a relist harmless.
    pub(crate) fn apply(&self, event: &WatchEvent) {
        let kind = event.kind();
        let key = event.key();
        let mut index = self.index.write().expect("cache lock");
        match event.event_type {
            EventType::Added | EventType::Modified => {
                let incoming = event.object.meta().resource_version;
                let cached = index
                    .objects
                    .get(&kind)
                    .and_then(|objects| objects.get(&key))
                    .map(|object| object.meta().resource_version);
                if cached.is_some_and(|rv| rv > incoming) {
                    trace!(%kind, %key, incoming, "stale watch event ignored");
                    return;
                }
                index.insert(event.object.clone());
            }
            EventType::Deleted => {
                index.remove(kind, &key);
            }
        }
        trace!(%kind, %key, event = ?event.event_type, "cache updated");
    }

    /// Replace every object of `kind` with a fresh listing.
    pub(crate) fn replace(&self, kind: Kind, objects: Vec<Object>) {
        let mut index = self.index.write().expect("cache lock");
        let stale: Vec<String> = index
            .objects
            .get(&kind)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        for key in stale {
            index.remove(kind, &key);
        }
        let count = objects.len();
        for object in objects {
            index.insert(object);
        }
        debug!(%kind, count, "cache relisted");
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ObjectCache");
        for kind in Kind::ALL {
            s.field(kind.as_str(), &self.len(kind));
        }
        s.finish()
    }
}
