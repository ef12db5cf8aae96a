//! StateStore — the authoritative object store.
//!
//! Objects are JSON-serialized into one redb table per kind, keyed by
//! `{namespace}/{name}`. Every committed write takes the next value of a
//! store-wide resource version sequence, which callers pass back as an
//! optimistic-concurrency precondition. After commit, the change is
//! published on a broadcast watch feed.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::analysis::{AnalysisRun, AnalysisTemplate};
use crate::error::{StateError, StateResult};
use crate::object::{Kind, Object, Resource};
use crate::rollout::Rollout;
use crate::tables::*;
use crate::watch::{EventType, WATCH_CAPACITY, WatchEvent};
use crate::workload::{Experiment, ReplicaSet, Service};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "object store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory object store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for kind in Kind::ALL {
            txn.open_table(kind.table()).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to the change feed. Events are only delivered for writes
    /// committed after subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event_type: EventType, object: Object) {
        trace!(kind = %object.kind(), key = %object.key(), ?event_type, "watch event");
        // No subscribers is fine.
        let _ = self.events.send(WatchEvent { event_type, object });
    }

    /// Highest resource version handed out so far.
    pub fn resource_version(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        let current = table
            .get(RESOURCE_VERSION_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(current)
    }

    // ── Generic CRUD ───────────────────────────────────────────────

    /// Create a new object. Fails with `AlreadyExists` if the key is taken.
    ///
    /// Assigns uid, generation 1, the creation time and a resource version.
    pub fn create<R: Resource>(&self, mut obj: R) -> StateResult<R> {
        validate_meta(&obj)?;
        let key = obj.meta().key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(R::KIND.table()).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists { kind: R::KIND, key });
            }

            let meta = obj.meta_mut();
            meta.uid = uuid::Uuid::new_v4().to_string();
            meta.generation = 1;
            meta.created_at = epoch_secs();
            meta.resource_version = next_resource_version(&txn)?;

            let value = serde_json::to_vec(&obj).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %R::KIND, %key, "object created");
        self.publish(EventType::Added, obj.clone().into_object());
        Ok(obj)
    }

    /// Get an object by `{namespace}/{name}` key.
    pub fn get<R: Resource>(&self, key: &str) -> StateResult<Option<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::KIND.table()).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all objects of a kind.
    pub fn list<R: Resource>(&self) -> StateResult<Vec<R>> {
        self.list_with_prefix("")
    }

    /// List all objects of a kind in one namespace.
    pub fn list_in_namespace<R: Resource>(&self, namespace: &str) -> StateResult<Vec<R>> {
        self.list_with_prefix(&format!("{namespace}/"))
    }

    fn list_with_prefix<R: Resource>(&self, prefix: &str) -> StateResult<Vec<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::KIND.table()).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    /// List every object of a kind, type-erased. Used for cache relists.
    pub fn list_objects(&self, kind: Kind) -> StateResult<Vec<Object>> {
        fn erase<R: Resource>(items: Vec<R>) -> Vec<Object> {
            items.into_iter().map(Resource::into_object).collect()
        }
        Ok(match kind {
            Kind::Rollout => erase(self.list::<Rollout>()?),
            Kind::ReplicaSet => erase(self.list::<ReplicaSet>()?),
            Kind::Service => erase(self.list::<Service>()?),
            Kind::AnalysisTemplate => erase(self.list::<AnalysisTemplate>()?),
            Kind::AnalysisRun => erase(self.list::<AnalysisRun>()?),
            Kind::Experiment => erase(self.list::<Experiment>()?),
        })
    }

    /// Update spec and metadata, preserving the stored status.
    ///
    /// A non-zero `resource_version` on `obj` must match the stored one.
    /// The generation is bumped only when the spec changes. An update that
    /// changes nothing is not written.
    pub fn update<R: Resource>(&self, mut obj: R) -> StateResult<R> {
        validate_meta(&obj)?;
        let key = obj.meta().key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(R::KIND.table()).map_err(map_err!(Table))?;
            let existing: R = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound { kind: R::KIND, key }),
            };
            check_version(R::KIND, &key, obj.meta().resource_version, existing.meta())?;

            let spec_changed = obj.spec_changed(&existing);
            obj.copy_status_from(&existing);
            let prev = existing.meta();
            let meta = obj.meta_mut();
            meta.uid = prev.uid.clone();
            meta.created_at = prev.created_at;
            meta.generation = prev.generation + u64::from(spec_changed);
            meta.resource_version = prev.resource_version;

            if same_json(&obj, &existing)? {
                return Ok(existing);
            }

            obj.meta_mut().resource_version = next_resource_version(&txn)?;
            let value = serde_json::to_vec(&obj).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %R::KIND, %key, generation = obj.meta().generation, "object updated");
        self.publish(EventType::Modified, obj.clone().into_object());
        Ok(obj)
    }

    /// Replace the status subresource, leaving spec and metadata untouched.
    ///
    /// A non-zero `resource_version` on `obj` must match the stored one.
    pub fn update_status<R: Resource>(&self, obj: &R) -> StateResult<R> {
        let key = obj.meta().key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let mut table = txn.open_table(R::KIND.table()).map_err(map_err!(Table))?;
            let existing: R = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound { kind: R::KIND, key }),
            };
            check_version(R::KIND, &key, obj.meta().resource_version, existing.meta())?;

            let mut stored = existing.clone();
            stored.copy_status_from(obj);
            if same_json(&stored, &existing)? {
                return Ok(existing);
            }

            stored.meta_mut().resource_version = next_resource_version(&txn)?;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            stored
        };
        txn.commit().map_err(map_err!(Transaction))?;
        trace!(kind = %R::KIND, %key, "status updated");
        self.publish(EventType::Modified, stored.clone().into_object());
        Ok(stored)
    }

    /// Create the object, or update its spec and metadata if it exists.
    pub fn apply<R: Resource>(&self, mut obj: R) -> StateResult<R> {
        match self.create(obj.clone()) {
            Err(StateError::AlreadyExists { .. }) => {
                obj.meta_mut().resource_version = 0;
                self.update(obj)
            }
            other => other,
        }
    }

    /// Delete an object by key. Returns true if it existed.
    pub fn delete<R: Resource>(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed: Option<R> = {
            let mut table = txn.open_table(R::KIND.table()).map_err(map_err!(Table))?;
            let removed = table.remove(key).map_err(map_err!(Write))?;
            match removed {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            }
        };
        if removed.is_some() {
            next_resource_version(&txn)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %R::KIND, %key, existed = removed.is_some(), "object deleted");
        match removed {
            Some(obj) => {
                self.publish(EventType::Deleted, obj.into_object());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn decode<R: Resource>(bytes: &[u8]) -> StateResult<R> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn same_json<R: Resource>(a: &R, b: &R) -> StateResult<bool> {
    let a = serde_json::to_value(a).map_err(map_err!(Serialize))?;
    let b = serde_json::to_value(b).map_err(map_err!(Serialize))?;
    Ok(a == b)
}

fn next_resource_version(txn: &WriteTransaction) -> StateResult<u64> {
    let mut table = txn.open_table(META).map_err(map_err!(Table))?;
    let current = table
        .get(RESOURCE_VERSION_KEY)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table
        .insert(RESOURCE_VERSION_KEY, next)
        .map_err(map_err!(Write))?;
    Ok(next)
}

fn check_version(
    kind: Kind,
    key: &str,
    expected: u64,
    stored: &crate::meta::ObjectMeta,
) -> StateResult<()> {
    if expected != 0 && expected != stored.resource_version {
        return Err(StateError::Conflict {
            kind,
            key: key.to_string(),
            expected,
            actual: stored.resource_version,
        });
    }
    Ok(())
}

fn validate_meta<R: Resource>(obj: &R) -> StateResult<()> {
    let meta = obj.meta();
    for (field, value) in [("name", &meta.name), ("namespace", &meta.namespace)] {
        if value.is_empty() {
            return Err(StateError::Invalid(format!("{} {field} is empty", R::KIND)));
        }
        if value.contains('/') {
            return Err(StateError::Invalid(format!(
                "{} {field} {value:?} contains '/'",
                R::KIND
            )));
        }
    }
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ObjectMeta, POD_TEMPLATE_HASH_LABEL};
    use crate::workload::{PodTemplate, ReplicaSetSpec, ReplicaSetStatus, ServiceSpec};

    fn service(namespace: &str, name: &str) -> Service {
        Service {
            metadata: ObjectMeta::new(namespace, name),
            spec: ServiceSpec::default(),
        }
    }

    fn replica_set(name: &str, replicas: u32) -> ReplicaSet {
        ReplicaSet {
            metadata: ObjectMeta::new("default", name),
            spec: ReplicaSetSpec {
                replicas,
                pod_template_hash: "abc123".to_string(),
                template: PodTemplate::default(),
            },
            status: ReplicaSetStatus::default(),
        }
    }

    // ── Create / get / list ────────────────────────────────────────

    #[test]
    fn create_assigns_identity() {
        let store = StateStore::open_in_memory().unwrap();
        let created = store.create(service("default", "web")).unwrap();

        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.generation, 1);
        assert!(created.metadata.resource_version > 0);

        let fetched: Service = store.get("default/web").unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn create_duplicate_fails() {
        let store = StateStore::open_in_memory().unwrap();
        store.create(service("default", "web")).unwrap();
        let err = store.create(service("default", "web")).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn create_rejects_bad_names() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            store.create(service("default", "")),
            Err(StateError::Invalid(_))
        ));
        assert!(matches!(
            store.create(service("a/b", "web")),
            Err(StateError::Invalid(_))
        ));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        let result: Option<Service> = store.get("nope/nothing").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn list_by_namespace() {
        let store = StateStore::open_in_memory().unwrap();
        store.create(service("ns1", "a")).unwrap();
        store.create(service("ns1", "b")).unwrap();
        store.create(service("ns2", "c")).unwrap();

        assert_eq!(store.list::<Service>().unwrap().len(), 3);
        assert_eq!(store.list_in_namespace::<Service>("ns1").unwrap().len(), 2);
        assert_eq!(store.list_objects(Kind::Service).unwrap().len(), 3);
        assert!(store.list_objects(Kind::Rollout).unwrap().is_empty());
    }

    #[test]
    fn resource_versions_increase() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.create(service("default", "a")).unwrap();
        let b = store.create(service("default", "b")).unwrap();
        assert!(b.metadata.resource_version > a.metadata.resource_version);
        assert_eq!(store.resource_version().unwrap(), b.metadata.resource_version);
    }

    // ── Update ─────────────────────────────────────────────────────

    #[test]
    fn update_bumps_generation_on_spec_change_only() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rs = store.create(replica_set("web-abc", 1)).unwrap();

        rs.metadata
            .labels
            .insert("team".to_string(), "payments".to_string());
        let rs = store.update(rs).unwrap();
        assert_eq!(rs.metadata.generation, 1);

        let mut rs2 = rs.clone();
        rs2.spec.replicas = 3;
        let rs2 = store.update(rs2).unwrap();
        assert_eq!(rs2.metadata.generation, 2);
        assert_eq!(rs2.metadata.uid, rs.metadata.uid);
    }

    #[test]
    fn update_preserves_status() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rs = store.create(replica_set("web-abc", 2)).unwrap();
        rs.status.available_replicas = 2;
        let rs = store.update_status(&rs).unwrap();

        let mut changed = rs.clone();
        changed.spec.replicas = 4;
        changed.status = ReplicaSetStatus::default();
        let updated = store.update(changed).unwrap();
        assert_eq!(updated.status.available_replicas, 2);
        assert_eq!(updated.spec.replicas, 4);
    }

    #[test]
    fn update_status_preserves_spec() {
        let store = StateStore::open_in_memory().unwrap();
        let rs = store.create(replica_set("web-abc", 2)).unwrap();

        let mut stale = rs.clone();
        stale.spec.replicas = 9;
        stale.status.ready_replicas = 1;
        let updated = store.update_status(&stale).unwrap();
        assert_eq!(updated.spec.replicas, 2);
        assert_eq!(updated.status.ready_replicas, 1);
        assert_eq!(updated.metadata.generation, 1);
    }

    #[test]
    fn stale_resource_version_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        let rs = store.create(replica_set("web-abc", 1)).unwrap();

        let mut first = rs.clone();
        first.status.replicas = 1;
        store.update_status(&first).unwrap();

        let mut second = rs.clone();
        second.status.replicas = 5;
        let err = store.update_status(&second).unwrap_err();
        assert!(err.is_conflict());

        // Zero resource version skips the precondition.
        let mut unconditional = rs;
        unconditional.metadata.resource_version = 0;
        unconditional.status.replicas = 5;
        assert!(store.update_status(&unconditional).is_ok());
    }

    #[test]
    fn noop_update_is_not_written() {
        let store = StateStore::open_in_memory().unwrap();
        let svc = store.create(service("default", "web")).unwrap();
        let mut rx = store.subscribe();

        let same = store.update(svc.clone()).unwrap();
        assert_eq!(same.metadata.resource_version, svc.metadata.resource_version);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.update(service("default", "ghost")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn apply_creates_then_updates() {
        let store = StateStore::open_in_memory().unwrap();
        let created = store.apply(service("default", "web")).unwrap();
        assert_eq!(created.metadata.generation, 1);

        let mut svc = service("default", "web");
        svc.spec
            .selector
            .insert(POD_TEMPLATE_HASH_LABEL.to_string(), "abc".to_string());
        let updated = store.apply(svc).unwrap();
        assert_eq!(updated.metadata.generation, 2);
        assert_eq!(updated.metadata.uid, created.metadata.uid);
    }

    // ── Delete / watch ─────────────────────────────────────────────

    #[test]
    fn delete_reports_existence() {
        let store = StateStore::open_in_memory().unwrap();
        store.create(service("default", "web")).unwrap();

        assert!(store.delete::<Service>("default/web").unwrap());
        assert!(!store.delete::<Service>("default/web").unwrap());
        assert!(store.get::<Service>("default/web").unwrap().is_none());
    }

    #[test]
    fn watch_feed_sees_every_write() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rx = store.subscribe();

        let rs = store.create(replica_set("web-abc", 1)).unwrap();
        let mut rs2 = rs.clone();
        rs2.status.replicas = 1;
        store.update_status(&rs2).unwrap();
        store.delete::<ReplicaSet>("default/web-abc").unwrap();

        let events: Vec<_> = (0..3).map(|_| rx.try_recv().unwrap()).collect();
        assert_eq!(events[0].event_type, EventType::Added);
        assert_eq!(events[1].event_type, EventType::Modified);
        assert_eq!(events[2].event_type, EventType::Deleted);
        assert!(events.iter().all(|e| e.kind() == Kind::ReplicaSet));
        assert_eq!(events[2].key(), "default/web-abc");
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vane.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.create(service("default", "web")).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get::<Service>("default/web").unwrap().is_some());
        assert!(store.resource_version().unwrap() >= 1);
    }
}
