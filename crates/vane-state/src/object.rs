//! Kinds, the type-erased `Object`, and the `Resource` trait that lets the
//! store handle every kind through one set of generic operations.

use serde::Serialize;
use serde::de::DeserializeOwned;

use redb::TableDefinition;

use crate::analysis::{AnalysisRun, AnalysisTemplate};
use crate::meta::ObjectMeta;
use crate::rollout::Rollout;
use crate::tables::*;
use crate::workload::{Experiment, ReplicaSet, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Kind {
    Rollout,
    ReplicaSet,
    Service,
    AnalysisTemplate,
    AnalysisRun,
    Experiment,
}

impl Kind {
    pub const ALL: [Kind; 6] = [
        Kind::Rollout,
        Kind::ReplicaSet,
        Kind::Service,
        Kind::AnalysisTemplate,
        Kind::AnalysisRun,
        Kind::Experiment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Rollout => "Rollout",
            Kind::ReplicaSet => "ReplicaSet",
            Kind::Service => "Service",
            Kind::AnalysisTemplate => "AnalysisTemplate",
            Kind::AnalysisRun => "AnalysisRun",
            Kind::Experiment => "Experiment",
        }
    }

    pub(crate) fn table(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Kind::Rollout => ROLLOUTS,
            Kind::ReplicaSet => REPLICA_SETS,
            Kind::Service => SERVICES,
            Kind::AnalysisTemplate => ANALYSIS_TEMPLATES,
            Kind::AnalysisRun => ANALYSIS_RUNS,
            Kind::Experiment => EXPERIMENTS,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored object of any kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Object {
    Rollout(Rollout),
    ReplicaSet(ReplicaSet),
    Service(Service),
    AnalysisTemplate(AnalysisTemplate),
    AnalysisRun(AnalysisRun),
    Experiment(Experiment),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Object::Rollout(_) => Kind::Rollout,
            Object::ReplicaSet(_) => Kind::ReplicaSet,
            Object::Service(_) => Kind::Service,
            Object::AnalysisTemplate(_) => Kind::AnalysisTemplate,
            Object::AnalysisRun(_) => Kind::AnalysisRun,
            Object::Experiment(_) => Kind::Experiment,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Object::Rollout(o) => &o.metadata,
            Object::ReplicaSet(o) => &o.metadata,
            Object::Service(o) => &o.metadata,
            Object::AnalysisTemplate(o) => &o.metadata,
            Object::AnalysisRun(o) => &o.metadata,
            Object::Experiment(o) => &o.metadata,
        }
    }

    pub fn key(&self) -> String {
        self.meta().key()
    }
}

/// A kind the store can persist.
///
/// `update` writes spec and metadata only; `update_status` writes status
/// only. Kinds without status leave the status hooks empty.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Whether the spec differs (drives generation bumps).
    fn spec_changed(&self, previous: &Self) -> bool;

    /// Replace this object's status with `other`'s.
    fn copy_status_from(&mut self, _other: &Self) {}

    fn into_object(self) -> Object;

    fn from_object(object: &Object) -> Option<&Self>;
}

macro_rules! resource {
    ($ty:ty, $kind:ident, status) => {
        impl Resource for $ty {
            const KIND: Kind = Kind::$kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }

            fn spec_changed(&self, previous: &Self) -> bool {
                self.spec != previous.spec
            }

            fn copy_status_from(&mut self, other: &Self) {
                self.status = other.status.clone();
            }

            fn into_object(self) -> Object {
                Object::$kind(self)
            }

            fn from_object(object: &Object) -> Option<&Self> {
                match object {
                    Object::$kind(o) => Some(o),
                    _ => None,
                }
            }
        }
    };
    ($ty:ty, $kind:ident) => {
        impl Resource for $ty {
            const KIND: Kind = Kind::$kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }

            fn spec_changed(&self, previous: &Self) -> bool {
                self.spec != previous.spec
            }

            fn into_object(self) -> Object {
                Object::$kind(self)
            }

            fn from_object(object: &Object) -> Option<&Self> {
                match object {
                    Object::$kind(o) => Some(o),
                    _ => None,
                }
            }
        }
    };
}

resource!(Rollout, Rollout, status);
resource!(ReplicaSet, ReplicaSet, status);
resource!(Service, Service);
resource!(AnalysisTemplate, AnalysisTemplate);
resource!(AnalysisRun, AnalysisRun, status);
resource!(Experiment, Experiment, status);
