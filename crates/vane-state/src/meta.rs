//! Object metadata shared by every stored kind.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Revision number of a replica set within its rollout.
pub const REVISION_ANNOTATION: &str = "rollout.vane.dev/revision";

/// Unix time after which a superseded replica set may be scaled to zero.
pub const SCALE_DOWN_DEADLINE_ANNOTATION: &str = "rollout.vane.dev/scale-down-deadline";

/// Set on a replica set the first time it becomes stable.
pub const PROMOTED_AT_ANNOTATION: &str = "rollout.vane.dev/promoted-at";

/// Selector/label key the controller manages on services and pods.
pub const POD_TEMPLATE_HASH_LABEL: &str = "rollouts-pod-template-hash";

/// Label identifying the rollout that owns a child object.
pub const ROLLOUT_LABEL: &str = "rollout.vane.dev/rollout";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: String,
    /// Bumped by the store whenever the spec changes.
    #[serde(default)]
    pub generation: u64,
    /// Bumped by the store on every write; used as a write precondition.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
    #[serde(default)]
    pub created_at: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// Store key: `{namespace}/{name}`.
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Numeric annotation value, if present and well-formed.
    pub fn annotation_u64(&self, key: &str) -> Option<u64> {
        self.annotation(key).and_then(|v| v.parse().ok())
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner.as_ref().is_some_and(|o| o.uid == uid)
    }
}

pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Split a `{namespace}/{name}` key.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}
