//! Workload primitives the controller orchestrates: pod templates, replica
//! sets, services and experiments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisArg, AnalysisPhase};
use crate::meta::{ObjectMeta, POD_TEMPLATE_HASH_LABEL};

// ── Pod template ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

// ── ReplicaSet ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSet {
    pub metadata: ObjectMeta,
    pub spec: ReplicaSetSpec,
    #[serde(default)]
    pub status: ReplicaSetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetSpec {
    pub replicas: u32,
    pub pod_template_hash: String,
    pub template: PodTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetStatus {
    pub replicas: u32,
    pub ready_replicas: u32,
    pub available_replicas: u32,
    pub observed_generation: u64,
}

impl ReplicaSet {
    pub fn pod_hash(&self) -> &str {
        &self.spec.pod_template_hash
    }

    /// Status reflects the current spec and every desired replica is available.
    pub fn is_fully_available(&self) -> bool {
        self.status.observed_generation >= self.metadata.generation
            && self.status.available_replicas >= self.spec.replicas
    }

    /// Available replicas, discounting a status that predates the current spec.
    pub fn available(&self) -> u32 {
        self.status.available_replicas.min(self.spec.replicas)
    }
}

// ── Service ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Service {
    /// Pod template hash the service currently selects, if managed.
    pub fn selected_hash(&self) -> Option<&str> {
        self.spec
            .selector
            .get(POD_TEMPLATE_HASH_LABEL)
            .map(String::as_str)
    }
}

// ── Experiment ─────────────────────────────────────────────────────

/// A time-boxed run of one or more template variants, executed by an
/// external experiment controller which reports back through `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub metadata: ObjectMeta,
    pub spec: ExperimentSpec,
    #[serde(default)]
    pub status: ExperimentStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    pub templates: Vec<ExperimentVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub analyses: Vec<ExperimentAnalysisRef>,
    #[serde(default)]
    pub terminate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentVariant {
    pub name: String,
    pub replicas: u32,
    pub pod_template_hash: String,
    pub template: PodTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentAnalysisRef {
    pub name: String,
    pub template_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<AnalysisArg>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    #[serde(default)]
    pub phase: AnalysisPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(replicas: u32, available: u32, generation: u64, observed: u64) -> ReplicaSet {
        let mut metadata = ObjectMeta::new("default", "web-abc");
        metadata.generation = generation;
        ReplicaSet {
            metadata,
            spec: ReplicaSetSpec {
                replicas,
                pod_template_hash: "abc".to_string(),
                template: PodTemplate::default(),
            },
            status: ReplicaSetStatus {
                replicas: available,
                ready_replicas: available,
                available_replicas: available,
                observed_generation: observed,
            },
        }
    }

    #[test]
    fn availability_requires_observed_generation() {
        assert!(rs(3, 3, 2, 2).is_fully_available());
        assert!(!rs(3, 3, 2, 1).is_fully_available());
        assert!(!rs(3, 2, 1, 1).is_fully_available());
        assert!(rs(0, 0, 1, 1).is_fully_available());
    }

    #[test]
    fn available_is_capped_by_spec() {
        assert_eq!(rs(2, 5, 1, 1).available(), 2);
    }

    #[test]
    fn service_selected_hash() {
        let mut svc = Service {
            metadata: ObjectMeta::new("default", "web-stable"),
            spec: ServiceSpec::default(),
        };
        assert_eq!(svc.selected_hash(), None);
        svc.spec
            .selector
            .insert(POD_TEMPLATE_HASH_LABEL.to_string(), "abc".to_string());
        assert_eq!(svc.selected_hash(), Some("abc"));
    }
}
