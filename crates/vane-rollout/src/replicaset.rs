//! Replica set construction and replica arithmetic.

use vane_state::{
    CanaryStep, ObjectMeta, OwnerRef, POD_TEMPLATE_HASH_LABEL, PROMOTED_AT_ANNOTATION,
    REVISION_ANNOTATION, ROLLOUT_LABEL, ReplicaSet, ReplicaSetSpec, ReplicaSetStatus, Rollout,
};

/// `{rollout}-{hash}`.
pub fn replica_set_name(rollout: &str, pod_hash: &str) -> String {
    format!("{rollout}-{pod_hash}")
}

/// Revision number recorded on a replica set, 0 when absent.
pub fn revision(rs: &ReplicaSet) -> u64 {
    rs.metadata.annotation_u64(REVISION_ANNOTATION).unwrap_or(0)
}

pub fn max_revision(replica_sets: &[ReplicaSet]) -> u64 {
    replica_sets.iter().map(revision).max().unwrap_or(0)
}

/// Whether the replica set has been the stable revision at some point.
pub fn was_promoted(rs: &ReplicaSet) -> bool {
    rs.metadata.annotation(PROMOTED_AT_ANNOTATION).is_some()
}

/// A new replica set for the rollout's current template.
pub fn new_replica_set(rollout: &Rollout, pod_hash: &str, replicas: u32, revision: u64) -> ReplicaSet {
    let mut template = rollout.spec.template.clone();
    template
        .labels
        .insert(POD_TEMPLATE_HASH_LABEL.to_string(), pod_hash.to_string());

    let mut metadata = ObjectMeta::new(
        &rollout.metadata.namespace,
        &replica_set_name(&rollout.metadata.name, pod_hash),
    );
    metadata.labels = template.labels.clone();
    metadata
        .labels
        .insert(ROLLOUT_LABEL.to_string(), rollout.metadata.name.clone());
    metadata
        .annotations
        .insert(REVISION_ANNOTATION.to_string(), revision.to_string());
    metadata.owner = Some(OwnerRef {
        kind: "Rollout".to_string(),
        name: rollout.metadata.name.clone(),
        uid: rollout.metadata.uid.clone(),
    });

    ReplicaSet {
        metadata,
        spec: ReplicaSetSpec {
            replicas,
            pod_template_hash: pod_hash.to_string(),
            template,
        },
        status: ReplicaSetStatus::default(),
    }
}

/// `ceil(replicas * weight / 100)`.
pub fn replicas_for_weight(replicas: u32, weight: u32) -> u32 {
    let weight = weight.min(100) as u64;
    ((replicas as u64 * weight).div_ceil(100)) as u32
}

/// Last `setWeight` at or before `index`.
pub fn weight_at(steps: &[CanaryStep], index: usize) -> u32 {
    steps
        .iter()
        .take(index.saturating_add(1))
        .filter_map(|step| match step {
            CanaryStep::SetWeight(w) => Some(*w),
            _ => None,
        })
        .last()
        .unwrap_or(0)
}

/// Canary replica count at `index`: the traffic weight share unless a
/// `setCanaryScale` at or before `index` overrides it.
pub fn canary_replicas_at(steps: &[CanaryStep], index: usize, replicas: u32) -> u32 {
    let weight = weight_at(steps, index);
    let scale = steps
        .iter()
        .take(index.saturating_add(1))
        .filter_map(|step| match step {
            CanaryStep::SetCanaryScale(scale) => Some(scale),
            _ => None,
        })
        .last();
    match scale {
        Some(s) if s.match_traffic_weight => replicas_for_weight(replicas, weight),
        Some(s) => match (s.replicas, s.weight) {
            (Some(n), _) => n.min(replicas),
            (None, Some(w)) => replicas_for_weight(replicas, w),
            (None, None) => replicas_for_weight(replicas, weight),
        },
        None => replicas_for_weight(replicas, weight),
    }
}
