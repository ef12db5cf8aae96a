//! Rollout status conditions.
//!
//! Timestamps only move on real changes: `last_transition_time` when the
//! status flips, `last_update_time` when status, reason or message change.
//! Re-planning an unchanged rollout therefore yields an identical status.

use vane_state::{Condition, ConditionStatus, ConditionType, RolloutStatus};

pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_REPLICA_SET_UPDATED: &str = "ReplicaSetUpdated";
pub const REASON_ROLLOUT_PROGRESSING: &str = "RolloutProgressing";
pub const REASON_NEW_RS_AVAILABLE: &str = "NewReplicaSetAvailable";
pub const REASON_PROGRESS_DEADLINE: &str = "ProgressDeadlineExceeded";
pub const REASON_ABORTED: &str = "RolloutAborted";
pub const REASON_PAUSED: &str = "RolloutPaused";
pub const REASON_RESUMED: &str = "RolloutResumed";
pub const REASON_AVAILABLE: &str = "AvailableReplicas";
pub const REASON_UNAVAILABLE: &str = "InsufficientReplicas";
pub const REASON_COMPLETED: &str = "RolloutCompleted";
pub const REASON_IN_PROGRESS: &str = "RolloutInProgress";
pub const REASON_HEALTHY: &str = "RolloutHealthy";
pub const REASON_UNHEALTHY: &str = "RolloutNotHealthy";

/// Set a condition, preserving timestamps where nothing changed.
pub fn set_condition(
    status: &mut RolloutStatus,
    kind: ConditionType,
    value: bool,
    reason: &str,
    message: &str,
    now: u64,
) {
    let value = ConditionStatus::from(value);
    match status.conditions.iter_mut().find(|c| c.kind == kind) {
        Some(existing) => {
            if existing.status != value {
                existing.last_transition_time = now;
            }
            if existing.status != value || existing.reason != reason || existing.message != message {
                existing.last_update_time = now;
            }
            existing.status = value;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        None => status.conditions.push(Condition {
            kind,
            status: value,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
            last_update_time: now,
        }),
    }
}

pub fn remove_condition(status: &mut RolloutStatus, kind: ConditionType) {
    status.conditions.retain(|c| c.kind != kind);
}

pub fn has_reason(status: &RolloutStatus, kind: ConditionType, reason: &str) -> bool {
    status.condition(kind).is_some_and(|c| c.reason == reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_move_only_on_change() {
        let mut status = RolloutStatus::default();
        set_condition(&mut status, ConditionType::Available, false, REASON_UNAVAILABLE, "", 10);

        set_condition(&mut status, ConditionType::Available, false, REASON_UNAVAILABLE, "", 20);
        let cond = status.condition(ConditionType::Available).unwrap();
        assert_eq!((cond.last_transition_time, cond.last_update_time), (10, 10));

        set_condition(&mut status, ConditionType::Available, false, REASON_UNAVAILABLE, "1/3", 30);
        let cond = status.condition(ConditionType::Available).unwrap();
        assert_eq!((cond.last_transition_time, cond.last_update_time), (10, 30));

        set_condition(&mut status, ConditionType::Available, true, REASON_AVAILABLE, "", 40);
        let cond = status.condition(ConditionType::Available).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!((cond.last_transition_time, cond.last_update_time), (40, 40));
    }

    #[test]
    fn remove_and_reason() {
        let mut status = RolloutStatus::default();
        set_condition(&mut status, ConditionType::InvalidSpec, true, REASON_INVALID_SPEC, "bad", 1);
        assert!(has_reason(&status, ConditionType::InvalidSpec, REASON_INVALID_SPEC));
        remove_condition(&mut status, ConditionType::InvalidSpec);
        assert!(status.condition(ConditionType::InvalidSpec).is_none());
    }
}
