//! User actions on a rollout. Each edits the stored object; the next
//! reconcile pass acts on the change.

use tracing::info;

use vane_core::template_hash;
use vane_state::{BlueGreenStatus, CanaryStatus, ConditionType, Rollout, RolloutStrategy};

use crate::conditions::remove_condition;
use crate::error::{PlanError, PlanResult};

fn in_flight(rollout: &Rollout) -> bool {
    let desired = template_hash(&rollout.spec.template);
    rollout.status.stable_rs.as_deref().is_some_and(|stable| stable != desired)
}

/// Release the current pause. With `full`, skip the remaining steps and
/// analysis and promote as soon as the new revision is available.
pub fn promote(rollout: &mut Rollout, full: bool) -> PlanResult<()> {
    if !in_flight(rollout) {
        return Err(PlanError::NotInFlight);
    }
    if rollout.status.abort {
        return Err(PlanError::Aborted);
    }
    let status = &mut rollout.status;
    if !full && status.pause_conditions.is_empty() {
        return Err(PlanError::NotPaused);
    }
    status.pause_conditions.clear();
    if full {
        status.promote_full = true;
    }
    info!(rollout = %rollout.metadata.key(), full, "promote requested");
    Ok(())
}

/// Abort the in-flight update: traffic and replicas return to stable.
pub fn abort(rollout: &mut Rollout, now: u64) -> PlanResult<()> {
    if !in_flight(rollout) {
        return Err(PlanError::NotInFlight);
    }
    let status = &mut rollout.status;
    if !status.abort {
        status.abort = true;
        status.aborted_at = Some(now);
        status.message = "aborted by user".to_string();
        info!(rollout = %rollout.metadata.key(), "abort requested");
    }
    Ok(())
}

/// Restart an aborted update from the first step.
pub fn retry(rollout: &mut Rollout) -> PlanResult<()> {
    if !rollout.status.abort {
        return Err(PlanError::NotAborted);
    }
    let canary = matches!(rollout.spec.strategy, RolloutStrategy::Canary(_));
    let status = &mut rollout.status;
    status.abort = false;
    status.aborted_at = None;
    status.message.clear();
    status.current_step_index = canary.then_some(0);
    status.promote_full = false;
    status.pause_conditions.clear();
    status.controller_pause = false;
    status.canary = CanaryStatus::default();
    status.blue_green = BlueGreenStatus {
        active_selector: status.stable_rs.clone(),
        preview_selector: status.blue_green.preview_selector.take(),
        ..Default::default()
    };
    // A fresh deadline window for the new attempt.
    remove_condition(status, ConditionType::Progressing);
    info!(rollout = %rollout.metadata.key(), "retry requested");
    Ok(())
}

pub fn pause(rollout: &mut Rollout) {
    rollout.spec.paused = true;
}

pub fn resume(rollout: &mut Rollout) {
    rollout.spec.paused = false;
}
