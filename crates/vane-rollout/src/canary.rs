//! Canary strategy: ordered steps shifting traffic and replicas to the new
//! revision, gated by pauses, analysis and experiments.

use std::time::Duration;

use tracing::{debug, info};

use vane_core::{parse_duration, template_hash};
use vane_state::{
    CanaryStatus, CanaryStep, CanaryStrategy, HeaderRoute, MirrorRoute, PROMOTED_AT_ANNOTATION,
    PauseReason, ReplicaSet, SCALE_DOWN_DEADLINE_ANNOTATION, TrafficWeights,
};

use crate::children::{BACKGROUND_GATE, Gate, step_gate};
use crate::plan::{Mutation, Planner, REQUEUE_NOW, waiting_for};
use crate::replicaset::{canary_replicas_at, weight_at};

/// Recheck interval while the router has not verified a weight change.
const VERIFY_RECHECK: Duration = Duration::from_secs(5);

impl<'a> Planner<'a> {
    pub(crate) fn reconcile_canary(&mut self, canary: &'a CanaryStrategy) {
        let ctx = self.ctx;
        let spec = &ctx.rollout.spec;
        let steps = &canary.steps;
        let desired = self.desired_hash.clone();
        let stable = self.status.stable_rs.clone().unwrap_or_default();
        let routed = canary.traffic_routing.is_some();

        let step_hash = template_hash(steps);
        if self.status.current_step_hash.as_deref() != Some(step_hash.as_str()) {
            if self.status.current_step_hash.is_some() {
                info!(rollout = %self.key, "canary steps changed, restarting from the first step");
                self.restart_steps();
            }
            self.status.current_step_hash = Some(step_hash);
        }
        let index = *self.status.current_step_index.get_or_insert(0);

        let rollback = self.is_rollback();
        if rollback {
            debug!(rollout = %self.key, revision = %desired, "desired revision was stable before, skipping steps");
        }
        let skip = self.status.promote_full || rollback;

        let new_rs = self.find_rs(&desired);
        let want = self.canary_target(canary, index, skip);
        self.track_waiting(waiting_for(new_rs, &self.rs_name(&desired), want));

        if !self.status.abort && !spec.paused && !skip && index < steps.len() {
            self.canary_step(canary, index, new_rs, want);
        }
        if !self.status.abort && !skip {
            self.background_analysis(canary);
        }
        if self.status.abort {
            self.abort_canary(canary);
            return;
        }

        let index = self.status.current_step_index.unwrap_or(0);
        let done = skip || index >= steps.len();
        let canary_count = self.canary_target(canary, index, skip);
        let stable_count = if routed {
            spec.replicas
        } else {
            // Shrink stable only as far as the canary has come up.
            let up = new_rs.map_or(0, |rs| rs.available()).min(canary_count);
            spec.replicas.saturating_sub(up)
        };
        if let Some(rs) = self.ensure_replica_set(&desired, canary_count, false) {
            self.bump_revision(rs);
        }
        if let Some(rs) = self.find_rs(&stable) {
            self.scale(rs, stable_count);
        }
        if let Some(service) = &canary.canary_service {
            self.set_selector(service, &desired);
        }
        if let Some(service) = &canary.stable_service {
            self.set_selector(service, &stable);
        }

        self.status.canary.weights = Some(self.weights(canary, index, done));
        if done {
            self.note = "all steps complete".to_string();
            self.promote_canary(canary, new_rs);
        } else {
            self.note = format!("step {}/{}: {}", index + 1, steps.len(), steps[index].name());
        }
    }

    /// Canary replica count at `index`.
    fn canary_target(&self, canary: &CanaryStrategy, index: usize, skip: bool) -> u32 {
        let replicas = self.ctx.rollout.spec.replicas;
        if skip || index >= canary.steps.len() {
            replicas
        } else {
            canary_replicas_at(&canary.steps, index, replicas)
        }
    }

    fn restart_steps(&mut self) {
        self.status.current_step_index = Some(0);
        self.status.pause_conditions.clear();
        self.status.controller_pause = false;
        self.status.canary.current_step_analysis_run = None;
        self.status.canary.current_experiment = None;
        self.terminate_revision_children(false);
    }

    fn advance(&mut self, index: usize, step: &CanaryStep) {
        info!(rollout = %self.key, step = index, kind = step.name(), "canary step complete");
        self.status.current_step_index = Some(index + 1);
        self.status.canary.current_step_analysis_run = None;
        self.status.canary.current_experiment = None;
        self.requeue(REQUEUE_NOW);
    }

    /// Weight set earlier in this pass, not yet visible to the router.
    fn pending_weight(&self) -> Option<u32> {
        self.mutations.iter().rev().find_map(|m| match m {
            Mutation::SetWeight(w) => Some(*w),
            _ => None,
        })
    }

    fn canary_step(&mut self, canary: &CanaryStrategy, index: usize, new_rs: Option<&ReplicaSet>, want: u32) {
        let step = &canary.steps[index];
        let replicas_ready =
            new_rs.is_some_and(|rs| rs.spec.replicas == want && rs.is_fully_available());

        match step {
            CanaryStep::SetWeight(weight) => {
                if !replicas_ready {
                    return;
                }
                if canary.traffic_routing.is_some() {
                    let applied = self.applied();
                    if self.pending_weight().unwrap_or(applied.canary_weight) != *weight {
                        info!(rollout = %self.key, step = index, weight, "setting canary weight");
                        self.mutations.push(Mutation::SetWeight(*weight));
                        self.requeue(REQUEUE_NOW);
                        return;
                    }
                    if !applied.confirms(*weight) {
                        debug!(rollout = %self.key, weight, "waiting for router to verify weight");
                        self.requeue(VERIFY_RECHECK);
                        return;
                    }
                }
                self.advance(index, step);
            }
            CanaryStep::Pause(pause) => {
                let duration = pause
                    .duration
                    .as_deref()
                    .and_then(|d| parse_duration(d).ok())
                    .map(|d| d.as_secs());
                if self.pause_gate(PauseReason::CanaryPauseStep, duration) {
                    self.advance(index, step);
                }
            }
            CanaryStep::Analysis(analysis) => {
                let reference = self.status.canary.current_step_analysis_run.clone();
                let (reference, gate) = self.analysis_gate(reference, analysis, &step_gate(index));
                self.status.canary.current_step_analysis_run = reference;
                match gate {
                    Gate::Passed => self.advance(index, step),
                    Gate::Failed(reason) => self.abort(reason),
                    Gate::Inconclusive => {
                        if self.pause_gate(PauseReason::InconclusiveAnalysis, None) {
                            self.advance(index, step);
                        }
                    }
                    Gate::Waiting => {}
                }
            }
            CanaryStep::Experiment(experiment) => {
                let reference = self.status.canary.current_experiment.clone();
                let (reference, gate) = self.experiment_gate(reference, experiment, index);
                self.status.canary.current_experiment = reference;
                match gate {
                    Gate::Passed => self.advance(index, step),
                    Gate::Failed(reason) => self.abort(reason),
                    Gate::Inconclusive => {
                        if self.pause_gate(PauseReason::InconclusiveExperiment, None) {
                            self.advance(index, step);
                        }
                    }
                    Gate::Waiting => {}
                }
            }
            CanaryStep::SetCanaryScale(_) => {
                if replicas_ready {
                    self.advance(index, step);
                }
            }
            CanaryStep::SetHeaderRoute(route) => {
                let applied = self.applied();
                if header_route_in_effect(applied.header_route(&route.name), route) {
                    self.advance(index, step);
                } else {
                    info!(rollout = %self.key, route = %route.name, "setting header route");
                    self.mutations.push(Mutation::SetHeaderRoute(route.clone()));
                    self.requeue(REQUEUE_NOW);
                }
            }
            CanaryStep::SetMirrorRoute(route) => {
                let applied = self.applied();
                if mirror_route_in_effect(applied.mirror_route(&route.name), route) {
                    self.advance(index, step);
                } else {
                    info!(rollout = %self.key, route = %route.name, "setting mirror route");
                    self.mutations.push(Mutation::SetMirrorRoute(route.clone()));
                    self.requeue(REQUEUE_NOW);
                }
            }
        }
    }

    fn background_analysis(&mut self, canary: &CanaryStrategy) {
        let Some(analysis) = &canary.analysis else {
            return;
        };
        let index = self.status.current_step_index.unwrap_or(0);
        if index < analysis.start_index.unwrap_or(0) {
            return;
        }
        let reference = self.status.canary.current_background_analysis_run.clone();
        let (reference, gate) = self.analysis_gate(reference, analysis, BACKGROUND_GATE);
        self.status.canary.current_background_analysis_run = reference;
        match gate {
            Gate::Failed(reason) => self.abort(reason),
            Gate::Inconclusive => {
                // Once released, measure afresh with a new run.
                if self.pause_gate(PauseReason::InconclusiveAnalysis, None)
                    && let Some(run) = self.status.canary.current_background_analysis_run.take()
                {
                    self.terminate_run(&run.name);
                }
            }
            Gate::Passed | Gate::Waiting => {}
        }
    }

    /// Send all traffic back to stable and scale the canary to zero. The
    /// canary replica set is kept for diagnosis and retry.
    fn abort_canary(&mut self, canary: &CanaryStrategy) {
        let ctx = self.ctx;
        let spec = &ctx.rollout.spec;
        let stable = self.status.stable_rs.clone().unwrap_or_default();

        self.reset_traffic();
        self.terminate_revision_children(true);
        if let Some(rs) = self.find_rs(&self.desired_hash) {
            self.scale(rs, 0);
        }
        if let Some(rs) = self.find_rs(&stable) {
            self.scale(rs, spec.replicas);
        }
        for service in [&canary.stable_service, &canary.canary_service].into_iter().flatten() {
            self.set_selector(service, &stable);
        }
        self.status.pause_conditions.clear();
        self.status.controller_pause = false;
        self.status.canary.weights = Some(TrafficWeights {
            canary: 0,
            stable: 100,
            verified: self.applied().verified.filter(|_| canary.traffic_routing.is_some()),
        });
        self.waiting = None;
    }

    /// Make the canary the new stable revision once it is fully available.
    fn promote_canary(&mut self, canary: &CanaryStrategy, new_rs: Option<&'a ReplicaSet>) {
        let replicas = self.ctx.rollout.spec.replicas;
        let Some(rs) = new_rs.filter(|rs| rs.spec.replicas == replicas && rs.is_fully_available())
        else {
            return;
        };
        let desired = self.desired_hash.clone();
        if let Some(service) = &canary.stable_service {
            self.set_selector(service, &desired);
        }
        self.reset_traffic();
        self.finalize_promotion(rs);
        self.status.canary = CanaryStatus::default();
    }

    /// Record `rs` as stable and schedule the previous stable for scale-down.
    pub(crate) fn finalize_promotion(&mut self, rs: &ReplicaSet) {
        let previous = self.status.stable_rs.clone();
        let delay = self.ctx.rollout.spec.scale_down_delay_seconds();
        if let Some(old) = previous.as_deref().and_then(|hash| self.find_rs(hash))
            && old.spec.replicas > 0
        {
            let deadline = self.now.saturating_add(delay);
            self.annotate(old, SCALE_DOWN_DEADLINE_ANNOTATION, deadline.to_string());
            self.retain_until.insert(old.metadata.name.clone(), deadline);
        }
        if rs.metadata.annotation(PROMOTED_AT_ANNOTATION).is_none() {
            self.annotate(rs, PROMOTED_AT_ANNOTATION, self.now.to_string());
        }
        self.terminate_revision_children(false);

        info!(
            rollout = %self.key,
            revision = %self.desired_hash,
            previous = previous.as_deref().unwrap_or(""),
            "revision promoted to stable"
        );
        self.status.stable_rs = Some(self.desired_hash.clone());
        self.status.current_step_index = None;
        self.status.promote_full = false;
        self.status.pause_conditions.clear();
        self.status.controller_pause = false;
        self.requeue(REQUEUE_NOW);
    }

    fn weights(&self, canary: &CanaryStrategy, index: usize, done: bool) -> TrafficWeights {
        let canary_weight = if canary.traffic_routing.is_some() {
            self.applied().canary_weight
        } else if done {
            100
        } else {
            weight_at(&canary.steps, index)
        };
        TrafficWeights {
            canary: canary_weight,
            stable: 100 - canary_weight.min(100),
            verified: if canary.traffic_routing.is_some() {
                self.applied().verified
            } else {
                None
            },
        }
    }
}

fn header_route_in_effect(applied: Option<&HeaderRoute>, desired: &HeaderRoute) -> bool {
    if desired.matches.is_empty() {
        applied.is_none()
    } else {
        applied == Some(desired)
    }
}

fn mirror_route_in_effect(applied: Option<&MirrorRoute>, desired: &MirrorRoute) -> bool {
    if desired.matches.is_empty() {
        applied.is_none()
    } else {
        applied == Some(desired)
    }
}
