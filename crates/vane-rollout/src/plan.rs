//! One reconcile pass of the rollout state machine.
//!
//! [`plan`] is a pure function from an observed object graph to the
//! mutations that move it toward the desired revision plus the status to
//! write afterwards. Every mutation is guarded by a desired-versus-observed
//! comparison, so planning an already converged graph yields no mutations
//! and the same status.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use vane_core::template_hash;
use vane_state::{
    AnalysisRun, AnalysisTemplate, BlueGreenStatus, CanaryStatus, ConditionType, Experiment,
    HeaderRoute, MirrorRoute, POD_TEMPLATE_HASH_LABEL, PROMOTED_AT_ANNOTATION, PauseCondition,
    PauseReason, REVISION_ANNOTATION, ReplicaSet, Rollout, RolloutPhase, RolloutStatus,
    RolloutStrategy, SCALE_DOWN_DEADLINE_ANNOTATION, Service,
};
use vane_traffic::AppliedRouting;

use crate::conditions::*;
use crate::replicaset::{max_revision, new_replica_set, revision, was_promoted};
use crate::validation::validate;

/// Requeue delay meaning "as soon as possible".
pub const REQUEUE_NOW: Duration = Duration::ZERO;

/// Everything one pass looks at. Children are those owned by the rollout;
/// templates and services are those of its namespace.
#[derive(Debug, Clone)]
pub struct RolloutContext {
    pub rollout: Rollout,
    pub replica_sets: Vec<ReplicaSet>,
    pub analysis_runs: Vec<AnalysisRun>,
    pub experiments: Vec<Experiment>,
    pub templates: Vec<AnalysisTemplate>,
    pub services: Vec<Service>,
    /// Routing reported by the rollout's traffic router, if it has one.
    pub applied: Option<AppliedRouting>,
    pub now: u64,
}

/// A change to the world. Object names are relative to the rollout's
/// namespace; traffic mutations target the rollout's configured router.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateReplicaSet(ReplicaSet),
    ScaleReplicaSet { name: String, replicas: u32 },
    AnnotateReplicaSet { name: String, key: String, value: String },
    DeleteReplicaSet { name: String },
    CreateAnalysisRun(AnalysisRun),
    TerminateAnalysisRun { name: String },
    CreateExperiment(Experiment),
    TerminateExperiment { name: String },
    SetServiceSelector { service: String, pod_hash: String },
    SetWeight(u32),
    SetHeaderRoute(HeaderRoute),
    SetMirrorRoute(MirrorRoute),
    RemoveManagedRoutes,
}

impl Mutation {
    /// Short label for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::CreateReplicaSet(_) => "create_replica_set",
            Mutation::ScaleReplicaSet { .. } => "scale_replica_set",
            Mutation::AnnotateReplicaSet { .. } => "annotate_replica_set",
            Mutation::DeleteReplicaSet { .. } => "delete_replica_set",
            Mutation::CreateAnalysisRun(_) => "create_analysis_run",
            Mutation::TerminateAnalysisRun { .. } => "terminate_analysis_run",
            Mutation::CreateExperiment(_) => "create_experiment",
            Mutation::TerminateExperiment { .. } => "terminate_experiment",
            Mutation::SetServiceSelector { .. } => "set_service_selector",
            Mutation::SetWeight(_) => "set_weight",
            Mutation::SetHeaderRoute(_) => "set_header_route",
            Mutation::SetMirrorRoute(_) => "set_mirror_route",
            Mutation::RemoveManagedRoutes => "remove_managed_routes",
        }
    }

    /// Whether the mutation goes to the traffic router rather than the store.
    pub fn is_traffic(&self) -> bool {
        matches!(
            self,
            Mutation::SetWeight(_)
                | Mutation::SetHeaderRoute(_)
                | Mutation::SetMirrorRoute(_)
                | Mutation::RemoveManagedRoutes
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    /// Applied in order before the status write.
    pub mutations: Vec<Mutation>,
    pub status: RolloutStatus,
    /// `None` when only an object change should trigger the next pass.
    pub requeue_after: Option<Duration>,
}

/// Plan one reconcile pass.
pub fn plan(ctx: &RolloutContext) -> ReconcilePlan {
    let mut planner = Planner::new(ctx);
    planner.run();
    planner.finish()
}

pub(crate) struct Planner<'a> {
    pub(crate) ctx: &'a RolloutContext,
    pub(crate) key: String,
    pub(crate) now: u64,
    pub(crate) status: RolloutStatus,
    pub(crate) mutations: Vec<Mutation>,
    pub(crate) requeue_after: Option<Duration>,
    pub(crate) desired_hash: String,
    /// Superseded replica sets kept at scale until the given time. Holds
    /// deadlines assigned during this pass as well as recorded ones.
    pub(crate) retain_until: BTreeMap<String, u64>,
    /// What the pass is blocked on while the new replica set comes up.
    pub(crate) waiting: Option<String>,
    pub(crate) deadline_exceeded: bool,
    /// Human-readable progress when not waiting on replicas.
    pub(crate) note: String,
    invalid: bool,
}

impl<'a> Planner<'a> {
    fn new(ctx: &'a RolloutContext) -> Self {
        Self {
            ctx,
            key: ctx.rollout.metadata.key(),
            now: ctx.now,
            status: ctx.rollout.status.clone(),
            mutations: Vec::new(),
            requeue_after: None,
            desired_hash: template_hash(&ctx.rollout.spec.template),
            retain_until: BTreeMap::new(),
            waiting: None,
            deadline_exceeded: false,
            note: String::new(),
            invalid: false,
        }
    }

    fn run(&mut self) {
        let ctx = self.ctx;
        if let Err(err) = validate(&ctx.rollout, &ctx.templates, &ctx.services) {
            warn!(rollout = %self.key, error = %err, "invalid rollout spec");
            let message = err.to_string();
            set_condition(
                &mut self.status,
                ConditionType::InvalidSpec,
                true,
                REASON_INVALID_SPEC,
                &message,
                self.now,
            );
            self.status.message = message;
            self.invalid = true;
            return;
        }
        remove_condition(&mut self.status, ConditionType::InvalidSpec);

        self.detect_revision_change();

        match self.status.stable_rs.clone() {
            None => {
                info!(rollout = %self.key, revision = %self.desired_hash, "initial revision becomes stable");
                self.status.stable_rs = Some(self.desired_hash.clone());
                self.reconcile_stable();
            }
            Some(stable) if stable == self.desired_hash => self.reconcile_stable(),
            Some(_) => match &ctx.rollout.spec.strategy {
                RolloutStrategy::Canary(canary) => self.reconcile_canary(canary),
                RolloutStrategy::BlueGreen(bg) => self.reconcile_blue_green(bg),
            },
        }

        self.terminate_stale_children();
        self.scale_down_superseded();
        self.prune_history();
    }

    fn detect_revision_change(&mut self) {
        if self.status.current_pod_hash.as_deref() == Some(self.desired_hash.as_str()) {
            return;
        }
        let superseded = self.status.current_pod_hash.take();
        self.status.current_pod_hash = Some(self.desired_hash.clone());
        self.reset_progress();
        if let Some(previous) = superseded {
            info!(rollout = %self.key, from = %previous, to = %self.desired_hash, "new revision detected");
            // Traffic shifted to the superseded canary goes back to stable.
            self.reset_traffic();
        }
    }

    /// Forget everything about the previous in-flight revision.
    pub(crate) fn reset_progress(&mut self) {
        let status = &mut self.status;
        status.current_step_index = None;
        status.current_step_hash = None;
        status.abort = false;
        status.aborted_at = None;
        status.promote_full = false;
        status.pause_conditions.clear();
        status.controller_pause = false;
        status.canary = CanaryStatus::default();
        status.blue_green = BlueGreenStatus {
            active_selector: status.stable_rs.clone(),
            preview_selector: status.blue_green.preview_selector.clone(),
            ..Default::default()
        };
    }

    /// Desired revision is stable: keep it at full scale and drop anything
    /// left over from an abandoned update.
    fn reconcile_stable(&mut self) {
        let ctx = self.ctx;
        let spec = &ctx.rollout.spec;
        let stable = self.desired_hash.clone();

        let leftover = self.status.current_step_index.is_some()
            || self.status.abort
            || self.status.canary != CanaryStatus::default()
            || self.status.blue_green.pre_promotion_analysis_run.is_some()
            || self.status.blue_green.post_promotion_analysis_run.is_some();
        if leftover {
            info!(rollout = %self.key, "in-flight update abandoned, desired revision is stable");
        }
        self.status.current_step_index = None;
        self.status.current_step_hash = None;
        self.status.abort = false;
        self.status.aborted_at = None;
        self.status.promote_full = false;
        self.status.pause_conditions.clear();
        self.status.controller_pause = false;
        self.status.canary = CanaryStatus::default();
        self.status.blue_green = BlueGreenStatus {
            active_selector: None,
            preview_selector: None,
            ..Default::default()
        };

        self.reset_traffic();

        let rs = self.ensure_replica_set(&stable, spec.replicas, true);
        if let Some(rs) = rs
            && !was_promoted(rs)
        {
            self.annotate(rs, PROMOTED_AT_ANNOTATION, self.now.to_string());
        }
        self.waiting = waiting_for(rs, &self.rs_name(&stable), spec.replicas);
        if let Some(waiting) = self.waiting.clone() {
            self.deadline_exceeded = self.progress_deadline_exceeded(&waiting);
        }

        match &spec.strategy {
            RolloutStrategy::Canary(canary) => {
                for service in [&canary.stable_service, &canary.canary_service].into_iter().flatten() {
                    self.set_selector(service, &stable);
                }
            }
            RolloutStrategy::BlueGreen(bg) => {
                self.set_selector(&bg.active_service, &stable);
                self.status.blue_green.active_selector = Some(stable.clone());
                if let Some(preview) = &bg.preview_service {
                    self.set_selector(preview, &stable);
                    self.status.blue_green.preview_selector = Some(stable.clone());
                }
            }
        }
    }

    // ── Shared helpers ─────────────────────────────────────────────

    pub(crate) fn requeue(&mut self, after: Duration) {
        self.requeue_after = Some(match self.requeue_after {
            Some(current) => current.min(after),
            None => after,
        });
    }

    pub(crate) fn requeue_at(&mut self, at: u64) {
        self.requeue(Duration::from_secs(at.saturating_sub(self.now)));
    }

    pub(crate) fn applied(&self) -> AppliedRouting {
        self.ctx.applied.clone().unwrap_or_default()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.ctx.rollout.spec.paused || !self.status.pause_conditions.is_empty()
    }

    pub(crate) fn rs_name(&self, pod_hash: &str) -> String {
        crate::replicaset::replica_set_name(&self.ctx.rollout.metadata.name, pod_hash)
    }

    pub(crate) fn find_rs(&self, pod_hash: &str) -> Option<&'a ReplicaSet> {
        let ctx = self.ctx;
        ctx.replica_sets.iter().find(|rs| rs.pod_hash() == pod_hash)
    }

    /// The desired revision is a retained, previously promoted replica set.
    pub(crate) fn is_rollback(&self) -> bool {
        self.status.stable_rs.as_deref() != Some(self.desired_hash.as_str())
            && self.find_rs(&self.desired_hash).is_some_and(was_promoted)
    }

    /// Create the replica set for `pod_hash` or scale it to `replicas`.
    /// Returns the observed replica set, `None` when it is being created.
    pub(crate) fn ensure_replica_set(
        &mut self,
        pod_hash: &str,
        replicas: u32,
        promoted: bool,
    ) -> Option<&'a ReplicaSet> {
        match self.find_rs(pod_hash) {
            Some(rs) => {
                self.scale(rs, replicas);
                Some(rs)
            }
            None => {
                let ctx = self.ctx;
                let next = max_revision(&ctx.replica_sets) + 1;
                let mut rs = new_replica_set(&ctx.rollout, pod_hash, replicas, next);
                if promoted {
                    rs.metadata
                        .annotations
                        .insert(PROMOTED_AT_ANNOTATION.to_string(), self.now.to_string());
                }
                info!(rollout = %self.key, replica_set = %rs.metadata.name, replicas, revision = next, "creating replica set");
                self.mutations.push(Mutation::CreateReplicaSet(rs));
                None
            }
        }
    }

    /// Give a reused replica set the newest revision number.
    pub(crate) fn bump_revision(&mut self, rs: &ReplicaSet) {
        let ctx = self.ctx;
        let newest = ctx
            .replica_sets
            .iter()
            .filter(|other| other.metadata.name != rs.metadata.name)
            .map(revision)
            .max()
            .unwrap_or(0);
        if revision(rs) <= newest {
            self.annotate(rs, REVISION_ANNOTATION, (newest + 1).to_string());
        }
    }

    pub(crate) fn scale(&mut self, rs: &ReplicaSet, replicas: u32) {
        if rs.spec.replicas == replicas {
            return;
        }
        info!(rollout = %self.key, replica_set = %rs.metadata.name, from = rs.spec.replicas, to = replicas, "scaling replica set");
        self.mutations.push(Mutation::ScaleReplicaSet {
            name: rs.metadata.name.clone(),
            replicas,
        });
    }

    pub(crate) fn annotate(&mut self, rs: &ReplicaSet, key: &str, value: String) {
        if rs.metadata.annotation(key) == Some(value.as_str()) {
            return;
        }
        self.mutations.push(Mutation::AnnotateReplicaSet {
            name: rs.metadata.name.clone(),
            key: key.to_string(),
            value,
        });
    }

    pub(crate) fn set_selector(&mut self, service: &str, pod_hash: &str) {
        let ctx = self.ctx;
        let Some(svc) = ctx.services.iter().find(|s| s.metadata.name == service) else {
            return;
        };
        if svc.selected_hash() == Some(pod_hash) {
            return;
        }
        info!(rollout = %self.key, service, revision = pod_hash, "switching service selector");
        self.mutations.push(Mutation::SetServiceSelector {
            service: service.to_string(),
            pod_hash: pod_hash.to_string(),
        });
    }

    /// Weight 0 and no managed routes, when the rollout routes traffic.
    pub(crate) fn reset_traffic(&mut self) {
        let routed = self
            .ctx
            .rollout
            .spec
            .canary()
            .is_some_and(|c| c.traffic_routing.is_some());
        if !routed {
            return;
        }
        let applied = self.applied();
        if applied.canary_weight != 0 && !self.mutations.contains(&Mutation::SetWeight(0)) {
            info!(rollout = %self.key, from = applied.canary_weight, "resetting canary weight to 0");
            self.mutations.push(Mutation::SetWeight(0));
        }
        let routes = !applied.header_routes.is_empty() || !applied.mirror_routes.is_empty();
        if routes && !self.mutations.contains(&Mutation::RemoveManagedRoutes) {
            self.mutations.push(Mutation::RemoveManagedRoutes);
        }
    }

    /// Hold on `reason` until cleared. `duration` (seconds) clears it
    /// automatically; a user promote clears it while leaving
    /// `controller_pause` set. Returns true once the pause is over.
    pub(crate) fn pause_gate(&mut self, reason: PauseReason, duration: Option<u64>) -> bool {
        match self.status.has_pause(reason).cloned() {
            Some(cond) => match duration {
                Some(d) if self.now >= cond.start_time.saturating_add(d) => {
                    debug!(rollout = %self.key, ?reason, "pause expired");
                    self.status.pause_conditions.retain(|p| p.reason != reason);
                    self.status.controller_pause = false;
                    true
                }
                Some(d) => {
                    self.requeue_at(cond.start_time.saturating_add(d));
                    false
                }
                None => false,
            },
            None if self.status.controller_pause => {
                debug!(rollout = %self.key, ?reason, "pause released by user");
                self.status.controller_pause = false;
                true
            }
            None => {
                info!(rollout = %self.key, ?reason, duration, "pausing rollout");
                self.status.pause_conditions.push(PauseCondition {
                    reason,
                    start_time: self.now,
                });
                self.status.controller_pause = true;
                if let Some(d) = duration {
                    self.requeue(Duration::from_secs(d));
                }
                false
            }
        }
    }

    pub(crate) fn abort(&mut self, message: String) {
        if self.status.abort {
            return;
        }
        warn!(rollout = %self.key, reason = %message, "aborting update");
        self.status.abort = true;
        self.status.aborted_at = Some(self.now);
        self.status.message = message;
    }

    /// True when the new replica set has made no progress within the
    /// deadline. `waiting` describes the current wait; any change in it
    /// counts as progress.
    pub(crate) fn progress_deadline_exceeded(&self, waiting: &str) -> bool {
        let Some(cond) = self.status.condition(ConditionType::Progressing) else {
            return false;
        };
        if cond.message != waiting {
            return false;
        }
        if cond.reason == REASON_PROGRESS_DEADLINE {
            return true;
        }
        cond.reason == REASON_REPLICA_SET_UPDATED
            && self.now
                >= cond
                    .last_update_time
                    .saturating_add(self.ctx.rollout.spec.progress_deadline_seconds)
    }

    /// Record the new replica set's state and apply the progress deadline.
    pub(crate) fn track_waiting(&mut self, waiting: Option<String>) {
        if let Some(w) = &waiting
            && !self.status.abort
            && !self.is_paused()
            && self.progress_deadline_exceeded(w)
        {
            self.deadline_exceeded = true;
            if self.ctx.rollout.spec.progress_deadline_abort {
                self.abort(format!("progress deadline exceeded: {w}"));
            }
        }
        self.waiting = waiting;
    }

    // ── Children ───────────────────────────────────────────────────

    /// Stop analysis and experiments that no longer gate anything.
    fn terminate_stale_children(&mut self) {
        let ctx = self.ctx;
        let in_flight = self.status.stable_rs.as_deref() != Some(self.desired_hash.as_str());
        let keep = |labels: &BTreeMap<String, String>, desired: &str| {
            in_flight && labels.get(POD_TEMPLATE_HASH_LABEL).map(String::as_str) == Some(desired)
        };
        for run in &ctx.analysis_runs {
            if run.spec.terminate
                || run.status.phase.is_terminal()
                || keep(&run.metadata.labels, &self.desired_hash)
            {
                continue;
            }
            self.terminate_run(&run.metadata.name);
        }
        for exp in &ctx.experiments {
            if exp.spec.terminate
                || exp.status.phase.is_terminal()
                || keep(&exp.metadata.labels, &self.desired_hash)
            {
                continue;
            }
            self.terminate_experiment(&exp.metadata.name);
        }
    }

    pub(crate) fn terminate_run(&mut self, name: &str) {
        let mutation = Mutation::TerminateAnalysisRun {
            name: name.to_string(),
        };
        if !self.mutations.contains(&mutation) {
            debug!(rollout = %self.key, run = name, "terminating analysis run");
            self.mutations.push(mutation);
        }
    }

    pub(crate) fn terminate_experiment(&mut self, name: &str) {
        let mutation = Mutation::TerminateExperiment {
            name: name.to_string(),
        };
        if !self.mutations.contains(&mutation) {
            debug!(rollout = %self.key, experiment = name, "terminating experiment");
            self.mutations.push(mutation);
        }
    }

    /// Terminate every analysis run and experiment of the desired revision.
    pub(crate) fn terminate_revision_children(&mut self, include_terminal: bool) {
        let ctx = self.ctx;
        let desired = self.desired_hash.clone();
        let of_revision =
            |labels: &BTreeMap<String, String>| labels.get(POD_TEMPLATE_HASH_LABEL) == Some(&desired);
        for run in &ctx.analysis_runs {
            if !run.spec.terminate
                && of_revision(&run.metadata.labels)
                && (include_terminal || !run.status.phase.is_terminal())
            {
                self.terminate_run(&run.metadata.name);
            }
        }
        for exp in &ctx.experiments {
            if !exp.spec.terminate
                && of_revision(&exp.metadata.labels)
                && (include_terminal || !exp.status.phase.is_terminal())
            {
                self.terminate_experiment(&exp.metadata.name);
            }
        }
    }

    /// Scale superseded replica sets to zero once their deadline passes.
    fn scale_down_superseded(&mut self) {
        let ctx = self.ctx;
        for rs in &ctx.replica_sets {
            let hash = rs.pod_hash();
            if Some(hash) == self.status.stable_rs.as_deref() || hash == self.desired_hash {
                continue;
            }
            if rs.spec.replicas == 0 {
                continue;
            }
            let deadline = self
                .retain_until
                .get(&rs.metadata.name)
                .copied()
                .or_else(|| rs.metadata.annotation_u64(SCALE_DOWN_DEADLINE_ANNOTATION));
            match deadline {
                Some(deadline) if self.now < deadline => self.requeue_at(deadline),
                _ => self.scale(rs, 0),
            }
        }
    }

    /// Delete scaled-down replica sets beyond the revision history limit,
    /// oldest first.
    fn prune_history(&mut self) {
        let ctx = self.ctx;
        let mut idle: Vec<&ReplicaSet> = ctx
            .replica_sets
            .iter()
            .filter(|rs| {
                let hash = rs.pod_hash();
                Some(hash) != self.status.stable_rs.as_deref()
                    && hash != self.desired_hash
                    && rs.spec.replicas == 0
            })
            .collect();
        let limit = ctx.rollout.spec.revision_history_limit as usize;
        if idle.len() <= limit {
            return;
        }
        idle.sort_by_key(|rs| (revision(rs), rs.metadata.created_at));
        let excess = idle.len() - limit;
        for rs in idle.into_iter().take(excess) {
            info!(rollout = %self.key, replica_set = %rs.metadata.name, "deleting old replica set");
            self.mutations.push(Mutation::DeleteReplicaSet {
                name: rs.metadata.name.clone(),
            });
        }
    }

    // ── Status ─────────────────────────────────────────────────────

    fn finish(mut self) -> ReconcilePlan {
        let ctx = self.ctx;
        let spec = &ctx.rollout.spec;
        self.status.observed_generation = ctx.rollout.metadata.generation;

        if self.invalid {
            self.status.phase = RolloutPhase::Degraded;
            return ReconcilePlan {
                mutations: Vec::new(),
                status: self.status,
                requeue_after: None,
            };
        }

        self.update_counters();

        let completed = self.status.stable_rs.as_deref() == Some(self.desired_hash.as_str());
        let stable_available = self
            .status
            .stable_rs
            .as_deref()
            .and_then(|hash| self.find_rs(hash))
            .is_some_and(|rs| rs.spec.replicas >= spec.replicas && rs.is_fully_available());
        let paused = self.is_paused();
        let now = self.now;

        let (phase, message) = if self.status.abort {
            let message = if self.status.message.is_empty() {
                "rollout aborted".to_string()
            } else {
                self.status.message.clone()
            };
            let reason = if self.deadline_exceeded
                || has_reason(&self.status, ConditionType::Progressing, REASON_PROGRESS_DEADLINE)
            {
                REASON_PROGRESS_DEADLINE
            } else {
                REASON_ABORTED
            };
            set_condition(&mut self.status, ConditionType::Progressing, false, reason, &message, now);
            (RolloutPhase::Degraded, message)
        } else if self.deadline_exceeded {
            let waiting = self.waiting.clone().unwrap_or_default();
            set_condition(
                &mut self.status,
                ConditionType::Progressing,
                false,
                REASON_PROGRESS_DEADLINE,
                &waiting,
                now,
            );
            (RolloutPhase::Degraded, format!("progress deadline exceeded: {waiting}"))
        } else if paused {
            set_condition(&mut self.status, ConditionType::Progressing, true, REASON_PAUSED, "", now);
            (RolloutPhase::Paused, self.pause_message())
        } else if completed && stable_available {
            set_condition(
                &mut self.status,
                ConditionType::Progressing,
                true,
                REASON_NEW_RS_AVAILABLE,
                "",
                now,
            );
            (RolloutPhase::Healthy, String::new())
        } else if let Some(waiting) = self.waiting.clone() {
            set_condition(
                &mut self.status,
                ConditionType::Progressing,
                true,
                REASON_REPLICA_SET_UPDATED,
                &waiting,
                now,
            );
            if let Some(cond) = self.status.condition(ConditionType::Progressing) {
                let deadline = cond.last_update_time.saturating_add(spec.progress_deadline_seconds);
                self.requeue_at(deadline);
            }
            (RolloutPhase::Progressing, waiting)
        } else {
            let note = self.note.clone();
            set_condition(
                &mut self.status,
                ConditionType::Progressing,
                true,
                REASON_ROLLOUT_PROGRESSING,
                &note,
                now,
            );
            (RolloutPhase::Progressing, note)
        };

        if phase != self.status.phase {
            info!(rollout = %self.key, from = %self.status.phase, to = %phase, "rollout phase changed");
        }
        self.status.phase = phase;
        self.status.message = message;

        if paused {
            let message = self.pause_message();
            set_condition(&mut self.status, ConditionType::Paused, true, REASON_PAUSED, &message, now);
        } else if self.status.condition(ConditionType::Paused).is_some() {
            set_condition(&mut self.status, ConditionType::Paused, false, REASON_RESUMED, "", now);
        }

        let available = self.status.available_replicas >= spec.replicas;
        let (reason, message) = if available {
            (REASON_AVAILABLE, String::new())
        } else {
            (
                REASON_UNAVAILABLE,
                format!("{}/{} replicas available", self.status.available_replicas, spec.replicas),
            )
        };
        set_condition(&mut self.status, ConditionType::Available, available, reason, &message, now);

        let reason = if completed {
            REASON_COMPLETED
        } else {
            REASON_IN_PROGRESS
        };
        set_condition(&mut self.status, ConditionType::Completed, completed, reason, "", now);

        let healthy = phase == RolloutPhase::Healthy;
        let reason = if healthy { REASON_HEALTHY } else { REASON_UNHEALTHY };
        set_condition(&mut self.status, ConditionType::Healthy, healthy, reason, "", now);

        ReconcilePlan {
            mutations: self.mutations,
            status: self.status,
            requeue_after: self.requeue_after,
        }
    }

    fn pause_message(&self) -> String {
        if self.ctx.rollout.spec.paused {
            return "paused by user".to_string();
        }
        let reasons: Vec<String> = self
            .status
            .pause_conditions
            .iter()
            .map(|p| format!("{:?}", p.reason))
            .collect();
        format!("paused: {}", reasons.join(", "))
    }

    fn update_counters(&mut self) {
        let ctx = self.ctx;
        let status = &mut self.status;
        status.replicas = ctx.replica_sets.iter().map(|rs| rs.status.replicas).sum();
        status.ready_replicas = ctx.replica_sets.iter().map(|rs| rs.status.ready_replicas).sum();
        status.available_replicas = ctx.replica_sets.iter().map(|rs| rs.available()).sum();
        status.updated_replicas = ctx
            .replica_sets
            .iter()
            .find(|rs| rs.pod_hash() == self.desired_hash)
            .map(|rs| rs.status.replicas)
            .unwrap_or(0);
    }
}

/// Description of the wait for `rs` to reach `want` available replicas,
/// `None` when it already has.
pub(crate) fn waiting_for(rs: Option<&ReplicaSet>, name: &str, want: u32) -> Option<String> {
    match rs {
        Some(rs) if rs.spec.replicas == want && rs.is_fully_available() => None,
        Some(rs) => Some(format!(
            "waiting for replica set {name}: {}/{want} available",
            rs.available().min(want)
        )),
        None => Some(format!("waiting for replica set {name}: 0/{want} available")),
    }
}
