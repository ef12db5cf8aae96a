//! Blue-green strategy: bring the new revision up behind the preview
//! service, gate it, then switch the active service in one step.

use tracing::{debug, info};

use vane_state::{BlueGreenStatus, BlueGreenStrategy, PauseReason, ReplicaSet};

use crate::children::{Gate, POST_PROMOTION_GATE, PRE_PROMOTION_GATE};
use crate::plan::{Planner, REQUEUE_NOW, waiting_for};

impl<'a> Planner<'a> {
    pub(crate) fn reconcile_blue_green(&mut self, bg: &'a BlueGreenStrategy) {
        let ctx = self.ctx;
        let spec = &ctx.rollout.spec;
        let desired = self.desired_hash.clone();
        let stable = self.status.stable_rs.clone().unwrap_or_default();
        let skip = self.status.promote_full || self.is_rollback();

        let new_rs = self.find_rs(&desired);
        let want = self.preview_target(bg, skip);
        self.track_waiting(waiting_for(new_rs, &self.rs_name(&desired), want));

        if !self.status.abort && self.waiting.is_none() && !self.switched() && !spec.paused {
            self.pre_promotion(bg, new_rs, skip);
        }
        if !self.status.abort && self.switched() && !spec.paused {
            self.post_promotion(bg, new_rs, skip);
        }
        if self.status.abort {
            self.abort_blue_green(bg);
            return;
        }
        if self.status.stable_rs.as_deref() == Some(desired.as_str()) {
            // Promoted this pass; the superseded stable keeps serving until
            // its scale-down deadline.
            self.set_selector(&bg.active_service, &desired);
            if let Some(preview) = &bg.preview_service {
                self.set_selector(preview, &desired);
            }
            return;
        }

        let preview_count = self.preview_target(bg, skip);
        if let Some(rs) = self.ensure_replica_set(&desired, preview_count, false) {
            self.bump_revision(rs);
        }
        if let Some(rs) = self.find_rs(&stable) {
            self.scale(rs, spec.replicas);
        }
        if let Some(preview) = &bg.preview_service {
            self.set_selector(preview, &desired);
            self.status.blue_green.preview_selector = Some(desired.clone());
        }
        let active = self
            .status
            .blue_green
            .active_selector
            .clone()
            .unwrap_or_else(|| stable.clone());
        self.set_selector(&bg.active_service, &active);
        self.status.blue_green.active_selector = Some(active);

        if self.note.is_empty() {
            self.note = if self.switched() {
                "active service switched, awaiting promotion".to_string()
            } else {
                "preview revision awaiting promotion".to_string()
            };
        }
    }

    fn switched(&self) -> bool {
        self.status.blue_green.active_selector.as_deref() == Some(self.desired_hash.as_str())
    }

    /// Preview replica count: reduced until promotion is approved.
    fn preview_target(&self, bg: &BlueGreenStrategy, skip: bool) -> u32 {
        let replicas = self.ctx.rollout.spec.replicas;
        if skip || self.switched() || self.status.blue_green.scale_up_preview_check_point {
            replicas
        } else {
            bg.preview_replica_count.unwrap_or(replicas).min(replicas)
        }
    }

    fn pre_promotion(&mut self, bg: &BlueGreenStrategy, new_rs: Option<&ReplicaSet>, skip: bool) {
        if !skip && !self.status.blue_green.scale_up_preview_check_point {
            if !self.pre_promotion_gates(bg) {
                return;
            }
            info!(rollout = %self.key, revision = %self.desired_hash, "preview approved for promotion");
            self.status.blue_green.scale_up_preview_check_point = true;
        }

        let replicas = self.ctx.rollout.spec.replicas;
        let at_full = new_rs.is_some_and(|rs| rs.spec.replicas == replicas && rs.is_fully_available());
        if !at_full {
            debug!(rollout = %self.key, "scaling preview to full before switching");
            self.note = "scaling preview to full size".to_string();
            return;
        }

        info!(rollout = %self.key, service = %bg.active_service, revision = %self.desired_hash, "switching active service to preview");
        self.status.blue_green.active_selector = Some(self.desired_hash.clone());
        self.requeue(REQUEUE_NOW);
    }

    /// Pre-promotion analysis, manual approval and the auto-promotion
    /// delay. True once promotion may proceed; a user promote while any of
    /// them holds counts as approval.
    fn pre_promotion_gates(&mut self, bg: &BlueGreenStrategy) -> bool {
        let ready_at = *self.status.blue_green.preview_ready_at.get_or_insert(self.now);

        if let Some(analysis) = &bg.pre_promotion_analysis {
            let reference = self.status.blue_green.pre_promotion_analysis_run.clone();
            let (reference, gate) = self.analysis_gate(reference, analysis, PRE_PROMOTION_GATE);
            self.status.blue_green.pre_promotion_analysis_run = reference;
            match gate {
                Gate::Passed => {}
                Gate::Waiting => {
                    self.note = "waiting for pre-promotion analysis".to_string();
                    return false;
                }
                Gate::Inconclusive => return self.pause_gate(PauseReason::InconclusiveAnalysis, None),
                Gate::Failed(reason) => {
                    self.abort(reason);
                    return false;
                }
            }
        }

        if !bg.auto_promotion_enabled {
            return self.pause_gate(PauseReason::BlueGreenPause, None);
        }
        if let Some(delay) = bg.auto_promotion_seconds {
            let at = ready_at.saturating_add(delay);
            if self.now < at {
                self.note = format!("auto-promotion in {}s", at - self.now);
                self.requeue_at(at);
                return false;
            }
        }
        true
    }

    fn post_promotion(&mut self, bg: &BlueGreenStrategy, new_rs: Option<&'a ReplicaSet>, skip: bool) {
        if !skip && let Some(analysis) = &bg.post_promotion_analysis {
            let reference = self.status.blue_green.post_promotion_analysis_run.clone();
            let (reference, gate) = self.analysis_gate(reference, analysis, POST_PROMOTION_GATE);
            self.status.blue_green.post_promotion_analysis_run = reference;
            match gate {
                Gate::Passed => {}
                Gate::Waiting => {
                    self.note = "waiting for post-promotion analysis".to_string();
                    return;
                }
                Gate::Inconclusive => {
                    if !self.pause_gate(PauseReason::InconclusiveAnalysis, None) {
                        return;
                    }
                }
                Gate::Failed(reason) => {
                    self.abort(reason);
                    return;
                }
            }
        }

        let replicas = self.ctx.rollout.spec.replicas;
        let Some(rs) = new_rs.filter(|rs| rs.spec.replicas == replicas && rs.is_fully_available())
        else {
            return;
        };
        self.finalize_promotion(rs);
        self.status.blue_green = BlueGreenStatus {
            active_selector: Some(self.desired_hash.clone()),
            preview_selector: bg.preview_service.as_ref().map(|_| self.desired_hash.clone()),
            ..Default::default()
        };
    }

    /// Point both services back at stable and scale the preview away.
    fn abort_blue_green(&mut self, bg: &BlueGreenStrategy) {
        let ctx = self.ctx;
        let spec = &ctx.rollout.spec;
        let stable = self.status.stable_rs.clone().unwrap_or_default();

        self.terminate_revision_children(true);
        if let Some(rs) = self.find_rs(&self.desired_hash) {
            self.scale(rs, 0);
        }
        if let Some(rs) = self.find_rs(&stable) {
            self.scale(rs, spec.replicas);
        }
        self.set_selector(&bg.active_service, &stable);
        self.status.blue_green.active_selector = Some(stable.clone());
        if let Some(preview) = &bg.preview_service {
            self.set_selector(preview, &stable);
            self.status.blue_green.preview_selector = Some(stable);
        }
        self.status.pause_conditions.clear();
        self.status.controller_pause = false;
        self.waiting = None;
    }
}

#[cfg(test)]
mod tests {
    use crate::actions;
    use crate::children::GATE_LABEL;
    use crate::testutil::*;
    use vane_state::{AnalysisPhase, BlueGreenStrategy, PauseReason, RolloutPhase};

    fn deployed(configure: impl FnOnce(&mut BlueGreenStrategy)) -> World {
        let rollout = blue_green_rollout(3, |bg| {
            bg.preview_service = Some("web-preview".to_string());
            configure(bg);
        });
        let mut world = World::new(
            rollout,
            vec![template("smoke")],
            vec![service("web-active", None), service("web-preview", None)],
        );
        world.settle();
        assert_eq!(world.status().phase, RolloutPhase::Healthy);
        world
    }

    #[test]
    fn switches_after_pre_promotion_and_retains_old_stable() {
        let mut world = deployed(|bg| bg.pre_promotion_analysis = Some(analysis_ref("smoke")));
        let v1 = world.desired_hash();
        world.set_image("web:v2");
        let v2 = world.desired_hash();

        world.settle();
        let status = world.status();
        assert_eq!(status.phase, RolloutPhase::Healthy);
        assert_eq!(status.stable_rs.as_deref(), Some(v2.as_str()));
        assert_eq!(world.selector("web-active"), Some(v2.as_str()));
        assert_eq!(world.selector("web-preview"), Some(v2.as_str()));
        assert_eq!(world.ctx.analysis_runs.len(), 1);
        assert_eq!(world.ctx.analysis_runs[0].metadata.labels[GATE_LABEL], "pre-promotion");

        assert_eq!(world.rs(&v1).unwrap().spec.replicas, 3);
        world.advance(29);
        world.settle();
        assert_eq!(world.rs(&v1).unwrap().spec.replicas, 3);
        world.advance(1);
        world.settle();
        assert_eq!(world.rs(&v1).unwrap().spec.replicas, 0);
    }

    #[test]
    fn manual_approval_with_reduced_preview() {
        let mut world = deployed(|bg| {
            bg.auto_promotion_enabled = false;
            bg.preview_replica_count = Some(1);
        });
        let v1 = world.desired_hash();
        world.set_image("web:v2");
        let v2 = world.desired_hash();

        world.settle();
        let status = world.status();
        assert_eq!(status.phase, RolloutPhase::Paused);
        assert!(status.has_pause(PauseReason::BlueGreenPause).is_some());
        assert_eq!(world.selector("web-active"), Some(v1.as_str()));
        assert_eq!(world.selector("web-preview"), Some(v2.as_str()));
        assert_eq!(world.rs(&v2).unwrap().spec.replicas, 1);

        actions::promote(&mut world.ctx.rollout, false).unwrap();
        world.settle();
        assert_eq!(world.status().phase, RolloutPhase::Healthy);
        assert_eq!(world.selector("web-active"), Some(v2.as_str()));
        assert_eq!(world.rs(&v2).unwrap().spec.replicas, 3);
    }

    #[test]
    fn auto_promotion_waits_for_delay() {
        let mut world = deployed(|bg| bg.auto_promotion_seconds = Some(60));
        let v1 = world.desired_hash();
        world.set_image("web:v2");
        let v2 = world.desired_hash();

        let plans = world.settle();
        assert_eq!(world.selector("web-active"), Some(v1.as_str()));
        assert!(plans.last().unwrap().requeue_after.is_some());

        world.advance(60);
        world.settle();
        assert_eq!(world.selector("web-active"), Some(v2.as_str()));
        assert_eq!(world.status().phase, RolloutPhase::Healthy);
    }

    #[test]
    fn failed_pre_promotion_analysis_keeps_active_on_stable() {
        let mut world = deployed(|bg| bg.pre_promotion_analysis = Some(analysis_ref("smoke")));
        let v1 = world.desired_hash();
        world.outcome = Some(AnalysisPhase::Failed);
        world.set_image("web:v2");
        let v2 = world.desired_hash();

        world.settle();
        let status = world.status();
        assert_eq!(status.phase, RolloutPhase::Degraded);
        assert!(status.abort);
        assert_eq!(status.stable_rs.as_deref(), Some(v1.as_str()));
        assert_eq!(world.selector("web-active"), Some(v1.as_str()));
        assert_eq!(world.selector("web-preview"), Some(v1.as_str()));
        assert_eq!(world.rs(&v2).unwrap().spec.replicas, 0);
        assert_eq!(world.rs(&v1).unwrap().spec.replicas, 3);
    }
}
