//! Analysis runs and experiments spawned by a rollout.
//!
//! Children are labelled with the revision they gate and the gate itself
//! (`step-2`, `background`, `pre-promotion`, `post-promotion`). A child
//! recorded in status is used first; otherwise a live child with matching
//! labels is adopted, which recovers from a crash between creating the
//! child and writing status. Terminated children are never adopted, so a
//! retried update starts fresh runs.

use std::collections::BTreeMap;

use tracing::info;

use vane_analysis::merge_templates;
use vane_state::{
    AnalysisArg, AnalysisPhase, AnalysisRun, AnalysisRunStatus, ArgValueFrom, Experiment,
    ExperimentAnalysisRef, ExperimentSpec, ExperimentStatus, ExperimentStep, ExperimentVariant,
    ObjectMeta, OwnerRef, POD_TEMPLATE_HASH_LABEL, ROLLOUT_LABEL, RevisionSelector,
    RolloutAnalysis, RunRef, SpecRef,
};

use crate::error::{PlanError, PlanResult};
use crate::plan::{Mutation, Planner};
use crate::validation::lookup_templates;

/// Label naming the gate a child belongs to.
pub const GATE_LABEL: &str = "rollout.vane.dev/gate";

pub const BACKGROUND_GATE: &str = "background";
pub const PRE_PROMOTION_GATE: &str = "pre-promotion";
pub const POST_PROMOTION_GATE: &str = "post-promotion";

pub fn step_gate(index: usize) -> String {
    format!("step-{index}")
}

/// Outcome of a gating child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Gate {
    Waiting,
    Passed,
    Inconclusive,
    Failed(String),
}

impl Gate {
    fn from_phase(kind: &str, name: &str, phase: AnalysisPhase, message: &str) -> Self {
        match phase {
            AnalysisPhase::Successful => Gate::Passed,
            AnalysisPhase::Inconclusive => Gate::Inconclusive,
            AnalysisPhase::Failed | AnalysisPhase::Error => {
                let mut reason = format!("{kind} {name} {phase}");
                if !message.is_empty() {
                    reason.push_str(": ");
                    reason.push_str(message);
                }
                Gate::Failed(reason)
            }
            AnalysisPhase::Pending | AnalysisPhase::Running => Gate::Waiting,
        }
    }
}

impl<'a> Planner<'a> {
    /// Drive the analysis run for `gate`, creating it when missing.
    /// Returns the reference to record in status and the gate outcome.
    pub(crate) fn analysis_gate(
        &mut self,
        reference: Option<RunRef>,
        analysis: &RolloutAnalysis,
        gate: &str,
    ) -> (Option<RunRef>, Gate) {
        if let Some(run) = self.live_run(reference.as_ref(), gate) {
            let phase = run.status.phase;
            let outcome = Gate::from_phase("analysis run", &run.metadata.name, phase, &run.status.message);
            return (
                Some(RunRef {
                    name: run.metadata.name.clone(),
                    phase,
                }),
                outcome,
            );
        }
        match self.build_run(analysis, gate) {
            Ok(run) => {
                let reference = RunRef {
                    name: run.metadata.name.clone(),
                    phase: AnalysisPhase::Pending,
                };
                info!(rollout = %self.key, run = %reference.name, gate, "creating analysis run");
                self.mutations.push(Mutation::CreateAnalysisRun(run));
                (Some(reference), Gate::Waiting)
            }
            Err(err) => (reference, Gate::Failed(format!("analysis for {gate}: {err}"))),
        }
    }

    /// Drive the experiment for canary step `index`.
    pub(crate) fn experiment_gate(
        &mut self,
        reference: Option<RunRef>,
        step: &ExperimentStep,
        index: usize,
    ) -> (Option<RunRef>, Gate) {
        let gate = step_gate(index);
        if let Some(exp) = self.live_experiment(reference.as_ref(), &gate) {
            let phase = exp.status.phase;
            let outcome = Gate::from_phase("experiment", &exp.metadata.name, phase, &exp.status.message);
            return (
                Some(RunRef {
                    name: exp.metadata.name.clone(),
                    phase,
                }),
                outcome,
            );
        }
        match self.build_experiment(step, &gate) {
            Ok(exp) => {
                let reference = RunRef {
                    name: exp.metadata.name.clone(),
                    phase: AnalysisPhase::Pending,
                };
                info!(rollout = %self.key, experiment = %reference.name, step = index, "creating experiment");
                self.mutations.push(Mutation::CreateExperiment(exp));
                (Some(reference), Gate::Waiting)
            }
            Err(err) => (reference, Gate::Failed(format!("experiment for {gate}: {err}"))),
        }
    }

    fn live_run(&self, reference: Option<&RunRef>, gate: &str) -> Option<&'a AnalysisRun> {
        let ctx = self.ctx;
        let runs = &ctx.analysis_runs;
        if let Some(reference) = reference
            && let Some(run) = runs
                .iter()
                .find(|r| r.metadata.name == reference.name && !r.spec.terminate)
        {
            return Some(run);
        }
        runs.iter()
            .filter(|r| !r.spec.terminate && self.gates(&r.metadata, gate))
            .max_by_key(|r| (r.metadata.created_at, r.metadata.name.clone()))
    }

    fn live_experiment(&self, reference: Option<&RunRef>, gate: &str) -> Option<&'a Experiment> {
        let ctx = self.ctx;
        let experiments = &ctx.experiments;
        if let Some(reference) = reference
            && let Some(exp) = experiments
                .iter()
                .find(|e| e.metadata.name == reference.name && !e.spec.terminate)
        {
            return Some(exp);
        }
        experiments
            .iter()
            .filter(|e| !e.spec.terminate && self.gates(&e.metadata, gate))
            .max_by_key(|e| (e.metadata.created_at, e.metadata.name.clone()))
    }

    fn gates(&self, meta: &ObjectMeta, gate: &str) -> bool {
        meta.labels.get(POD_TEMPLATE_HASH_LABEL) == Some(&self.desired_hash)
            && meta.labels.get(GATE_LABEL).map(String::as_str) == Some(gate)
    }

    /// Metadata for a child: owned by the rollout, labelled with the
    /// revision and gate, named `{rollout}-{hash}-{gate}` with a `.N`
    /// suffix when earlier attempts hold the plain name.
    fn child_meta(&self, gate: &str, taken: impl Fn(&str) -> bool) -> ObjectMeta {
        let rollout = &self.ctx.rollout;
        let base = format!("{}-{}-{}", rollout.metadata.name, self.desired_hash, gate);
        let mut name = base.clone();
        let mut attempt = 0;
        while taken(&name) {
            attempt += 1;
            name = format!("{base}.{attempt}");
        }

        let mut meta = ObjectMeta::new(&rollout.metadata.namespace, &name);
        meta.labels = BTreeMap::from([
            (ROLLOUT_LABEL.to_string(), rollout.metadata.name.clone()),
            (POD_TEMPLATE_HASH_LABEL.to_string(), self.desired_hash.clone()),
            (GATE_LABEL.to_string(), gate.to_string()),
        ]);
        meta.owner = Some(OwnerRef {
            kind: "Rollout".to_string(),
            name: rollout.metadata.name.clone(),
            uid: rollout.metadata.uid.clone(),
        });
        meta
    }

    fn build_run(&self, analysis: &RolloutAnalysis, gate: &str) -> PlanResult<AnalysisRun> {
        let ctx = self.ctx;
        let templates = lookup_templates(&analysis.templates, &ctx.templates)?;
        let mut spec = merge_templates(&templates, &analysis.args)?;
        for arg in &mut spec.args {
            self.resolve_value_from(arg);
        }
        let metadata = self.child_meta(gate, |name| {
            ctx.analysis_runs.iter().any(|r| r.metadata.name == name)
                || self.creates_run(name)
        });
        Ok(AnalysisRun {
            metadata,
            spec,
            status: AnalysisRunStatus::default(),
        })
    }

    fn creates_run(&self, name: &str) -> bool {
        self.mutations
            .iter()
            .any(|m| matches!(m, Mutation::CreateAnalysisRun(r) if r.metadata.name == name))
    }

    fn resolve_value_from(&self, arg: &mut AnalysisArg) {
        if arg.value.is_some() {
            return;
        }
        if let Some(ArgValueFrom::PodTemplateHash(selector)) = &arg.value_from {
            arg.value = match selector {
                RevisionSelector::Stable => self.status.stable_rs.clone(),
                RevisionSelector::Latest => Some(self.desired_hash.clone()),
            };
        }
    }

    fn build_experiment(&self, step: &ExperimentStep, gate: &str) -> PlanResult<Experiment> {
        let ctx = self.ctx;
        let rollout = &ctx.rollout;
        let mut variants = Vec::with_capacity(step.templates.len());
        for t in &step.templates {
            let (pod_hash, template) = match t.spec_ref {
                SpecRef::Canary => (self.desired_hash.clone(), rollout.spec.template.clone()),
                SpecRef::Stable => {
                    let stable = self
                        .status
                        .stable_rs
                        .as_deref()
                        .and_then(|hash| self.find_rs(hash))
                        .ok_or_else(|| PlanError::InvalidSpec("stable replica set not found".to_string()))?;
                    (stable.pod_hash().to_string(), stable.spec.template.clone())
                }
            };
            variants.push(ExperimentVariant {
                name: t.name.clone(),
                replicas: t.replicas,
                pod_template_hash: pod_hash,
                template,
            });
        }
        let analyses = step
            .analyses
            .iter()
            .map(|a| {
                let mut args = a.args.clone();
                for arg in &mut args {
                    self.resolve_value_from(arg);
                }
                ExperimentAnalysisRef {
                    name: a.name.clone(),
                    template_name: a.template_name.clone(),
                    args,
                }
            })
            .collect();

        let metadata = self.child_meta(gate, |name| ctx.experiments.iter().any(|e| e.metadata.name == name));
        Ok(Experiment {
            metadata,
            spec: ExperimentSpec {
                templates: variants,
                duration: step.duration.clone(),
                analyses,
                terminate: false,
            },
            status: ExperimentStatus::default(),
        })
    }
}
