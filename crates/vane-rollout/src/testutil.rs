//! Builders and a small in-memory world for planner tests.

use std::collections::BTreeMap;

use vane_core::template_hash;
use vane_state::{
    AnalysisPhase, AnalysisTemplate, AnalysisTemplateSpec, BlueGreenStrategy, CanaryStep,
    CanaryStrategy, Container, Metric, ObjectMeta, POD_TEMPLATE_HASH_LABEL, PodTemplate,
    ReplicaSet, Rollout, RolloutAnalysis, RolloutSpec, RolloutStatus, RolloutStrategy, Service,
    ServiceSpec, TrafficRouting,
};
use vane_traffic::AppliedRouting;

use crate::plan::{Mutation, REQUEUE_NOW, ReconcilePlan, RolloutContext, plan};

pub fn pod_template(image: &str) -> PodTemplate {
    PodTemplate {
        labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
        containers: vec![Container {
            name: "app".to_string(),
            image: image.to_string(),
            ..Default::default()
        }],
    }
}

fn rollout(replicas: u32, strategy: RolloutStrategy) -> Rollout {
    let mut metadata = ObjectMeta::new("default", "web");
    metadata.uid = "uid-web".to_string();
    metadata.generation = 1;
    Rollout {
        metadata,
        spec: RolloutSpec {
            replicas,
            template: pod_template("web:v1"),
            strategy,
            paused: false,
            revision_history_limit: 10,
            progress_deadline_seconds: 600,
            progress_deadline_abort: true,
        },
        status: RolloutStatus::default(),
    }
}

pub fn canary_rollout(replicas: u32, steps: Vec<CanaryStep>) -> Rollout {
    rollout(
        replicas,
        RolloutStrategy::Canary(CanaryStrategy {
            steps,
            scale_down_delay_seconds: 30,
            ..Default::default()
        }),
    )
}

/// Canary routed through the `proxy` router with `web-stable`/`web-canary`.
pub fn routed_canary_rollout(replicas: u32, steps: Vec<CanaryStep>) -> Rollout {
    let mut rollout = canary_rollout(replicas, steps);
    if let RolloutStrategy::Canary(c) = &mut rollout.spec.strategy {
        c.traffic_routing = Some(TrafficRouting {
            router: "proxy".to_string(),
            config: serde_json::Value::Null,
        });
        c.stable_service = Some("web-stable".to_string());
        c.canary_service = Some("web-canary".to_string());
    }
    rollout
}

pub fn blue_green_rollout(replicas: u32, configure: impl FnOnce(&mut BlueGreenStrategy)) -> Rollout {
    let mut bg = BlueGreenStrategy {
        active_service: "web-active".to_string(),
        auto_promotion_enabled: true,
        scale_down_delay_seconds: 30,
        ..Default::default()
    };
    configure(&mut bg);
    rollout(replicas, RolloutStrategy::BlueGreen(bg))
}

pub fn analysis_ref(template: &str) -> RolloutAnalysis {
    RolloutAnalysis {
        templates: vec![template.to_string()],
        ..Default::default()
    }
}

pub fn template(name: &str) -> AnalysisTemplate {
    let mut metric = Metric::new(name, "job");
    metric.success_condition = Some("result == true".to_string());
    AnalysisTemplate {
        metadata: ObjectMeta::new("default", name),
        spec: AnalysisTemplateSpec {
            metrics: vec![metric],
            args: vec![],
        },
    }
}

pub fn service(name: &str, pod_hash: Option<&str>) -> Service {
    let mut selector = BTreeMap::from([("app".to_string(), "web".to_string())]);
    if let Some(hash) = pod_hash {
        selector.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
    }
    Service {
        metadata: ObjectMeta::new("default", name),
        spec: ServiceSpec { selector, port: None },
    }
}

/// Applies plans the way the controller would, with replica sets becoming
/// available immediately (while `ready`) and new analysis runs and
/// experiments finishing with `outcome`.
pub struct World {
    pub ctx: RolloutContext,
    pub ready: bool,
    pub outcome: Option<AnalysisPhase>,
    /// Every weight set on the router, in order.
    pub weights: Vec<u32>,
    /// Every mutation applied, in order.
    pub log: Vec<Mutation>,
}

impl World {
    pub fn new(rollout: Rollout, templates: Vec<AnalysisTemplate>, services: Vec<Service>) -> Self {
        let routed = rollout.spec.canary().is_some_and(|c| c.traffic_routing.is_some());
        Self {
            ctx: RolloutContext {
                rollout,
                replica_sets: vec![],
                analysis_runs: vec![],
                experiments: vec![],
                templates,
                services,
                applied: routed.then(AppliedRouting::default),
                now: 1_000,
            },
            ready: true,
            outcome: Some(AnalysisPhase::Successful),
            weights: vec![],
            log: vec![],
        }
    }

    pub fn desired_hash(&self) -> String {
        template_hash(&self.ctx.rollout.spec.template)
    }

    pub fn status(&self) -> &RolloutStatus {
        &self.ctx.rollout.status
    }

    pub fn rs(&self, pod_hash: &str) -> Option<&ReplicaSet> {
        self.ctx.replica_sets.iter().find(|rs| rs.pod_hash() == pod_hash)
    }

    pub fn selector(&self, service: &str) -> Option<&str> {
        self.ctx
            .services
            .iter()
            .find(|s| s.metadata.name == service)
            .and_then(Service::selected_hash)
    }

    pub fn set_image(&mut self, image: &str) {
        self.ctx.rollout.spec.template = pod_template(image);
        self.ctx.rollout.metadata.generation += 1;
    }

    pub fn advance(&mut self, secs: u64) {
        self.ctx.now += secs;
    }

    /// One pass: plan, apply the mutations, write status.
    pub fn step(&mut self) -> ReconcilePlan {
        let result = plan(&self.ctx);
        for mutation in &result.mutations {
            self.apply(mutation.clone());
        }
        self.ctx.rollout.status = result.status.clone();
        self.settle_children();
        result
    }

    /// Step until a pass changes nothing and asks for no immediate requeue.
    pub fn settle(&mut self) -> Vec<ReconcilePlan> {
        let mut plans = Vec::new();
        for _ in 0..50 {
            let result = self.step();
            let quiet = result.mutations.is_empty() && result.requeue_after != Some(REQUEUE_NOW);
            plans.push(result);
            if quiet {
                return plans;
            }
        }
        panic!("rollout did not settle: {:#?}", self.ctx.rollout.status);
    }

    fn apply(&mut self, mutation: Mutation) {
        let now = self.ctx.now;
        match &mutation {
            Mutation::CreateReplicaSet(rs) => {
                let mut rs = rs.clone();
                rs.metadata.created_at = now;
                rs.metadata.generation = 1;
                self.ctx.replica_sets.push(rs);
            }
            Mutation::ScaleReplicaSet { name, replicas } => {
                if let Some(rs) = self.rs_named(name) {
                    rs.spec.replicas = *replicas;
                    rs.metadata.generation += 1;
                }
            }
            Mutation::AnnotateReplicaSet { name, key, value } => {
                if let Some(rs) = self.rs_named(name) {
                    rs.metadata.annotations.insert(key.clone(), value.clone());
                }
            }
            Mutation::DeleteReplicaSet { name } => {
                self.ctx.replica_sets.retain(|rs| rs.metadata.name != *name);
            }
            Mutation::CreateAnalysisRun(run) => {
                let mut run = run.clone();
                run.metadata.created_at = now;
                self.ctx.analysis_runs.push(run);
            }
            Mutation::TerminateAnalysisRun { name } => {
                for run in self.ctx.analysis_runs.iter_mut().filter(|r| r.metadata.name == *name) {
                    run.spec.terminate = true;
                }
            }
            Mutation::CreateExperiment(exp) => {
                let mut exp = exp.clone();
                exp.metadata.created_at = now;
                self.ctx.experiments.push(exp);
            }
            Mutation::TerminateExperiment { name } => {
                for exp in self.ctx.experiments.iter_mut().filter(|e| e.metadata.name == *name) {
                    exp.spec.terminate = true;
                }
            }
            Mutation::SetServiceSelector { service, pod_hash } => {
                for svc in self.ctx.services.iter_mut().filter(|s| s.metadata.name == *service) {
                    svc.spec
                        .selector
                        .insert(POD_TEMPLATE_HASH_LABEL.to_string(), pod_hash.clone());
                }
            }
            Mutation::SetWeight(weight) => {
                self.weights.push(*weight);
                if let Some(applied) = &mut self.ctx.applied {
                    applied.canary_weight = *weight;
                }
            }
            Mutation::SetHeaderRoute(route) => {
                if let Some(applied) = &mut self.ctx.applied {
                    applied.header_routes.retain(|r| r.name != route.name);
                    if !route.matches.is_empty() {
                        applied.header_routes.push(route.clone());
                    }
                }
            }
            Mutation::SetMirrorRoute(route) => {
                if let Some(applied) = &mut self.ctx.applied {
                    applied.mirror_routes.retain(|r| r.name != route.name);
                    if !route.matches.is_empty() {
                        applied.mirror_routes.push(route.clone());
                    }
                }
            }
            Mutation::RemoveManagedRoutes => {
                if let Some(applied) = &mut self.ctx.applied {
                    applied.header_routes.clear();
                    applied.mirror_routes.clear();
                }
            }
        }
        self.log.push(mutation);
    }

    fn rs_named(&mut self, name: &str) -> Option<&mut ReplicaSet> {
        self.ctx.replica_sets.iter_mut().find(|rs| rs.metadata.name == name)
    }

    fn settle_children(&mut self) {
        if self.ready {
            for rs in &mut self.ctx.replica_sets {
                rs.status.replicas = rs.spec.replicas;
                rs.status.ready_replicas = rs.spec.replicas;
                rs.status.available_replicas = rs.spec.replicas;
                rs.status.observed_generation = rs.metadata.generation;
            }
        }
        if let Some(outcome) = self.outcome {
            for run in &mut self.ctx.analysis_runs {
                if !run.spec.terminate && run.status.phase == AnalysisPhase::Pending {
                    run.status.phase = outcome;
                }
            }
            for exp in &mut self.ctx.experiments {
                if !exp.spec.terminate && exp.status.phase == AnalysisPhase::Pending {
                    exp.status.phase = outcome;
                }
            }
        }
    }
}
