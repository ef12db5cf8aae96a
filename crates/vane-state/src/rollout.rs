//! The Rollout object: desired strategy plus the controller-owned status.
//!
//! Everything the controller needs to resume a rollout after a restart lives
//! in `RolloutStatus`; there is no other durable controller state.

use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisArg, AnalysisPhase};
use crate::meta::ObjectMeta;
use crate::workload::PodTemplate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub metadata: ObjectMeta,
    pub spec: RolloutSpec,
    #[serde(default)]
    pub status: RolloutStatus,
}

// ── Spec ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpec {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    pub template: PodTemplate,
    pub strategy: RolloutStrategy,
    /// Pause the rollout (user action).
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "default_history_limit")]
    pub revision_history_limit: u32,
    #[serde(default = "default_progress_deadline")]
    pub progress_deadline_seconds: u64,
    #[serde(default = "default_true")]
    pub progress_deadline_abort: bool,
}

fn default_replicas() -> u32 {
    1
}

fn default_history_limit() -> u32 {
    10
}

fn default_progress_deadline() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_scale_down_delay() -> u64 {
    30
}

fn default_mirror_percentage() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutStrategy {
    Canary(CanaryStrategy),
    BlueGreen(BlueGreenStrategy),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStrategy {
    #[serde(default)]
    pub steps: Vec<CanaryStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_routing: Option<TrafficRouting>,
    /// Background analysis running alongside the steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<RolloutAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_service: Option<String>,
    #[serde(default = "default_scale_down_delay")]
    pub scale_down_delay_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRouting {
    /// Registered traffic router name.
    pub router: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutAnalysis {
    pub templates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<AnalysisArg>,
    /// Background analysis only: first step index at which it runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CanaryStep {
    SetWeight(u32),
    Pause(PauseStep),
    Analysis(RolloutAnalysis),
    Experiment(ExperimentStep),
    SetCanaryScale(SetCanaryScale),
    SetHeaderRoute(HeaderRoute),
    SetMirrorRoute(MirrorRoute),
}

impl CanaryStep {
    pub fn name(&self) -> &'static str {
        match self {
            CanaryStep::SetWeight(_) => "setWeight",
            CanaryStep::Pause(_) => "pause",
            CanaryStep::Analysis(_) => "analysis",
            CanaryStep::Experiment(_) => "experiment",
            CanaryStep::SetCanaryScale(_) => "setCanaryScale",
            CanaryStep::SetHeaderRoute(_) => "setHeaderRoute",
            CanaryStep::SetMirrorRoute(_) => "setMirrorRoute",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseStep {
    /// Absent means pause until the user promotes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    pub templates: Vec<ExperimentTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub analyses: Vec<ExperimentStepAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentTemplate {
    pub name: String,
    pub spec_ref: SpecRef,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpecRef {
    Stable,
    Canary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStepAnalysis {
    pub name: String,
    pub template_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<AnalysisArg>,
}

/// Override the canary replica count independently of traffic weight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCanaryScale {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub match_traffic_weight: bool,
}

/// Route requests matching all headers to the canary. No matches removes
/// the route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRoute {
    pub name: String,
    #[serde(default)]
    pub matches: Vec<HeaderMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatch {
    pub header_name: String,
    pub value: String,
    #[serde(default)]
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    #[default]
    Exact,
    Prefix,
}

/// Mirror a percentage of matching requests to the canary. No matches
/// removes the route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorRoute {
    pub name: String,
    #[serde(default = "default_mirror_percentage")]
    pub percentage: u32,
    #[serde(default)]
    pub matches: Vec<RequestMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenStrategy {
    pub active_service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_service: Option<String>,
    #[serde(default = "default_true")]
    pub auto_promotion_enabled: bool,
    /// Delay automatic promotion until the preview has been ready this long.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_promotion_seconds: Option<u64>,
    /// Replicas for the preview before promotion; full scale when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_replica_count: Option<u32>,
    #[serde(default = "default_scale_down_delay")]
    pub scale_down_delay_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_promotion_analysis: Option<RolloutAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_promotion_analysis: Option<RolloutAnalysis>,
}

impl RolloutSpec {
    pub fn canary(&self) -> Option<&CanaryStrategy> {
        match &self.strategy {
            RolloutStrategy::Canary(c) => Some(c),
            RolloutStrategy::BlueGreen(_) => None,
        }
    }

    pub fn blue_green(&self) -> Option<&BlueGreenStrategy> {
        match &self.strategy {
            RolloutStrategy::BlueGreen(b) => Some(b),
            RolloutStrategy::Canary(_) => None,
        }
    }

    pub fn scale_down_delay_seconds(&self) -> u64 {
        match &self.strategy {
            RolloutStrategy::Canary(c) => c.scale_down_delay_seconds,
            RolloutStrategy::BlueGreen(b) => b.scale_down_delay_seconds,
        }
    }
}

// ── Status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutPhase {
    #[default]
    Progressing,
    Paused,
    Degraded,
    Healthy,
}

impl RolloutPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloutPhase::Progressing => "Progressing",
            RolloutPhase::Paused => "Paused",
            RolloutPhase::Degraded => "Degraded",
            RolloutPhase::Healthy => "Healthy",
        }
    }
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default)]
    pub phase: RolloutPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Pod template hash of the desired revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_pod_hash: Option<String>,
    /// Pod template hash of the last fully promoted revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_rs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<usize>,
    /// Hash of the step list the index refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pause_conditions: Vec<PauseCondition>,
    /// Set while the controller holds the rollout paused; cleared pause
    /// conditions with this flag still set mean the user resumed.
    #[serde(default)]
    pub controller_pause: bool,
    #[serde(default)]
    pub abort: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<u64>,
    /// Skip remaining steps and analysis (user promote --full).
    #[serde(default)]
    pub promote_full: bool,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub updated_replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub available_replicas: u32,
    #[serde(default)]
    pub canary: CanaryStatus,
    #[serde(default)]
    pub blue_green: BlueGreenStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RolloutStatus {
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn has_pause(&self, reason: PauseReason) -> Option<&PauseCondition> {
        self.pause_conditions.iter().find(|p| p.reason == reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_analysis_run: Option<RunRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_background_analysis_run: Option<RunRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_experiment: Option<RunRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<TrafficWeights>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_promotion_analysis_run: Option<RunRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_promotion_analysis_run: Option<RunRef>,
    /// Preview reached full availability at this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_ready_at: Option<u64>,
    /// Preview replica count was raised to full scale ahead of promotion.
    #[serde(default)]
    pub scale_up_preview_check_point: bool,
}

/// Name and last observed phase of a child analysis run or experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRef {
    pub name: String,
    pub phase: AnalysisPhase,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficWeights {
    pub canary: u32,
    pub stable: u32,
    /// `None` for routers that apply synchronously.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    CanaryPauseStep,
    BlueGreenPause,
    InconclusiveAnalysis,
    InconclusiveExperiment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseCondition {
    pub reason: PauseReason,
    pub start_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Progressing,
    Available,
    Paused,
    Completed,
    Healthy,
    InvalidSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: u64,
    pub last_update_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_rollout_from_json() {
        let json = r#"{
            "metadata": {"name": "web", "namespace": "prod"},
            "spec": {
                "replicas": 5,
                "template": {"containers": [{"name": "app", "image": "web:v2"}]},
                "strategy": {"canary": {
                    "steps": [
                        {"setWeight": 20},
                        {"pause": {"duration": "30s"}},
                        {"pause": {}},
                        {"analysis": {"templates": ["success-rate"]}},
                        {"setCanaryScale": {"replicas": 2}},
                        {"setHeaderRoute": {"name": "beta", "matches": [{"headerName": "x-beta", "value": "1"}]}}
                    ],
                    "trafficRouting": {"router": "proxy"}
                }}
            }
        }"#;
        let rollout: Rollout = serde_json::from_str(json).unwrap();
        assert_eq!(rollout.spec.replicas, 5);
        assert_eq!(rollout.spec.revision_history_limit, 10);
        assert!(rollout.spec.progress_deadline_abort);

        let canary = rollout.spec.canary().unwrap();
        assert_eq!(canary.steps.len(), 6);
        assert_eq!(canary.steps[0], CanaryStep::SetWeight(20));
        assert_eq!(
            canary.steps[1],
            CanaryStep::Pause(PauseStep {
                duration: Some("30s".to_string())
            })
        );
        assert_eq!(canary.steps[2], CanaryStep::Pause(PauseStep::default()));
        assert_eq!(canary.scale_down_delay_seconds, 30);
        assert_eq!(rollout.status.phase, RolloutPhase::Progressing);
    }

    #[test]
    fn blue_green_defaults() {
        let json = r#"{"activeService": "web-active"}"#;
        let bg: BlueGreenStrategy = serde_json::from_str(json).unwrap();
        assert!(bg.auto_promotion_enabled);
        assert_eq!(bg.scale_down_delay_seconds, 30);
        assert!(bg.preview_service.is_none());
    }

    #[test]
    fn condition_wire_name() {
        let cond = Condition {
            kind: ConditionType::InvalidSpec,
            status: ConditionStatus::True,
            reason: "InvalidSpec".to_string(),
            message: String::new(),
            last_transition_time: 1,
            last_update_time: 1,
        };
        let value = serde_json::to_value(&cond).unwrap();
        assert_eq!(value["type"], "InvalidSpec");
        assert_eq!(value["status"], "True");
    }
}
