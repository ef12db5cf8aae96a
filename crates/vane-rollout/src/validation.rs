//! Static checks on a rollout spec against the templates and services it
//! references. A failure is surfaced as an `InvalidSpec` condition and the
//! rollout is left untouched until the spec changes.

use vane_analysis::merge_templates;
use vane_core::parse_duration;
use vane_state::{
    AnalysisTemplate, BlueGreenStrategy, CanaryStep, CanaryStrategy, Rollout, RolloutAnalysis,
    RolloutStrategy, Service,
};

use crate::error::{PlanError, PlanResult};

/// Longest pause, delay or deadline a spec may ask for (one year).
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 3600;

pub fn validate(
    rollout: &Rollout,
    templates: &[AnalysisTemplate],
    services: &[Service],
) -> PlanResult<()> {
    if rollout.spec.template.containers.is_empty() {
        return Err(PlanError::InvalidSpec("template has no containers".to_string()));
    }
    check_seconds("progressDeadlineSeconds", rollout.spec.progress_deadline_seconds)?;
    check_seconds("scaleDownDelaySeconds", rollout.spec.scale_down_delay_seconds())?;
    match &rollout.spec.strategy {
        RolloutStrategy::Canary(canary) => validate_canary(canary, templates, services),
        RolloutStrategy::BlueGreen(bg) => validate_blue_green(bg, templates, services),
    }
}

fn validate_canary(
    canary: &CanaryStrategy,
    templates: &[AnalysisTemplate],
    services: &[Service],
) -> PlanResult<()> {
    if let Some(routing) = &canary.traffic_routing {
        if routing.router.is_empty() {
            return Err(PlanError::InvalidSpec("trafficRouting.router is empty".to_string()));
        }
        if canary.stable_service.is_none() || canary.canary_service.is_none() {
            return Err(PlanError::InvalidSpec(
                "trafficRouting requires stableService and canaryService".to_string(),
            ));
        }
    }
    if canary.stable_service.is_some() && canary.stable_service == canary.canary_service {
        return Err(PlanError::InvalidSpec(
            "stableService and canaryService must differ".to_string(),
        ));
    }
    for name in [&canary.stable_service, &canary.canary_service].into_iter().flatten() {
        require_service(name, services)?;
    }

    let routed = canary.traffic_routing.is_some();
    let mut last_weight = 0;
    for (index, step) in canary.steps.iter().enumerate() {
        let invalid = |message: String| PlanError::InvalidStep {
            index,
            step: step.name(),
            message,
        };
        match step {
            CanaryStep::SetWeight(weight) => {
                if *weight > 100 {
                    return Err(invalid(format!("weight {weight} exceeds 100")));
                }
                if *weight < last_weight {
                    return Err(invalid(format!(
                        "weight {weight} is lower than the preceding weight {last_weight}"
                    )));
                }
                last_weight = *weight;
            }
            CanaryStep::Pause(pause) => {
                if let Some(duration) = &pause.duration {
                    check_duration(duration).map_err(invalid)?;
                }
            }
            CanaryStep::Analysis(analysis) => check_analysis(analysis, templates)?,
            CanaryStep::Experiment(experiment) => {
                if experiment.templates.is_empty() {
                    return Err(invalid("experiment has no templates".to_string()));
                }
                if let Some(duration) = &experiment.duration {
                    check_duration(duration).map_err(invalid)?;
                }
                for analysis in &experiment.analyses {
                    lookup_templates(std::slice::from_ref(&analysis.template_name), templates)?;
                }
            }
            CanaryStep::SetCanaryScale(scale) => {
                let set = [scale.weight.is_some(), scale.replicas.is_some(), scale.match_traffic_weight]
                    .iter()
                    .filter(|b| **b)
                    .count();
                if set != 1 {
                    return Err(invalid(
                        "exactly one of weight, replicas or matchTrafficWeight is required".to_string(),
                    ));
                }
                if scale.weight.is_some_and(|w| w > 100) {
                    return Err(invalid("weight exceeds 100".to_string()));
                }
            }
            CanaryStep::SetHeaderRoute(route) => {
                if !routed {
                    return Err(invalid("requires trafficRouting".to_string()));
                }
                if route.name.is_empty() {
                    return Err(invalid("route name is empty".to_string()));
                }
            }
            CanaryStep::SetMirrorRoute(route) => {
                if !routed {
                    return Err(invalid("requires trafficRouting".to_string()));
                }
                if route.name.is_empty() {
                    return Err(invalid("route name is empty".to_string()));
                }
                if route.percentage > 100 {
                    return Err(invalid(format!("percentage {} exceeds 100", route.percentage)));
                }
            }
        }
    }

    if let Some(background) = &canary.analysis {
        check_analysis(background, templates)?;
        if background.start_index.is_some_and(|i| i > canary.steps.len()) {
            return Err(PlanError::InvalidSpec(
                "analysis.startIndex is beyond the last step".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_blue_green(
    bg: &BlueGreenStrategy,
    templates: &[AnalysisTemplate],
    services: &[Service],
) -> PlanResult<()> {
    if bg.active_service.is_empty() {
        return Err(PlanError::InvalidSpec("activeService is empty".to_string()));
    }
    require_service(&bg.active_service, services)?;
    if let Some(preview) = &bg.preview_service {
        if *preview == bg.active_service {
            return Err(PlanError::InvalidSpec(
                "previewService and activeService must differ".to_string(),
            ));
        }
        require_service(preview, services)?;
    }
    if let Some(delay) = bg.auto_promotion_seconds {
        check_seconds("autoPromotionSeconds", delay)?;
    }
    for analysis in [&bg.pre_promotion_analysis, &bg.post_promotion_analysis]
        .into_iter()
        .flatten()
    {
        check_analysis(analysis, templates)?;
    }
    Ok(())
}

fn check_duration(value: &str) -> Result<(), String> {
    let duration = parse_duration(value).map_err(|e| e.to_string())?;
    if duration.as_secs() > MAX_DURATION_SECS {
        return Err(format!("duration {value:?} exceeds {MAX_DURATION_SECS}s"));
    }
    Ok(())
}

fn check_seconds(field: &str, secs: u64) -> PlanResult<()> {
    if secs > MAX_DURATION_SECS {
        return Err(PlanError::InvalidSpec(format!(
            "{field} {secs} exceeds {MAX_DURATION_SECS}"
        )));
    }
    Ok(())
}

fn require_service(name: &str, services: &[Service]) -> PlanResult<()> {
    if services.iter().any(|s| s.metadata.name == name) {
        Ok(())
    } else {
        Err(PlanError::MissingService(name.to_string()))
    }
}

fn check_analysis(analysis: &RolloutAnalysis, templates: &[AnalysisTemplate]) -> PlanResult<()> {
    if analysis.templates.is_empty() {
        return Err(PlanError::InvalidSpec("analysis references no templates".to_string()));
    }
    let found = lookup_templates(&analysis.templates, templates)?;
    merge_templates(&found, &analysis.args)?;
    Ok(())
}

/// Resolve template names, failing on the first one missing.
pub(crate) fn lookup_templates<'a>(
    names: &[String],
    templates: &'a [AnalysisTemplate],
) -> PlanResult<Vec<&'a AnalysisTemplate>> {
    names
        .iter()
        .map(|name| {
            templates
                .iter()
                .find(|t| t.metadata.name == *name)
                .ok_or_else(|| PlanError::MissingTemplate(name.clone()))
        })
        .collect()
}
