//! Analysis Engine — drives one AnalysisRun forward per reconcile pass.
//!
//! Each pass looks at every metric independently:
//!
//! - a measurement still in flight (`Running`) is resumed once its
//!   `resume_at` passes, never re-issued;
//! - otherwise a new measurement is taken when the metric is due
//!   (`started_at + initial_delay` for the first, `finished_at + interval`
//!   after that);
//! - counters are updated and the metric is assessed against its limits.
//!
//! Metric phases are then rolled into the run phase. Provider calls for
//! different metrics run concurrently and each is bounded by a timeout.
//! Once the run phase is terminal it never changes again.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, instrument, warn};

use vane_core::parse_duration;
use vane_state::{
    AnalysisPhase, AnalysisRun, AnalysisRunStatus, FailureCounting, Measurement, Metric,
    MetricResult,
};

use crate::condition::{Condition, evaluate};
use crate::error::{AnalysisError, AnalysisResult};
use crate::provider::{MeasureContext, MeasurementOutcome, ProviderRegistry};
use crate::template::{resolve_args, resolve_metric};

/// Result of one engine pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub status: AnalysisRunStatus,
    /// When the run next needs attention; `None` once terminal.
    pub requeue_after: Option<Duration>,
}

pub struct AnalysisEngine {
    providers: ProviderRegistry,
    default_timeout: Duration,
}

/// What a metric needs this pass.
#[derive(Debug, Clone, PartialEq)]
enum Next {
    Measure,
    Resume(Measurement),
    WaitUntil(u64),
    Done,
}

impl AnalysisEngine {
    pub fn new(providers: ProviderRegistry, default_timeout: Duration) -> Self {
        Self {
            providers,
            default_timeout,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Advance `run` as of `now` (unix seconds) and return its new status.
    #[instrument(skip_all, fields(run = %run.metadata.key()))]
    pub async fn reconcile(&self, run: &AnalysisRun, now: u64) -> RunUpdate {
        let mut status = run.status.clone();
        if status.phase.is_terminal() {
            return RunUpdate {
                status,
                requeue_after: None,
            };
        }
        let started_at = *status.started_at.get_or_insert(now);

        let (metrics, args) = match self.prepare(run) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "analysis run is invalid");
                status.phase = AnalysisPhase::Error;
                status.message = e.to_string();
                return RunUpdate {
                    status,
                    requeue_after: None,
                };
            }
        };

        for metric in &metrics {
            if status.metric(&metric.name).is_none() {
                status.metric_results.push(MetricResult::new(&metric.name));
            }
        }

        let ctx = MeasureContext {
            run: run.metadata.key(),
            args,
        };
        let terminate = run.spec.terminate;

        let mut calls = Vec::new();
        for metric in &metrics {
            let Some(result) = status.metric(&metric.name) else {
                continue;
            };
            match next_action(metric, result, started_at, now, terminate) {
                Next::Measure => calls.push(self.take_measurement(&ctx, metric, None, now)),
                Next::Resume(pending) => {
                    calls.push(self.take_measurement(&ctx, metric, Some(pending), now))
                }
                Next::WaitUntil(_) | Next::Done => {}
            }
        }

        for (name, measurement) in join_all(calls).await {
            if let Some(result) = status.metric_results.iter_mut().find(|r| r.name == name) {
                record(result, measurement);
            }
        }

        if terminate {
            if status.message.is_empty() {
                status.message = "run terminated".to_string();
            }
        } else {
            self.assess(&metrics, &mut status);
        }

        let requeue_after = if status.phase.is_terminal() {
            None
        } else {
            requeue_after(&metrics, &status, started_at, now, terminate)
        };

        RunUpdate {
            status,
            requeue_after,
        }
    }

    /// Resolve args and validate every metric of the run.
    fn prepare(&self, run: &AnalysisRun) -> AnalysisResult<(Vec<Metric>, BTreeMap<String, String>)> {
        if run.spec.metrics.is_empty() {
            return Err(AnalysisError::NoMetrics);
        }
        let args = resolve_args(&run.spec.args)?;

        let mut metrics: Vec<Metric> = Vec::with_capacity(run.spec.metrics.len());
        for metric in &run.spec.metrics {
            if metrics.iter().any(|m| m.name == metric.name) {
                return Err(AnalysisError::DuplicateMetric(metric.name.clone()));
            }
            if !self.providers.contains(&metric.provider.name) {
                return Err(AnalysisError::UnknownProvider(metric.provider.name.clone()));
            }
            let resolved = resolve_metric(metric, &args)?;
            for (field, value) in [
                ("interval", &resolved.interval),
                ("initialDelay", &resolved.initial_delay),
                ("timeout", &resolved.timeout),
            ] {
                if let Some(value) = value {
                    parse_duration(value).map_err(|e| AnalysisError::InvalidMetric {
                        metric: resolved.name.clone(),
                        message: format!("{field}: {e}"),
                    })?;
                }
            }
            for cond in [&resolved.success_condition, &resolved.failure_condition]
                .into_iter()
                .flatten()
            {
                Condition::parse(cond)?;
            }
            metrics.push(resolved);
        }
        Ok((metrics, args))
    }

    /// Start (or resume) one measurement, bounded by the metric timeout.
    async fn take_measurement(
        &self,
        ctx: &MeasureContext,
        metric: &Metric,
        pending: Option<Measurement>,
        now: u64,
    ) -> (String, Measurement) {
        let timeout = metric
            .timeout
            .as_deref()
            .and_then(|t| parse_duration(t).ok())
            .unwrap_or(self.default_timeout);
        let mut measurement = pending.clone().unwrap_or_else(|| Measurement {
            phase: AnalysisPhase::Running,
            started_at: now,
            ..Default::default()
        });

        let Some(provider) = self.providers.get(&metric.provider.name) else {
            finish(
                &mut measurement,
                AnalysisPhase::Error,
                format!("unknown metric provider {:?}", metric.provider.name),
                now,
            );
            return (metric.name.clone(), measurement);
        };

        let call = async {
            match &pending {
                Some(m) => provider.resume(ctx, metric, m).await,
                None => provider.run(ctx, metric).await,
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Err(_) => {
                warn!(metric = %metric.name, ?timeout, "measurement timed out");
                finish(
                    &mut measurement,
                    AnalysisPhase::Error,
                    format!("measurement timed out after {}s", timeout.as_secs_f64()),
                    now,
                );
            }
            Ok(Err(e)) => {
                warn!(metric = %metric.name, error = %e, "measurement failed");
                finish(&mut measurement, AnalysisPhase::Error, e.to_string(), now);
            }
            Ok(Ok(outcome)) => judge(metric, outcome, &mut measurement, now),
        }
        debug!(metric = %metric.name, phase = %measurement.phase, value = ?measurement.value, "measurement recorded");
        (metric.name.clone(), measurement)
    }

    /// Assess every non-terminal metric, then roll up the run phase.
    fn assess(&self, metrics: &[Metric], status: &mut AnalysisRunStatus) {
        for metric in metrics {
            let Some(result) = status.metric_results.iter_mut().find(|r| r.name == metric.name)
            else {
                continue;
            };
            if result.phase.is_terminal() {
                continue;
            }
            let (phase, message) = assess_metric(metric, result);
            if phase != result.phase && phase.is_terminal() {
                info!(metric = %metric.name, %phase, "metric completed");
            }
            result.phase = phase;
            result.message = message;
        }

        let phase = aggregate(status.metric_results.iter().map(|r| r.phase));
        if phase.is_terminal() {
            let message = status
                .metric_results
                .iter()
                .find(|r| r.phase == phase && !r.message.is_empty())
                .map(|r| r.message.clone())
                .unwrap_or_default();
            info!(%phase, %message, "analysis run completed");
            status.message = message;
        }
        status.phase = match phase {
            AnalysisPhase::Pending => AnalysisPhase::Running,
            other => other,
        };
    }
}

fn finish(measurement: &mut Measurement, phase: AnalysisPhase, message: String, now: u64) {
    measurement.phase = phase;
    measurement.message = message;
    measurement.finished_at = Some(now);
    measurement.resume_at = None;
}

/// Turn a provider outcome into a measurement verdict.
fn judge(metric: &Metric, outcome: MeasurementOutcome, measurement: &mut Measurement, now: u64) {
    match outcome {
        MeasurementOutcome::Value { value, metadata } => {
            measurement.metadata.extend(metadata);
            measurement.value = Some(display_value(&value));
            let (phase, message) = evaluate_conditions(metric, &value);
            finish(measurement, phase, message, now);
        }
        MeasurementOutcome::Verdict {
            phase,
            value,
            message,
        } => {
            measurement.value = value.as_ref().map(display_value);
            if phase.is_terminal() {
                finish(measurement, phase, message, now);
            } else {
                finish(
                    measurement,
                    AnalysisPhase::Error,
                    format!("provider returned non-terminal verdict {phase}"),
                    now,
                );
            }
        }
        MeasurementOutcome::Pending {
            resume_after,
            metadata,
        } => {
            measurement.metadata.extend(metadata);
            measurement.phase = AnalysisPhase::Running;
            measurement.resume_at = Some(now.saturating_add(ceil_secs(resume_after).max(1)));
        }
    }
}

/// Verdict of a measured value against the metric's conditions.
///
/// A failure condition that holds always wins. A value that cannot be
/// evaluated is inconclusive.
pub fn evaluate_conditions(metric: &Metric, value: &serde_json::Value) -> (AnalysisPhase, String) {
    let check = |cond: &Option<String>| -> Result<Option<bool>, String> {
        match cond {
            Some(c) => evaluate(c, value).map(Some).map_err(|e| e.to_string()),
            None => Ok(None),
        }
    };
    let success = match check(&metric.success_condition) {
        Ok(v) => v,
        Err(e) => return (AnalysisPhase::Inconclusive, e),
    };
    let failure = match check(&metric.failure_condition) {
        Ok(v) => v,
        Err(e) => return (AnalysisPhase::Inconclusive, e),
    };

    let phase = match (success, failure) {
        (_, Some(true)) => AnalysisPhase::Failed,
        (Some(true), _) => AnalysisPhase::Successful,
        (Some(false), None) => AnalysisPhase::Failed,
        (None, Some(false)) | (None, None) => AnalysisPhase::Successful,
        (Some(false), Some(false)) => AnalysisPhase::Inconclusive,
    };
    (phase, String::new())
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0))
}

fn duration_secs(value: &Option<String>) -> u64 {
    value
        .as_deref()
        .and_then(|v| parse_duration(v).ok())
        .map(ceil_secs)
        .unwrap_or(0)
}

/// Required successful measurements. A metric without an interval is a
/// single measurement unless `count` says otherwise.
fn effective_count(metric: &Metric) -> u32 {
    if metric.count == 0 && metric.interval.is_none() {
        1
    } else {
        metric.count
    }
}

fn next_action(
    metric: &Metric,
    result: &MetricResult,
    started_at: u64,
    now: u64,
    terminate: bool,
) -> Next {
    if result.phase.is_terminal() {
        return Next::Done;
    }
    if let Some(last) = result.last_measurement() {
        if last.phase == AnalysisPhase::Running {
            let at = last.resume_at.unwrap_or(now);
            return if at <= now {
                Next::Resume(last.clone())
            } else {
                Next::WaitUntil(at)
            };
        }
    }
    if terminate {
        return Next::Done;
    }
    let due = match result.last_measurement() {
        None => started_at.saturating_add(duration_secs(&metric.initial_delay)),
        Some(last) => last
            .finished_at
            .unwrap_or(last.started_at)
            .saturating_add(duration_secs(&metric.interval)),
    };
    if due <= now {
        Next::Measure
    } else {
        Next::WaitUntil(due)
    }
}

/// Fold a measurement into the metric result.
fn record(result: &mut MetricResult, measurement: Measurement) {
    let resumed = result
        .last_measurement()
        .is_some_and(|m| m.phase == AnalysisPhase::Running);
    let phase = measurement.phase;
    if resumed {
        if let Some(last) = result.measurements.last_mut() {
            *last = measurement;
        }
    } else {
        result.push_measurement(measurement);
    }
    if phase == AnalysisPhase::Running {
        return;
    }

    result.count += 1;
    match phase {
        AnalysisPhase::Successful => {
            result.successful += 1;
            result.consecutive_failed = 0;
            result.consecutive_error = 0;
        }
        AnalysisPhase::Failed => {
            result.failed += 1;
            result.consecutive_failed += 1;
            result.consecutive_error = 0;
        }
        AnalysisPhase::Inconclusive => {
            result.inconclusive += 1;
            result.consecutive_failed = 0;
            result.consecutive_error = 0;
        }
        AnalysisPhase::Error => {
            result.error += 1;
            result.consecutive_error += 1;
        }
        AnalysisPhase::Pending | AnalysisPhase::Running => {}
    }
}

/// Metric phase from its counters. Limits are reached at `>=`.
pub fn assess_metric(metric: &Metric, result: &MetricResult) -> (AnalysisPhase, String) {
    let (failures, counting) = match metric.failure_counting {
        FailureCounting::Consecutive => (result.consecutive_failed, "consecutive failures"),
        FailureCounting::Total => (result.failed, "failures"),
    };
    let failure_limit = metric.failure_limit.max(1);
    if failures >= failure_limit {
        return (
            AnalysisPhase::Failed,
            format!("metric {:?}: {counting} ({failures}) reached failureLimit ({failure_limit})", metric.name),
        );
    }

    let error_limit = metric.error_limit();
    if result.consecutive_error >= error_limit {
        let last = result
            .last_measurement()
            .map(|m| m.message.as_str())
            .unwrap_or_default();
        return (
            AnalysisPhase::Error,
            format!(
                "metric {:?}: consecutive errors ({}) reached limit ({error_limit}): {last}",
                metric.name, result.consecutive_error
            ),
        );
    }

    let inconclusive_limit = metric.inconclusive_limit.max(1);
    if result.inconclusive >= inconclusive_limit {
        return (
            AnalysisPhase::Inconclusive,
            format!(
                "metric {:?}: inconclusive measurements ({}) reached limit ({inconclusive_limit})",
                metric.name, result.inconclusive
            ),
        );
    }

    let required = effective_count(metric);
    if required > 0 && result.successful >= required {
        return (AnalysisPhase::Successful, String::new());
    }
    if result.measurements.is_empty() {
        (AnalysisPhase::Pending, String::new())
    } else {
        (AnalysisPhase::Running, String::new())
    }
}

/// Worst-case roll-up of metric phases into a run phase.
pub fn aggregate(phases: impl IntoIterator<Item = AnalysisPhase>) -> AnalysisPhase {
    let phases: Vec<AnalysisPhase> = phases.into_iter().collect();
    if phases.contains(&AnalysisPhase::Failed) {
        return AnalysisPhase::Failed;
    }
    if phases.contains(&AnalysisPhase::Error) {
        return AnalysisPhase::Error;
    }
    if !phases.is_empty() && phases.iter().all(|p| p.is_terminal()) {
        return if phases.contains(&AnalysisPhase::Inconclusive) {
            AnalysisPhase::Inconclusive
        } else {
            AnalysisPhase::Successful
        };
    }
    if phases.iter().all(|p| *p == AnalysisPhase::Pending) {
        AnalysisPhase::Pending
    } else {
        AnalysisPhase::Running
    }
}

fn requeue_after(
    metrics: &[Metric],
    status: &AnalysisRunStatus,
    started_at: u64,
    now: u64,
    terminate: bool,
) -> Option<Duration> {
    metrics
        .iter()
        .filter_map(|metric| {
            let result = status.metric(&metric.name)?;
            match next_action(metric, result, started_at, now, terminate) {
                Next::Measure | Next::Resume(_) => Some(0),
                Next::WaitUntil(at) => Some(at.saturating_sub(now)),
                Next::Done => None,
            }
        })
        .min()
        .map(Duration::from_secs)
}
