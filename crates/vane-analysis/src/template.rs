//! Building run specs from templates, and argument substitution.

use std::collections::{BTreeMap, HashSet};

use vane_state::{AnalysisArg, AnalysisRunSpec, AnalysisTemplate, Metric};

use crate::error::{AnalysisError, AnalysisResult};

/// Merge the metrics and declared args of several templates into one run
/// spec, with `args` supplying (or overriding) values.
///
/// Fails on duplicate metric names. Argument values are resolved later by
/// [`resolve_args`], so an arg left without a value here still produces a
/// spec; the engine turns the gap into a run error.
pub fn merge_templates(
    templates: &[&AnalysisTemplate],
    args: &[AnalysisArg],
) -> AnalysisResult<AnalysisRunSpec> {
    let mut metrics: Vec<Metric> = Vec::new();
    let mut seen = HashSet::new();
    let mut merged_args: Vec<AnalysisArg> = Vec::new();

    for template in templates {
        for metric in &template.spec.metrics {
            if !seen.insert(metric.name.clone()) {
                return Err(AnalysisError::DuplicateMetric(metric.name.clone()));
            }
            metrics.push(metric.clone());
        }
        for arg in &template.spec.args {
            upsert_arg(&mut merged_args, arg);
        }
    }
    for arg in args {
        upsert_arg(&mut merged_args, arg);
    }

    Ok(AnalysisRunSpec {
        metrics,
        args: merged_args,
        terminate: false,
    })
}

fn upsert_arg(args: &mut Vec<AnalysisArg>, arg: &AnalysisArg) {
    let has_value = arg.value.is_some() || arg.value_from.is_some();
    match args.iter_mut().find(|a| a.name == arg.name) {
        // A valueless declaration never clears an existing value.
        Some(existing) => {
            if has_value {
                *existing = arg.clone();
            }
        }
        None => args.push(arg.clone()),
    }
}

/// Resolve run args into a name → value map. Every arg needs a value.
pub fn resolve_args(args: &[AnalysisArg]) -> AnalysisResult<BTreeMap<String, String>> {
    args.iter()
        .map(|arg| match &arg.value {
            Some(value) => Ok((arg.name.clone(), value.clone())),
            None => Err(AnalysisError::MissingArg(arg.name.clone())),
        })
        .collect()
}

/// Replace every `{{args.<name>}}` (whitespace inside the braces allowed).
pub fn substitute(input: &str, args: &BTreeMap<String, String>) -> AnalysisResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let inner = after[..end].trim();
        match inner.strip_prefix("args.") {
            Some(name) => match args.get(name) {
                Some(value) => out.push_str(value),
                None => return Err(AnalysisError::UnknownArg(name.to_string())),
            },
            // Not ours; leave untouched.
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn substitute_value(
    value: &serde_json::Value,
    args: &BTreeMap<String, String>,
) -> AnalysisResult<serde_json::Value> {
    Ok(match value {
        serde_json::Value::String(s) => serde_json::Value::String(substitute(s, args)?),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|v| substitute_value(v, args))
                .collect::<AnalysisResult<_>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(v, args)?);
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    })
}

/// A copy of `metric` with args substituted into its provider config and
/// conditions.
pub fn resolve_metric(metric: &Metric, args: &BTreeMap<String, String>) -> AnalysisResult<Metric> {
    let mut resolved = metric.clone();
    resolved.provider.config = substitute_value(&metric.provider.config, args)?;
    if let Some(cond) = &metric.success_condition {
        resolved.success_condition = Some(substitute(cond, args)?);
    }
    if let Some(cond) = &metric.failure_condition {
        resolved.failure_condition = Some(substitute(cond, args)?);
    }
    Ok(resolved)
}
