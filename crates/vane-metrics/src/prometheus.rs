//! Prometheus text exposition format.
//!
//! Renders controller counters and per-rollout gauges for scraping by a
//! Prometheus server or compatible agent.

use vane_state::{Rollout, RolloutPhase, RolloutStrategy};

use crate::collector::MetricsSnapshot;

const PHASES: [RolloutPhase; 4] = [
    RolloutPhase::Progressing,
    RolloutPhase::Paused,
    RolloutPhase::Degraded,
    RolloutPhase::Healthy,
];

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} {kind}\n"));
}

/// Render the controller snapshot and rollout gauges into Prometheus format.
///
/// Counters carry `queue`, `mutation` or `phase` labels; rollout gauges
/// carry a `rollout` label of the form `{namespace}/{name}`.
pub fn render_prometheus(snapshot: &MetricsSnapshot, rollouts: &[Rollout]) -> String {
    let mut out = String::new();

    header(&mut out, "vane_reconcile_total", "Reconcile passes per queue.", "counter");
    for (queue, stats) in &snapshot.reconciles {
        out.push_str(&format!("vane_reconcile_total{{queue=\"{queue}\"}} {}\n", stats.total));
    }

    header(&mut out, "vane_reconcile_errors_total", "Failed reconcile passes per queue.", "counter");
    for (queue, stats) in &snapshot.reconciles {
        out.push_str(&format!(
            "vane_reconcile_errors_total{{queue=\"{queue}\"}} {}\n",
            stats.errors
        ));
    }

    header(
        &mut out,
        "vane_reconcile_duration_seconds_sum",
        "Total time spent reconciling per queue.",
        "counter",
    );
    for (queue, stats) in &snapshot.reconciles {
        out.push_str(&format!(
            "vane_reconcile_duration_seconds_sum{{queue=\"{queue}\"}} {:.6}\n",
            stats.duration_seconds_sum
        ));
    }

    header(&mut out, "vane_mutations_total", "Mutations applied by kind.", "counter");
    for (mutation, count) in &snapshot.mutations {
        out.push_str(&format!("vane_mutations_total{{mutation=\"{mutation}\"}} {count}\n"));
    }

    header(
        &mut out,
        "vane_analysis_runs_completed_total",
        "Analysis runs that reached a terminal phase.",
        "counter",
    );
    for (phase, count) in &snapshot.analysis_runs_completed {
        out.push_str(&format!(
            "vane_analysis_runs_completed_total{{phase=\"{phase}\"}} {count}\n"
        ));
    }

    header(&mut out, "vane_queue_depth", "Keys waiting in each work queue.", "gauge");
    for (queue, depth) in &snapshot.queue_depth {
        out.push_str(&format!("vane_queue_depth{{queue=\"{queue}\"}} {depth}\n"));
    }

    header(&mut out, "vane_cache_relists_total", "Full object cache relists.", "counter");
    out.push_str(&format!("vane_cache_relists_total {}\n", snapshot.cache_relists));

    header(&mut out, "vane_rollout_phase", "1 for the rollout's current phase.", "gauge");
    for r in rollouts {
        let key = r.metadata.key();
        let strategy = match r.spec.strategy {
            RolloutStrategy::Canary(_) => "canary",
            RolloutStrategy::BlueGreen(_) => "blueGreen",
        };
        for phase in PHASES {
            out.push_str(&format!(
                "vane_rollout_phase{{rollout=\"{key}\",strategy=\"{strategy}\",phase=\"{phase}\"}} {}\n",
                u8::from(r.status.phase == phase)
            ));
        }
    }

    header(&mut out, "vane_rollout_replicas_available", "Available replicas across revisions.", "gauge");
    for r in rollouts {
        out.push_str(&format!(
            "vane_rollout_replicas_available{{rollout=\"{}\"}} {}\n",
            r.metadata.key(),
            r.status.available_replicas
        ));
    }

    header(&mut out, "vane_rollout_canary_weight", "Traffic percent routed to the canary.", "gauge");
    for r in rollouts {
        if let Some(weights) = &r.status.canary.weights {
            out.push_str(&format!(
                "vane_rollout_canary_weight{{rollout=\"{}\"}} {}\n",
                r.metadata.key(),
                weights.canary
            ));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use vane_state::{
        CanaryStrategy, ObjectMeta, PodTemplate, RolloutSpec, RolloutStatus, TrafficWeights,
    };

    use crate::collector::ReconcileStats;

    fn test_rollout(name: &str, phase: RolloutPhase) -> Rollout {
        let mut status = RolloutStatus {
            phase,
            available_replicas: 4,
            ..Default::default()
        };
        status.canary.weights = Some(TrafficWeights {
            canary: 20,
            stable: 80,
            verified: None,
        });
        Rollout {
            metadata: ObjectMeta::new("default", name),
            spec: RolloutSpec {
                replicas: 4,
                template: PodTemplate::default(),
                strategy: RolloutStrategy::Canary(CanaryStrategy::default()),
                paused: false,
                revision_history_limit: 10,
                progress_deadline_seconds: 600,
                progress_deadline_abort: true,
            },
            status,
        }
    }

    fn test_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            reconciles: BTreeMap::from([(
                "rollouts".to_string(),
                ReconcileStats {
                    total: 12,
                    errors: 2,
                    duration_seconds_sum: 0.5,
                },
            )]),
            mutations: BTreeMap::from([("set_weight".to_string(), 3)]),
            analysis_runs_completed: BTreeMap::from([("Successful".to_string(), 1)]),
            queue_depth: BTreeMap::from([("rollouts".to_string(), 0)]),
            cache_relists: 2,
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&MetricsSnapshot::default(), &[]);
        // Should still have type declarations.
        assert!(output.contains("# HELP vane_reconcile_total"));
        assert!(output.contains("# TYPE vane_queue_depth gauge"));
        assert!(output.contains("vane_cache_relists_total 0"));
    }

    #[test]
    fn render_counters() {
        let output = render_prometheus(&test_snapshot(), &[]);
        assert!(output.contains("vane_reconcile_total{queue=\"rollouts\"} 12"));
        assert!(output.contains("vane_reconcile_errors_total{queue=\"rollouts\"} 2"));
        assert!(output.contains("vane_reconcile_duration_seconds_sum{queue=\"rollouts\"} 0.500000"));
        assert!(output.contains("vane_mutations_total{mutation=\"set_weight\"} 3"));
        assert!(output.contains("vane_analysis_runs_completed_total{phase=\"Successful\"} 1"));
        assert!(output.contains("vane_cache_relists_total 2"));
    }

    #[test]
    fn render_rollout_gauges() {
        let rollouts = vec![test_rollout("web", RolloutPhase::Paused)];
        let output = render_prometheus(&MetricsSnapshot::default(), &rollouts);

        assert!(output.contains(
            "vane_rollout_phase{rollout=\"default/web\",strategy=\"canary\",phase=\"Paused\"} 1"
        ));
        assert!(output.contains(
            "vane_rollout_phase{rollout=\"default/web\",strategy=\"canary\",phase=\"Healthy\"} 0"
        ));
        assert!(output.contains("vane_rollout_replicas_available{rollout=\"default/web\"} 4"));
        assert!(output.contains("vane_rollout_canary_weight{rollout=\"default/web\"} 20"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let rollouts = vec![test_rollout("web", RolloutPhase::Healthy)];
        let output = render_prometheus(&test_snapshot(), &rollouts);

        // Every sample line is `name[{labels}] value`.
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (_, value) = line.rsplit_once(' ').expect("sample has a value");
            assert!(value.parse::<f64>().is_ok(), "bad value in line: {line}");
        }
    }
}
