//! vane-metrics — observability for the Vane controller.
//!
//! Counts reconcile passes, applied mutations and finished analysis runs,
//! tracks work queue depth, and renders all of it together with per-rollout
//! gauges in the Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! ControllerMetrics
//!   ├── record_reconcile() ← called per worker pass
//!   ├── record_mutation()  ← called per applied mutation
//!   ├── set_queue_depth()  ← called by the worker pool
//!   └── snapshot() → MetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus(snapshot, rollouts) → text/plain for /metrics
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{ControllerMetrics, MetricsSnapshot, ReconcileStats};
pub use prometheus::render_prometheus;
