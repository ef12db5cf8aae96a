//! vane-analysis — the Analysis Engine.
//!
//! Owns the lifecycle of an AnalysisRun: measurement scheduling per metric,
//! verdicts from success/failure conditions, and worst-case aggregation of
//! metric phases into the run phase. Measurements come from metric
//! providers registered by name; the built-in `web` provider fetches JSON
//! over HTTP.

pub mod condition;
pub mod engine;
pub mod error;
pub mod provider;
pub mod template;
pub mod web;

pub use condition::{Condition, ConditionError};
pub use engine::{AnalysisEngine, RunUpdate, aggregate, assess_metric, evaluate_conditions};
pub use error::{AnalysisError, AnalysisResult, ProviderError};
pub use provider::{MeasureContext, MeasurementOutcome, MetricProvider, ProviderRegistry};
pub use template::{merge_templates, resolve_args, substitute};
pub use web::WebProvider;
