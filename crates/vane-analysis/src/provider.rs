//! Metric Provider Interface and the provider registry.
//!
//! The engine only ever talks to `dyn MetricProvider`; concrete backends are
//! registered by name and looked up through `metric.provider.name`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use vane_state::{AnalysisPhase, Measurement, Metric};

use crate::error::ProviderError;
use crate::web::WebProvider;

/// Identifies the run a measurement belongs to.
#[derive(Debug, Clone)]
pub struct MeasureContext {
    /// `{namespace}/{name}` of the AnalysisRun.
    pub run: String,
    pub args: BTreeMap<String, String>,
}

/// What a provider reports for one measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementOutcome {
    /// A value to be judged by the metric's conditions.
    Value {
        value: serde_json::Value,
        metadata: BTreeMap<String, String>,
    },
    /// The provider judged the measurement itself.
    Verdict {
        phase: AnalysisPhase,
        value: Option<serde_json::Value>,
        message: String,
    },
    /// Started but not finished; poll again with `resume` after the delay.
    Pending {
        resume_after: Duration,
        metadata: BTreeMap<String, String>,
    },
}

impl MeasurementOutcome {
    pub fn value(value: serde_json::Value) -> Self {
        MeasurementOutcome::Value {
            value,
            metadata: BTreeMap::new(),
        }
    }
}

/// A backend that can take measurements. Must be safe to call concurrently
/// for different metrics and runs.
#[async_trait]
pub trait MetricProvider: Send + Sync {
    /// Start a measurement for `metric` (args already substituted).
    async fn run(
        &self,
        ctx: &MeasureContext,
        metric: &Metric,
    ) -> Result<MeasurementOutcome, ProviderError>;

    /// Poll a measurement previously reported as `Pending`.
    async fn resume(
        &self,
        _ctx: &MeasureContext,
        _metric: &Metric,
        _measurement: &Measurement,
    ) -> Result<MeasurementOutcome, ProviderError> {
        Err(ProviderError::Unsupported("resume"))
    }

    /// Release anything held for an in-flight measurement of a terminated run.
    async fn terminate(
        &self,
        _ctx: &MeasureContext,
        _metric: &Metric,
        _measurement: &Measurement,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Provider name → implementation.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn MetricProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in providers (`web`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("web", Arc::new(WebProvider::new()));
        registry
    }

    /// Register (or replace) a provider under `name`.
    pub fn register(&mut self, name: &str, provider: Arc<dyn MetricProvider>) {
        self.providers.insert(name.to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MetricProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
