//! Error types for the analysis engine and metric providers.

use thiserror::Error;

use crate::condition::ConditionError;

pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Problems with an analysis definition. These end a run in `Error`.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("unknown metric provider {0:?}")]
    UnknownProvider(String),

    #[error("run has no metrics")]
    NoMetrics,

    #[error("analysis template {0:?} not found")]
    TemplateNotFound(String),

    #[error("argument {0:?} has no value")]
    MissingArg(String),

    #[error("reference to undeclared argument {0:?}")]
    UnknownArg(String),

    #[error("metric {0:?} is defined more than once")]
    DuplicateMetric(String),

    #[error("metric {metric:?}: {message}")]
    InvalidMetric { metric: String, message: String },

    #[error(transparent)]
    Condition(#[from] ConditionError),
}

/// A single provider call failed. Counted as an `Error` measurement.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid provider config: {0}")]
    Config(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("unreadable response: {0}")]
    Body(String),

    #[error("path {0:?} not found in response")]
    Path(String),

    #[error("provider does not support {0}")]
    Unsupported(&'static str),
}
