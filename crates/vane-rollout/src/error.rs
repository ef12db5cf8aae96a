//! Errors raised while planning a rollout or applying a user action.

use thiserror::Error;

use vane_analysis::AnalysisError;

pub type PlanResult<T> = Result<T, PlanError>;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("step {index} ({step}): {message}")]
    InvalidStep {
        index: usize,
        step: &'static str,
        message: String,
    },

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("analysis template {0:?} not found")]
    MissingTemplate(String),

    #[error("service {0:?} not found")]
    MissingService(String),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("no update in progress")]
    NotInFlight,

    #[error("rollout is not aborted")]
    NotAborted,

    #[error("rollout is aborted; retry it first")]
    Aborted,

    #[error("rollout is not paused")]
    NotPaused,
}

impl PlanError {
    /// A problem with the rollout spec, as opposed to a rejected action.
    pub fn is_invalid_spec(&self) -> bool {
        matches!(
            self,
            PlanError::InvalidStep { .. }
                | PlanError::InvalidSpec(_)
                | PlanError::MissingTemplate(_)
                | PlanError::MissingService(_)
                | PlanError::Analysis(_)
        )
    }
}
