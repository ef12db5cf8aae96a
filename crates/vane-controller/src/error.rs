//! Error types for reconcilers.

use std::time::Duration;

use thiserror::Error;

use vane_state::StateError;
use vane_traffic::RouterError;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("object store: {0}")]
    State(#[from] StateError),

    #[error("traffic router: {0}")]
    Router(#[from] RouterError),

    #[error("traffic router {router:?} did not answer within {timeout:?}")]
    RouterTimeout { router: String, timeout: Duration },

    #[error("{0}")]
    Internal(String),

    #[error("reconcile pass panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Worth retrying with backoff: conflicts, timeouts, unavailable
    /// routers and storage failures. Malformed objects and unknown routers
    /// wait for the next change instead.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::State(e) => !matches!(
                e,
                StateError::Invalid(_) | StateError::Serialize(_) | StateError::Deserialize(_)
            ),
            ReconcileError::Router(e) => {
                matches!(e, RouterError::Unavailable(_) | RouterError::Rejected(_))
            }
            ReconcileError::RouterTimeout { .. } | ReconcileError::Panicked(_) => true,
            ReconcileError::Internal(_) => false,
        }
    }
}
