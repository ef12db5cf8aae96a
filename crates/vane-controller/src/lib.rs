//! vane-controller — runs the reconcile loops.
//!
//! Watches the object store, keeps an indexed cache of every object, and
//! drives rollouts, analysis runs and (optionally) replica set readiness
//! through per-kind work queues served by a pool of workers.
//!
//! # Components
//!
//! - **`cache`** — `ObjectCache`, the read-only indexed view reconcilers use
//! - **`queue`** — `WorkQueue`, deduplicating with delays and backoff
//! - **`executor`** — applies planned mutations to the store and router
//! - **`rollout`** / **`analysis`** / **`readiness`** — the reconcilers
//! - **`controller`** — feed loop, dispatch and the worker pool

pub mod analysis;
pub mod cache;
pub mod controller;
pub mod error;
pub mod executor;
pub mod queue;
pub mod readiness;
pub mod rollout;

pub use analysis::AnalysisRunReconciler;
pub use cache::ObjectCache;
pub use controller::{Controller, ControllerOptions};
pub use error::{ReconcileError, ReconcileResult};
pub use executor::MutationExecutor;
pub use queue::WorkQueue;
pub use readiness::ReadinessSimulator;
pub use rollout::RolloutReconciler;
