//! vane-rollout — the rollout state machine.
//!
//! Given a Rollout and the objects it owns, [`plan`] decides the next set
//! of mutations (replica sets, services, traffic weights, analysis runs)
//! and the status to write back. Planning is pure; the controller applies
//! the result and requeues.
//!
//! # Components
//!
//! - **`plan`** — one reconcile pass, shared helpers, status and conditions
//! - **`canary`** — step execution, background analysis, promotion, abort
//! - **`bluegreen`** — preview gating and the active service switch
//! - **`children`** — analysis runs and experiments gating a revision
//! - **`validation`** — static spec checks (`InvalidSpec`)
//! - **`actions`** — promote, abort, retry, pause, resume

pub mod actions;
mod bluegreen;
mod canary;
pub mod children;
pub mod conditions;
pub mod error;
pub mod plan;
pub mod replicaset;
pub mod validation;

#[cfg(test)]
mod testutil;

pub use children::GATE_LABEL;
pub use error::{PlanError, PlanResult};
pub use plan::{Mutation, REQUEUE_NOW, ReconcilePlan, RolloutContext, plan};
pub use replicaset::{replica_set_name, revision};
pub use validation::validate;
