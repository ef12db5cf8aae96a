//! vane-state — object model and authoritative object store for Vane.
//!
//! Backed by [redb](https://docs.rs/redb). Every kind (Rollout, ReplicaSet,
//! Service, AnalysisTemplate, AnalysisRun, Experiment) lives in its own
//! table of JSON-serialized values keyed by `{namespace}/{name}`.
//!
//! # Semantics
//!
//! - `update` writes spec and metadata, `update_status` writes status only.
//! - Writes carrying a non-zero `resource_version` fail with
//!   `StateError::Conflict` when the stored object has moved on.
//! - Every committed write is published on a broadcast watch feed, which
//!   the controller's object cache consumes.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod analysis;
pub mod error;
pub mod meta;
pub mod object;
pub mod rollout;
pub mod store;
pub mod tables;
pub mod watch;
pub mod workload;

pub use analysis::*;
pub use error::{StateError, StateResult};
pub use meta::*;
pub use object::{Kind, Object, Resource};
pub use rollout::*;
pub use store::StateStore;
pub use watch::{EventType, WatchEvent};
pub use workload::*;
