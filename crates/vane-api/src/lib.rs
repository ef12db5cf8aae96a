//! vane-api — REST API for Vane.
//!
//! Applies objects to the store and performs user actions on rollouts. The
//! controller picks every change up from the store's watch feed; handlers
//! never talk to it directly.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/rollouts` | List rollouts |
//! | POST | `/api/v1/rollouts` | Create a rollout or update its spec |
//! | GET | `/api/v1/rollouts/{ns}/{name}` | Get a rollout |
//! | DELETE | `/api/v1/rollouts/{ns}/{name}` | Delete a rollout |
//! | POST | `/api/v1/rollouts/{ns}/{name}/{action}` | promote (`?full=true`), abort, retry, pause, resume |
//! | GET | `/api/v1/rollouts/{ns}/{name}/replicasets` | Replica sets owned by a rollout |
//! | GET | `/api/v1/analysistemplates` | List analysis templates |
//! | POST | `/api/v1/analysistemplates` | Apply an analysis template |
//! | GET | `/api/v1/analysisruns` | List analysis runs |
//! | GET | `/api/v1/services` | List services |
//! | POST | `/api/v1/services` | Apply a service |
//! | PUT | `/api/v1/experiments/{ns}/{name}/status` | Report an experiment result |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod rollout_handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use vane_core::{Clock, SystemClock};
use vane_metrics::ControllerMetrics;
use vane_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub metrics: ControllerMetrics,
    /// Timestamps user actions such as abort.
    pub clock: Arc<dyn Clock>,
}

impl ApiState {
    pub fn new(store: StateStore, metrics: ControllerMetrics) -> Self {
        Self {
            store,
            metrics,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/rollouts",
            get(rollout_handlers::list_rollouts).post(rollout_handlers::apply_rollout),
        )
        .route(
            "/rollouts/{ns}/{name}",
            get(rollout_handlers::get_rollout).delete(rollout_handlers::delete_rollout),
        )
        .route(
            "/rollouts/{ns}/{name}/replicasets",
            get(rollout_handlers::list_replica_sets),
        )
        .route("/rollouts/{ns}/{name}/{action}", post(rollout_handlers::rollout_action))
        .route(
            "/analysistemplates",
            get(handlers::list_templates).post(handlers::apply_template),
        )
        .route("/analysisruns", get(handlers::list_analysis_runs))
        .route("/services", get(handlers::list_services).post(handlers::apply_service))
        .route("/experiments/{ns}/{name}/status", put(handlers::put_experiment_status))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
