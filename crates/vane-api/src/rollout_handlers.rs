//! REST API handlers for rollout management.
//!
//! Provides endpoints to apply, list, get and delete rollouts, and the user
//! actions: promote, abort, retry, pause and resume. Actions edit the stored
//! rollout; the controller acts on the change in its next pass.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};

use vane_rollout::{PlanResult, actions};
use vane_state::{ReplicaSet, Rollout, RolloutStatus, StateStore, object_key};

use crate::ApiState;
use crate::handlers::{ApiResponse, apply_object, error_response, store_error};

/// Attempts at an action that races with the controller's own writes.
const MAX_ACTION_ATTEMPTS: usize = 5;

/// Query parameters for `POST .../promote`.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ActionParams {
    /// Skip the remaining steps and analysis.
    #[serde(default)]
    pub full: bool,
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list::<Rollout>() {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => store_error(&e),
    }
}

/// POST /api/v1/rollouts
///
/// Creates the rollout or replaces its spec. Status is owned by the
/// controller and ignored here.
pub async fn apply_rollout(
    State(state): State<ApiState>,
    Json(mut rollout): Json<Rollout>,
) -> impl IntoResponse {
    rollout.status = RolloutStatus::default();
    apply_object(&state.store, rollout)
}

/// GET /api/v1/rollouts/:ns/:name
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get::<Rollout>(&object_key(&ns, &name)) {
        Ok(Some(rollout)) => ApiResponse::ok(rollout).into_response(),
        Ok(None) => error_response("rollout not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}

/// DELETE /api/v1/rollouts/:ns/:name
///
/// The controller removes the rollout's replica sets, analysis runs and
/// experiments once it sees the delete.
pub async fn delete_rollout(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = object_key(&ns, &name);
    match state.store.delete::<Rollout>(&key) {
        Ok(true) => {
            info!(rollout = %key, "rollout deleted");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("rollout not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/rollouts/:ns/:name/replicasets
pub async fn list_replica_sets(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let rollout = match state.store.get::<Rollout>(&object_key(&ns, &name)) {
        Ok(Some(rollout)) => rollout,
        Ok(None) => return error_response("rollout not found", StatusCode::NOT_FOUND),
        Err(e) => return store_error(&e),
    };
    match state.store.list_in_namespace::<ReplicaSet>(&ns) {
        Ok(all) => {
            let owned: Vec<ReplicaSet> = all
                .into_iter()
                .filter(|rs| rs.metadata.is_owned_by(&rollout.metadata.uid))
                .collect();
            ApiResponse::ok(owned).into_response()
        }
        Err(e) => store_error(&e),
    }
}

/// POST /api/v1/rollouts/:ns/:name/:action
pub async fn rollout_action(
    State(state): State<ApiState>,
    Path((ns, name, action)): Path<(String, String, String)>,
    Query(params): Query<ActionParams>,
) -> impl IntoResponse {
    let key = object_key(&ns, &name);
    let now = state.clock.now();
    let store = &state.store;
    let result = match action.as_str() {
        "promote" => edit_rollout(store, &key, Target::Status, |r| {
            actions::promote(r, params.full)
        }),
        "abort" => edit_rollout(store, &key, Target::Status, |r| actions::abort(r, now)),
        "retry" => edit_rollout(store, &key, Target::Status, actions::retry),
        "pause" => edit_rollout(store, &key, Target::Spec, |r| {
            actions::pause(r);
            Ok(())
        }),
        "resume" => edit_rollout(store, &key, Target::Spec, |r| {
            actions::resume(r);
            Ok(())
        }),
        other => {
            return error_response(&format!("unknown action {other:?}"), StatusCode::NOT_FOUND);
        }
    };
    match result {
        Ok(rollout) => {
            info!(rollout = %key, %action, full = params.full, "user action applied");
            ApiResponse::ok(rollout).into_response()
        }
        Err(resp) => resp,
    }
}

#[derive(Clone, Copy)]
enum Target {
    Spec,
    Status,
}

/// Read the rollout, apply `action` and write it back, starting over when
/// the controller wrote in between.
fn edit_rollout(
    store: &StateStore,
    key: &str,
    target: Target,
    action: impl Fn(&mut Rollout) -> PlanResult<()>,
) -> Result<Rollout, Response> {
    for attempt in 1..=MAX_ACTION_ATTEMPTS {
        let mut rollout = match store.get::<Rollout>(key) {
            Ok(Some(rollout)) => rollout,
            Ok(None) => return Err(error_response("rollout not found", StatusCode::NOT_FOUND)),
            Err(e) => return Err(store_error(&e)),
        };
        if let Err(e) = action(&mut rollout) {
            return Err(error_response(&e.to_string(), StatusCode::CONFLICT));
        }
        let written = match target {
            Target::Spec => store.update(rollout),
            Target::Status => store.update_status(&rollout),
        };
        match written {
            Ok(stored) => return Ok(stored),
            Err(e) if e.is_conflict() => debug!(rollout = %key, attempt, "action raced a write"),
            Err(e) => return Err(store_error(&e)),
        }
    }
    Err(error_response(
        "rollout kept changing, try again",
        StatusCode::CONFLICT,
    ))
}
