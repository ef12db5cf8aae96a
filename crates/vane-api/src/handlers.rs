//! REST API handlers for analysis templates, analysis runs, services,
//! experiments and the metrics endpoint.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};

use vane_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a store error to the matching HTTP status.
pub(crate) fn store_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NotFound { .. } => StatusCode::NOT_FOUND,
        StateError::AlreadyExists { .. } | StateError::Conflict { .. } => StatusCode::CONFLICT,
        StateError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// Create `obj` or update it in place. Answers 201 for a new object.
pub(crate) fn apply_object<R: Resource + serde::Serialize>(store: &StateStore, obj: R) -> Response {
    let key = obj.meta().key();
    let existed = match store.get::<R>(&key) {
        Ok(existing) => existing.is_some(),
        Err(e) => return store_error(&e),
    };
    match store.apply(obj) {
        Ok(stored) => {
            info!(kind = %R::KIND, %key, created = !existed, "object applied");
            let status = if existed { StatusCode::OK } else { StatusCode::CREATED };
            (status, ApiResponse::ok(stored)).into_response()
        }
        Err(e) => store_error(&e),
    }
}

fn list_objects<R: Resource + serde::Serialize>(store: &StateStore) -> Response {
    match store.list::<R>() {
        Ok(objects) => ApiResponse::ok(objects).into_response(),
        Err(e) => store_error(&e),
    }
}

// ── Analysis templates ─────────────────────────────────────────

/// GET /api/v1/analysistemplates
pub async fn list_templates(State(state): State<ApiState>) -> impl IntoResponse {
    list_objects::<AnalysisTemplate>(&state.store)
}

/// POST /api/v1/analysistemplates
pub async fn apply_template(
    State(state): State<ApiState>,
    Json(template): Json<AnalysisTemplate>,
) -> impl IntoResponse {
    apply_object(&state.store, template)
}

// ── Analysis runs ──────────────────────────────────────────────

/// GET /api/v1/analysisruns
pub async fn list_analysis_runs(State(state): State<ApiState>) -> impl IntoResponse {
    list_objects::<AnalysisRun>(&state.store)
}

// ── Services ───────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    list_objects::<Service>(&state.store)
}

/// POST /api/v1/services
pub async fn apply_service(
    State(state): State<ApiState>,
    Json(service): Json<Service>,
) -> impl IntoResponse {
    apply_object(&state.store, service)
}

// ── Experiments ────────────────────────────────────────────────

/// PUT /api/v1/experiments/:ns/:name/status
///
/// Experiments run outside Vane; whatever runs them reports back here.
pub async fn put_experiment_status(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
    Json(status): Json<ExperimentStatus>,
) -> impl IntoResponse {
    let key = object_key(&ns, &name);
    let mut experiment = match state.store.get::<Experiment>(&key) {
        Ok(Some(experiment)) => experiment,
        Ok(None) => return error_response("experiment not found", StatusCode::NOT_FOUND),
        Err(e) => return store_error(&e),
    };
    debug!(%key, phase = %status.phase, "experiment status reported");
    experiment.status = status;
    match state.store.update_status(&experiment) {
        Ok(stored) => ApiResponse::ok(stored).into_response(),
        Err(e) => store_error(&e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let rollouts = state.store.list::<Rollout>().unwrap_or_default();
    let body = vane_metrics::render_prometheus(&state.metrics.snapshot(), &rollouts);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use vane_metrics::ControllerMetrics;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        ApiState::new(store, ControllerMetrics::new())
    }

    fn test_service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta::new("default", name),
            spec: ServiceSpec {
                selector: BTreeMap::from([("app".to_string(), "web".to_string())]),
                port: Some(8080),
            },
        }
    }

    fn test_experiment(name: &str) -> Experiment {
        Experiment {
            metadata: ObjectMeta::new("default", name),
            spec: ExperimentSpec::default(),
            status: ExperimentStatus::default(),
        }
    }

    #[tokio::test]
    async fn apply_service_creates_then_updates() {
        let state = test_state();

        let resp = apply_service(State(state.clone()), Json(test_service("web"))).await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);

        let mut changed = test_service("web");
        changed.spec.port = Some(9090);
        let resp = apply_service(State(state.clone()), Json(changed)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let stored: Service = state.store.get("default/web").unwrap().unwrap();
        assert_eq!(stored.spec.port, Some(9090));
    }

    #[tokio::test]
    async fn list_analysis_runs_empty() {
        let state = test_state();
        let resp = list_analysis_runs(State(state)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn experiment_status_is_recorded() {
        let state = test_state();
        state.store.create(test_experiment("web-exp")).unwrap();

        let status = ExperimentStatus {
            phase: AnalysisPhase::Successful,
            message: "variants healthy".to_string(),
        };
        let resp = put_experiment_status(
            State(state.clone()),
            Path(("default".to_string(), "web-exp".to_string())),
            Json(status),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let stored: Experiment = state.store.get("default/web-exp").unwrap().unwrap();
        assert_eq!(stored.status.phase, AnalysisPhase::Successful);
    }

    #[tokio::test]
    async fn experiment_status_for_missing_experiment() {
        let state = test_state();
        let resp = put_experiment_status(
            State(state),
            Path(("default".to_string(), "nope".to_string())),
            Json(ExperimentStatus::default()),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state();
        let resp = prometheus_metrics(State(state)).await;
        let resp = resp.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
