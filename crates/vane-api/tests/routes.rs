//! Router-level tests: requests go through `build_router` the way the
//! daemon serves them.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use vane_api::{ApiState, build_router};
use vane_metrics::ControllerMetrics;
use vane_state::*;

fn test_store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

fn router(store: &StateStore) -> axum::Router {
    build_router(ApiState::new(store.clone(), ControllerMetrics::new()))
}

fn test_rollout() -> Rollout {
    Rollout {
        metadata: ObjectMeta::new("default", "web"),
        spec: RolloutSpec {
            replicas: 2,
            template: PodTemplate {
                labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
                containers: vec![Container {
                    name: "app".to_string(),
                    image: "web:v1".to_string(),
                    ..Default::default()
                }],
            },
            strategy: RolloutStrategy::BlueGreen(BlueGreenStrategy {
                active_service: "web-active".to_string(),
                auto_promotion_enabled: true,
                scale_down_delay_seconds: 30,
                ..Default::default()
            }),
            paused: false,
            revision_history_limit: 10,
            progress_deadline_seconds: 600,
            progress_deadline_abort: true,
        },
        status: RolloutStatus::default(),
    }
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn list_rollouts_empty() {
    let store = test_store();
    let resp = router(&store).oneshot(get("/api/v1/rollouts")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], serde_json::json!([]));
}

#[tokio::test]
async fn apply_and_get_rollout() {
    let store = test_store();
    let app = router(&store);

    let resp = app
        .clone()
        .oneshot(post_json("/api/v1/rollouts", &test_rollout()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = app.oneshot(get("/api/v1/rollouts/default/web")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"]["metadata"]["name"], "web");
    assert_eq!(body["data"]["spec"]["strategy"]["blueGreen"]["activeService"], "web-active");
    assert!(!body["data"]["metadata"]["uid"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_rollout_is_rejected() {
    let store = test_store();
    let req = post_json("/api/v1/rollouts", &serde_json::json!({ "metadata": { "name": "web" } }));
    let resp = router(&store).oneshot(req).await.unwrap();
    assert!(resp.status().is_client_error());
    assert!(store.list::<Rollout>().unwrap().is_empty());
}

#[tokio::test]
async fn replica_sets_are_filtered_by_owner() {
    let store = test_store();
    let rollout = store.create(test_rollout()).unwrap();

    let mut owned = ObjectMeta::new("default", "web-abc");
    owned.owner = Some(OwnerRef {
        kind: "Rollout".to_string(),
        name: "web".to_string(),
        uid: rollout.metadata.uid.clone(),
    });
    for metadata in [owned, ObjectMeta::new("default", "other-def")] {
        store
            .create(ReplicaSet {
                metadata,
                spec: ReplicaSetSpec {
                    replicas: 1,
                    pod_template_hash: "abc".to_string(),
                    template: PodTemplate::default(),
                },
                status: ReplicaSetStatus::default(),
            })
            .unwrap();
    }

    let resp = router(&store)
        .oneshot(get("/api/v1/rollouts/default/web/replicasets"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|rs| rs["metadata"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["web-abc"]);
}

#[tokio::test]
async fn promote_full_through_query() {
    let store = test_store();
    let created = store.create(test_rollout()).unwrap();
    let mut rollout = created;
    rollout.status.stable_rs = Some("previous".to_string());
    store.update_status(&rollout).unwrap();

    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/rollouts/default/web/promote?full=true")
        .body(Body::empty())
        .unwrap();
    let resp = router(&store).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let stored: Rollout = store.get("default/web").unwrap().unwrap();
    assert!(stored.status.promote_full);
}

#[tokio::test]
async fn action_on_missing_rollout() {
    let store = test_store();
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/rollouts/default/nope/abort")
        .body(Body::empty())
        .unwrap();
    let resp = router(&store).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = body_json(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "rollout not found");
}

#[tokio::test]
async fn apply_template_and_service() {
    let store = test_store();
    let app = router(&store);

    let mut metric = Metric::new("success-rate", "web");
    metric.success_condition = Some("result >= 0.95".to_string());
    let template = AnalysisTemplate {
        metadata: ObjectMeta::new("default", "success-rate"),
        spec: AnalysisTemplateSpec {
            metrics: vec![metric],
            args: vec![],
        },
    };
    let resp = app
        .clone()
        .oneshot(post_json("/api/v1/analysistemplates", &template))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let service = Service {
        metadata: ObjectMeta::new("default", "web-active"),
        spec: ServiceSpec::default(),
    };
    let resp = app
        .clone()
        .oneshot(post_json("/api/v1/services", &service))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = app.oneshot(get("/api/v1/analysistemplates")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn metrics_include_rollout_phase() {
    let store = test_store();
    store.create(test_rollout()).unwrap();

    let resp = router(&store).oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("vane_rollout_phase{"));
    assert!(text.contains("rollout=\"default/web\""));
}
