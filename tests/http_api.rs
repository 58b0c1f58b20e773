//! Admin API end to end through the router

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::{harness, NodeBehavior};
use serde_json::{json, Value};
use shardplace::coordinator::http::{create_router, CoordState};
use shardplace::coordinator::leader::Leadership;
use std::sync::Arc;
use tower::ServiceExt;

fn router(behavior: NodeBehavior) -> axum::Router {
    let h = harness(behavior);
    let leadership = Arc::new(Leadership::new("coord-1"));
    leadership.become_leader();
    create_router(CoordState {
        provisioner: Arc::new(h.provisioner),
        leadership,
    })
}

async fn call(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_add_replica_over_http() {
    let app = router(NodeBehavior::Succeed);
    let (status, body) = call(
        &app,
        "POST",
        "/admin/collections/books/replicas",
        Some(json!({ "shard": "shard2", "type": "pull", "node": "n3" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["collection"], "books");
    assert_eq!(body["shard"], "shard2");
    assert_eq!(body["node"], "n3");
    assert_eq!(body["core"], "books_shard2_replica_p1");

    let (status, state) = call(&app, "GET", "/cluster/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        state["collections"]["books"]["shards"]["shard2"]["replicas"]["core_node1"]["state"],
        "down"
    );
}

#[tokio::test]
async fn test_errors_carry_kind_and_status() {
    let app = router(NodeBehavior::Succeed);
    let (status, body) = call(
        &app,
        "POST",
        "/admin/collections/movies/replicas",
        Some(json!({ "shard": "shard1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
    assert!(body["error"].as_str().unwrap().contains("movies"));

    let (status, body) = call(
        &app,
        "POST",
        "/admin/collections/books/replicas",
        Some(json!({ "shard": "shard1", "wait_for_final_state": true, "timeout_secs": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["kind"], "timeout");
}

#[tokio::test]
async fn test_dispatch_failure_reports_state_recorded() {
    let app = router(NodeBehavior::Fail);
    let (status, body) = call(
        &app,
        "POST",
        "/admin/collections/books/replicas",
        Some(json!({ "shard": "shard1" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "server_error");
    assert_eq!(body["state_recorded"], true);
}

#[tokio::test]
async fn test_async_status_lifecycle() {
    let app = router(NodeBehavior::Succeed);
    let (status, body) = call(
        &app,
        "POST",
        "/admin/collections/books/replicas",
        Some(json!({ "shard": "shard1", "async_id": "req-7" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["async_id"], "req-7");

    let (status, body) = call(&app, "GET", "/admin/requests/req-7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");

    let (status, _) = call(&app, "DELETE", "/admin/requests/req-7", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = call(&app, "GET", "/admin/requests/req-7", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["state"], "notfound");
}

#[tokio::test]
async fn test_collection_and_membership_endpoints() {
    let app = router(NodeBehavior::Succeed);
    let (status, body) = call(
        &app,
        "POST",
        "/admin/collections",
        Some(json!({ "name": "logs", "shards": ["a", "b"], "router": "implicit" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["router"], "implicit");
    assert_eq!(body["config_name"], "_default");

    let (status, _) = call(
        &app,
        "POST",
        "/admin/collections",
        Some(json!({ "name": "logs", "shards": ["a"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        "POST",
        "/cluster/nodes",
        Some(json!({ "node": "n4", "base_url": "http://n4:8983" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, status_body) = call(&app, "GET", "/admin/status", None).await;
    assert_eq!(status_body["live_nodes"].as_array().unwrap().len(), 4);
    assert_eq!(status_body["nb_collections"], 2);

    let (status, _) = call(&app, "DELETE", "/cluster/nodes/n4", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, status_body) = call(&app, "GET", "/admin/status", None).await;
    assert_eq!(status_body["live_nodes"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_replica_state_report_activates_replica() {
    let app = router(NodeBehavior::Succeed);
    let (_, added) = call(
        &app,
        "POST",
        "/admin/collections/books/replicas",
        Some(json!({ "shard": "shard1", "name": "c1", "node": "n1" })),
    )
    .await;
    assert_eq!(added["core"], "c1");

    let (status, _) = call(
        &app,
        "POST",
        "/cluster/replicas/state",
        Some(json!({ "collection": "books", "core": "c1", "state": "active" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, state) = call(&app, "GET", "/cluster/state", None).await;
    let replica = &state["collections"]["books"]["shards"]["shard1"]["replicas"]["core_node1"];
    assert_eq!(replica["core"], "c1");
    assert_eq!(replica["state"], "active");
}
