//! HTTP API for the coordinator
//!
//! Admin endpoints:
//! - `POST /admin/collections/:collection/replicas` add a replica
//! - `GET|DELETE /admin/requests/:async_id` async request status
//! - `POST /admin/collections` create a collection
//! - `GET /admin/status`, `GET /health`
//!
//! Node-facing endpoints:
//! - `POST /cluster/nodes`, `DELETE /cluster/nodes/:node` live-node membership
//! - `POST /cluster/replicas/state` replica state reports
//! - `GET /cluster/state` current cluster state snapshot

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::Error;
use crate::coordinator::add_replica::{AddReplicaRequest, ReplicaProvisioner};
use crate::coordinator::cluster_state::{Collection, ReplicaState};
use crate::coordinator::leader::Leadership;
use crate::coordinator::routing::Router as ShardRouter;
use crate::coordinator::state_queue::Mutation;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 1024 * 1024;

type ApiResult<T> = std::result::Result<T, Error>;

/// Shared coordinator state for HTTP handlers.
#[derive(Clone)]
pub struct CoordState {
    pub provisioner: Arc<ReplicaProvisioner>,
    pub leadership: Arc<Leadership>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let mut body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let Error::Dispatch { state_recorded, .. } = &self {
            body["state_recorded"] = json!(state_recorded);
        }
        if let Error::NotLeader(leader) = &self {
            body["leader"] = json!(leader);
        }
        (status, Json(body)).into_response()
    }
}

/// Creates the HTTP router with all public endpoints.
pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        // Admin API
        .route("/admin/status", axum::routing::get(admin_status))
        .route("/admin/collections", axum::routing::post(create_collection))
        .route(
            "/admin/collections/:collection/replicas",
            axum::routing::post(add_replica),
        )
        .route(
            "/admin/requests/:async_id",
            axum::routing::get(request_status).delete(delete_request_status),
        )
        // Node-facing API
        .route("/cluster/state", axum::routing::get(cluster_state))
        .route("/cluster/nodes", axum::routing::post(register_node))
        .route("/cluster/nodes/:node", axum::routing::delete(remove_node))
        .route(
            "/cluster/replicas/state",
            axum::routing::post(report_replica_state),
        )
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "role": state.leadership.role().to_string(),
        "is_leader": state.leadership.is_leader(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Admin endpoint: returns minimal cluster status
async fn admin_status(State(state): State<CoordState>) -> impl IntoResponse {
    let snapshot = state.provisioner.store().snapshot();
    let nb_replicas: usize = snapshot
        .collections
        .values()
        .map(|c| c.replicas().count())
        .sum();
    axum::Json(json!({
        "node_id": state.leadership.node_id(),
        "role": state.leadership.role().to_string(),
        "is_leader": state.leadership.is_leader(),
        "leader": state.leadership.leader(),
        "term": state.leadership.term(),
        "state_version": snapshot.version,
        "nb_collections": snapshot.collections.len(),
        "nb_replicas": nb_replicas,
        "live_nodes": snapshot.live_nodes.keys().collect::<Vec<_>>(),
        "active_watches": state.provisioner.store().watchers().len(),
        "async_requests": state.provisioner.tracker().len(),
    }))
}

async fn add_replica(
    State(state): State<CoordState>,
    Path(collection): Path<String>,
    Json(mut request): Json<AddReplicaRequest>,
) -> ApiResult<impl IntoResponse> {
    state.leadership.ensure_leader()?;
    request.collection = collection;
    let response = state.provisioner.add_replica(request).await?;
    let status = if response.async_id.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

async fn request_status(
    State(state): State<CoordState>,
    Path(async_id): Path<String>,
) -> Response {
    match state.provisioner.tracker().get(&async_id) {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "async_id": async_id, "state": "notfound" })),
        )
            .into_response(),
    }
}

async fn delete_request_status(
    State(state): State<CoordState>,
    Path(async_id): Path<String>,
) -> impl IntoResponse {
    match state.provisioner.tracker().remove(&async_id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

fn default_config_name() -> String {
    "_default".to_string()
}

#[derive(Debug, Deserialize)]
struct CreateCollectionRequest {
    name: String,
    #[serde(default = "default_config_name")]
    config_name: String,
    #[serde(default)]
    router: ShardRouter,
    shards: Vec<String>,
    #[serde(default)]
    policy: Option<String>,
    #[serde(default)]
    max_shards_per_node: Option<usize>,
}

async fn create_collection(
    State(state): State<CoordState>,
    Json(req): Json<CreateCollectionRequest>,
) -> ApiResult<impl IntoResponse> {
    state.leadership.ensure_leader()?;
    let mut collection = Collection::new(&req.name, req.config_name, req.router, &req.shards);
    collection.policy = req.policy;
    collection.max_shards_per_node = req.max_shards_per_node;
    state.provisioner.create_collection(collection).await?;

    let created = state.provisioner.store().snapshot();
    Ok((StatusCode::CREATED, Json(created.collection(&req.name).cloned())))
}

async fn cluster_state(State(state): State<CoordState>) -> impl IntoResponse {
    Json(state.provisioner.store().snapshot().as_ref().clone())
}

#[derive(Debug, Deserialize)]
struct RegisterNodeRequest {
    node: String,
    base_url: String,
}

async fn register_node(
    State(state): State<CoordState>,
    Json(req): Json<RegisterNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.node.trim().is_empty() || req.base_url.trim().is_empty() {
        return Err(Error::BadRequest("node and base_url are required".into()));
    }
    state
        .provisioner
        .submit_mutation(&Mutation::NodeLive {
            node: req.node,
            base_url: req.base_url,
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn remove_node(
    State(state): State<CoordState>,
    Path(node): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .provisioner
        .submit_mutation(&Mutation::NodeDown { node })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct ReplicaStateReport {
    collection: String,
    core: String,
    state: ReplicaState,
}

async fn report_replica_state(
    State(state): State<CoordState>,
    Json(report): Json<ReplicaStateReport>,
) -> ApiResult<impl IntoResponse> {
    state
        .provisioner
        .submit_mutation(&Mutation::UpdateReplicaState {
            collection: report.collection,
            core: report.core,
            state: report.state,
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}
