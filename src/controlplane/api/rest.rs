//! REST API Handlers
//!
//! Implements the REST endpoints for cluster, node and device management.
//! Long-running operations answer `202 Accepted` with a `Location` pointing
//! at `/queue/{job}`, which callers poll until the job settles.

use crate::controlplane::{JobStatus, Orchestrator};
use crate::domain::ports::{DeviceAddRequest, NodeAddRequest, StateRequest};
use crate::error::{Error, ErrorKind};
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Header set on queue responses while a job is still running
pub const PENDING_HEADER: &str = "X-Pending";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Cluster list response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterListResponse {
    pub clusters: Vec<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

impl ApiErrorResponse {
    fn status(kind: ErrorKind) -> StatusCode {
        match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidStateTransition | ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::ExternalOperation | ErrorKind::ConsistencyFault | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

fn error_response(e: Error) -> Response {
    let kind = e.kind();
    let status = ApiErrorResponse::status(kind);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    (
        status,
        Json(ApiErrorResponse {
            error: kind.to_string(),
            message: e.to_string(),
        }),
    )
        .into_response()
}

fn accepted(job_id: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, format!("/queue/{}", job_id))],
    )
        .into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Cluster endpoints
            .route("/clusters", post(create_cluster).get(list_clusters))
            .route("/clusters/:id", get(get_cluster).delete(delete_cluster))
            // Node endpoints
            .route("/nodes", post(add_node))
            .route("/nodes/:id", get(get_node).delete(delete_node))
            .route("/nodes/:id/resync", post(resync_node))
            // Device endpoints
            .route("/devices", post(add_device))
            .route("/devices/:id", get(get_device).delete(delete_device))
            .route("/devices/:id/state", post(set_device_state))
            .route("/devices/:id/resync", post(resync_device))
            // Async operation queue
            .route("/queue/:id", get(get_queue))
            // Health endpoint
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

// =============================================================================
// Cluster Handlers
// =============================================================================

async fn create_cluster(State(state): State<AppState>) -> Response {
    match state.orchestrator.create_cluster() {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_clusters(State(state): State<AppState>) -> Response {
    match state.orchestrator.list_clusters() {
        Ok(clusters) => (StatusCode::OK, Json(ClusterListResponse { clusters })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_cluster(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.cluster_info(&id) {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_cluster(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.delete_cluster(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn add_node(
    State(state): State<AppState>,
    Json(request): Json<NodeAddRequest>,
) -> Response {
    info!("Adding node to cluster {}", request.cluster_id);
    match state.orchestrator.add_node(request) {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.node_info(&id) {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.delete_node(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn resync_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.resync_node(&id) {
        Ok(Some(job)) => accepted(&job),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Device Handlers
// =============================================================================

async fn add_device(
    State(state): State<AppState>,
    Json(request): Json<DeviceAddRequest>,
) -> Response {
    info!("Adding device {} to node {}", request.name, request.node_id);
    match state.orchestrator.add_device(request) {
        Ok(job) => accepted(&job),
        Err(e) => error_response(e),
    }
}

async fn get_device(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.device_info(&id) {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_device(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.delete_device(&id).await {
        Ok(job) => accepted(&job),
        Err(e) => error_response(e),
    }
}

async fn set_device_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StateRequest>,
) -> Response {
    match state.orchestrator.set_device_state(&id, request.state).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn resync_device(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.resync_device(&id) {
        Ok(job) => accepted(&job),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Queue Handler
// =============================================================================

async fn get_queue(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let record = match state.orchestrator.jobs().status(&id) {
        Ok(record) => record,
        Err(e) => return error_response(e),
    };

    match record.status {
        JobStatus::Pending => (StatusCode::OK, [(PENDING_HEADER, "true")]).into_response(),
        JobStatus::Completed {
            location: Some(location),
        } => (StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response(),
        JobStatus::Completed { location: None } => StatusCode::NO_CONTENT.into_response(),
        JobStatus::Failed { error } => (StatusCode::INTERNAL_SERVER_ERROR, error).into_response(),
    }
}

// =============================================================================
// Health
// =============================================================================

async fn health_check(State(state): State<AppState>) -> Response {
    match state.orchestrator.status() {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(e),
    }
}
