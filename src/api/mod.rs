//! HTTP transport for the master
//!
//! Exposes resource mutations, leader info, health and metrics. A follower
//! that receives a mutation relays it once to the leader address embedded in
//! the cached leader identity.

pub mod forward;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::master::{Leadership, MasterCoordinator, MasterError, NodeSpec};

pub use forward::{ForwardError, Forwarder, FORWARDED_HEADER};

// ============================================================================
// API Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddResourceRequest {
    pub name: String,
}

/// Worker chosen for a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub address: String,
}

impl From<&NodeSpec> for NodeInfo {
    fn from(spec: &NodeSpec) -> Self {
        Self {
            id: spec.node.id.clone(),
            address: spec.node.address.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub id: String,
    pub is_leader: bool,
    pub leader: Option<String>,
    pub leader_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub is_leader: bool,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Failed to build forwarding client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Failed to bind {address}: {message}")]
    Bind { address: String, message: String },

    #[error("Server error: {0}")]
    Serve(String),
}

// ============================================================================
// State & Server
// ============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub master: Arc<MasterCoordinator>,
    pub forwarder: Forwarder,
    pub start_time: Instant,
}

pub struct ApiServer {
    state: ApiState,
}

impl ApiServer {
    pub fn new(master: Arc<MasterCoordinator>, forward_timeout: Duration) -> Result<Self, ApiError> {
        Ok(Self {
            state: ApiState {
                master,
                forwarder: Forwarder::new(forward_timeout)?,
                start_time: Instant::now(),
            },
        })
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Bind the advertised address; `:port` listens on all interfaces
    pub async fn bind(address: &str) -> Result<TcpListener, ApiError> {
        let bind = bind_address(address);
        TcpListener::bind(&bind).await.map_err(|e| ApiError::Bind {
            address: bind,
            message: e.to_string(),
        })
    }

    /// Serve until `cancel` fires
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<(), ApiError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "Master API listening");
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| ApiError::Serve(e.to_string()))?;
        tracing::info!("Master API shutdown complete");
        Ok(())
    }
}

/// Socket address to listen on for an advertised `host:port` or `:port`
pub fn bind_address(advertised: &str) -> String {
    if advertised.starts_with(':') {
        format!("0.0.0.0{advertised}")
    } else {
        advertised.to_string()
    }
}

// ============================================================================
// Routes
// ============================================================================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/resources", post(add_resource))
        .route("/api/resources/{name}", delete(delete_resource))
        .route("/api/leader", get(leader_info))
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn respond<T: Serialize>(endpoint: &str, status: StatusCode, body: T) -> Response {
    crate::metrics::record_api_request(endpoint, status.as_u16());
    (status, Json(body)).into_response()
}

fn error_status(error: &MasterError) -> StatusCode {
    match error {
        MasterError::UnknownResource(_) => StatusCode::NOT_FOUND,
        MasterError::NotLeader { .. } | MasterError::NoWorkerNodes => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        MasterError::Store(e) if e.is_recoverable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Relay a rejected mutation to the leader, or explain why it cannot be
async fn forward_to_leader(
    state: &ApiState,
    endpoint: &str,
    headers: &HeaderMap,
    method: reqwest::Method,
    segments: &[&str],
    body: Option<serde_json::Value>,
) -> Response {
    let master = &state.master;
    let leader = master.leader_id();

    if headers.contains_key(FORWARDED_HEADER) {
        tracing::warn!(leader = leader.as_deref().unwrap_or(""), "Forwarded request reached a follower");
        return respond(
            endpoint,
            StatusCode::SERVICE_UNAVAILABLE,
            ApiResponse::error("not the leader"),
        );
    }

    let address = match (leader.as_deref(), master.leader_address()) {
        (Some(id), Some(address)) if id != master.id() => address,
        _ => {
            return respond(
                endpoint,
                StatusCode::SERVICE_UNAVAILABLE,
                ApiResponse::error("no leader available"),
            )
        }
    };

    match state.forwarder.forward(&address, method, segments, body).await {
        Ok(response) => {
            crate::metrics::record_api_request(endpoint, response.status().as_u16());
            response
        }
        Err(e) => {
            tracing::error!(leader = %address, error = %e, "Forward to leader failed");
            respond(
                endpoint,
                StatusCode::BAD_GATEWAY,
                ApiResponse::error(format!("forward to leader failed: {e}")),
            )
        }
    }
}

async fn add_resource(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<AddResourceRequest>,
) -> Response {
    const ENDPOINT: &str = "add_resource";

    let name = request.name.trim();
    if name.is_empty() {
        return respond(
            ENDPOINT,
            StatusCode::BAD_REQUEST,
            ApiResponse::error("resource name cannot be empty"),
        );
    }

    match state.master.add_resource(name).await {
        Ok(spec) => respond(ENDPOINT, StatusCode::OK, ApiResponse::success(NodeInfo::from(&spec))),
        Err(MasterError::NotLeader { .. }) => {
            let body = serde_json::json!({ "name": name });
            forward_to_leader(
                &state,
                ENDPOINT,
                &headers,
                reqwest::Method::POST,
                &["api", "resources"],
                Some(body),
            )
            .await
        }
        Err(e) => {
            tracing::error!(resource = name, error = %e, "Add resource failed");
            respond(ENDPOINT, error_status(&e), ApiResponse::error(e.to_string()))
        }
    }
}

async fn delete_resource(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    const ENDPOINT: &str = "delete_resource";

    match state.master.delete_resource(&name).await {
        Ok(()) => respond(ENDPOINT, StatusCode::OK, ApiResponse::success(name)),
        Err(MasterError::NotLeader { .. }) => {
            forward_to_leader(
                &state,
                ENDPOINT,
                &headers,
                reqwest::Method::DELETE,
                &["api", "resources", name.as_str()],
                None,
            )
            .await
        }
        Err(e) => {
            tracing::warn!(resource = %name, error = %e, "Delete resource failed");
            respond(ENDPOINT, error_status(&e), ApiResponse::error(e.to_string()))
        }
    }
}

async fn leader_info(State(state): State<ApiState>) -> Response {
    let master = &state.master;
    respond(
        "leader",
        StatusCode::OK,
        ApiResponse::success(LeaderResponse {
            id: master.id().to_string(),
            is_leader: master.is_leader(),
            leader: master.leader_id(),
            leader_address: master.leader_address(),
        }),
    )
}

async fn health_check(State(state): State<ApiState>) -> Response {
    respond(
        "health",
        StatusCode::OK,
        ApiResponse::success(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: state.start_time.elapsed().as_secs(),
            is_leader: state.master.is_leader(),
        }),
    )
}

async fn metrics() -> Response {
    match crate::metrics::encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================
