//! JSON-RPC over HTTP transport.
//!
//! - `POST /rpc` takes `{"method": "Libvirt.Create", "params": [{...}], "id": 1}`
//!   and answers `{"result": ..., "error": null, "id": 1}`
//! - `GET /health` reports the backend and pool occupancy

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::service::{LibvirtService, ServiceError};

/// Shared state for HTTP handlers
pub struct AppState {
    pub service: LibvirtService,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub result: Option<Value>,
    pub error: Option<ApiError>,
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    code: String,
    message: String,
}

impl ApiError {
    fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<&ServiceError> for ApiError {
    fn from(e: &ServiceError) -> Self {
        Self::new(e.code(), &e.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    healthy: bool,
    version: String,
    backend: String,
    pool_capacity: usize,
    pool_available: usize,
}

// ============================================================================
// Server
// ============================================================================

/// Start the JSON-RPC server.
pub async fn run_http_server(addr: SocketAddr, service: LibvirtService) -> anyhow::Result<()> {
    let state = Arc::new(AppState { service });
    let app = build_router(state);

    info!(address = %addr, "Starting JSON-RPC server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router with all routes
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /rpc - Call a service method
async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RpcRequest>, JsonRejection>,
) -> (StatusCode, Json<RpcResponse>) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Rejected malformed RPC request");
            return (
                StatusCode::BAD_REQUEST,
                Json(RpcResponse {
                    result: None,
                    error: Some(ApiError::new("invalid_request", &rejection.body_text())),
                    id: Value::Null,
                }),
            );
        }
    };

    let response = match state.service.dispatch(&request.method, request.params).await {
        Ok(result) => RpcResponse {
            result: Some(result),
            error: None,
            id: request.id,
        },
        Err(e) => {
            warn!(method = %request.method, code = e.code(), error = %e, "RPC call failed");
            RpcResponse {
                result: None,
                error: Some(ApiError::from(&e)),
                id: request.id,
            }
        }
    };

    (StatusCode::OK, Json(response))
}

/// GET /health - Backend and pool status
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pool = state.service.manager().pool();

    Json(HealthResponse {
        healthy: !pool.is_closed(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: pool.backend_name().to_string(),
        pool_capacity: pool.capacity(),
        pool_available: pool.available(),
    })
}
