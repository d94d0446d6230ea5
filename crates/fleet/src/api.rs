//! HTTP API for health checks, Prometheus metrics and workload placement

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use fleet_lib::{
    health::{ComponentStatus, HealthRegistry},
    quantity::deserialize_bytes,
    AdmissionDecision, FleetError, FleetSupervisor, ResourceRequest,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<FleetSupervisor>,
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(supervisor: Arc<FleetSupervisor>, health_registry: HealthRegistry) -> Self {
        Self {
            supervisor,
            health_registry,
        }
    }
}

/// Body of a placement request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub workload_id: String,
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default, deserialize_with = "deserialize_bytes")]
    pub memory_bytes: u64,
    #[serde(default)]
    pub gpu_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Errors returned by API handlers
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::UnknownAgent(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        ApiError::Internal(e.to_string())
    })?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    ))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.summaries().await)
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.supervisor.agent(&agent)?;
    Ok(Json(handle.summary().await))
}

async fn list_placements(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.supervisor.agent(&agent)?;
    Ok(Json(handle.placements().await))
}

/// SubmitPlacement: 200 when admitted, 409 when rejected
async fn submit_placement(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(body): Json<PlacementRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.workload_id.trim().is_empty() {
        return Err(ApiError::BadRequest("workload_id must not be empty".to_string()));
    }

    let request = ResourceRequest::new(body.cpu_millis, body.memory_bytes, body.gpu_count);
    let decision = state
        .supervisor
        .submit_placement(&agent, &body.workload_id, request)
        .await?;

    let status_code = match decision {
        AdmissionDecision::Admitted { .. } => StatusCode::OK,
        AdmissionDecision::Rejected { .. } => StatusCode::CONFLICT,
    };
    Ok((status_code, Json(decision)))
}

/// ReleasePlacement: always 204 for a known agent
async fn release_placement(
    State(state): State<Arc<AppState>>,
    Path((agent, workload)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .supervisor
        .release_placement(&agent, &workload)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/agents/:agent", get(get_agent))
        .route(
            "/api/v1/agents/:agent/placements",
            get(list_placements).post(submit_placement),
        )
        .route(
            "/api/v1/agents/:agent/placements/:workload",
            delete(release_placement),
        )
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
