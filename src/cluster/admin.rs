//! Master admin API
//!
//! Optional HTTP endpoints served by the master on a separate address:
//! health, the worker table, and Prometheus metrics. Never exposed on the
//! public port, which only carries client connections.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::handle::WorkerInfo;
use super::registry::{RegistryReader, RegistryStats};
use crate::error::Result;
use crate::metrics;
use crate::shutdown::Shutdown;

// ============================================================================
// App State
// ============================================================================

/// Shared admin state
#[derive(Clone)]
pub struct AdminState {
    /// Read-only worker registry
    pub registry: RegistryReader,

    /// Configured pool size
    pub expected_workers: usize,

    /// Master start time
    pub start_time: Instant,
}

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
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

/// Overall pool health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Derive from ready vs. expected worker counts
    pub fn from_counts(ready: usize, expected: usize) -> Self {
        if ready == 0 {
            Self::Unhealthy
        } else if ready < expected {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub ready_workers: usize,
    pub expected_workers: usize,
    /// Percentage of registered workers that are ready
    pub availability: f64,
}

/// Worker list response
#[derive(Debug, Serialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerInfo>,
    pub stats: RegistryStats,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the admin router
pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/workers", get(list_workers))
        .route("/api/workers/{pid}", get(get_worker))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin API until shutdown
pub async fn serve(addr: SocketAddr, state: AdminState, shutdown: Shutdown) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Admin API listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown.signal())
        .await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check(State(state): State<AdminState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    let ready = stats.ready;
    let status = HealthStatus::from_counts(ready, state.expected_workers);

    (
        status.status_code(),
        Json(ApiResponse::success(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: state.start_time.elapsed().as_secs(),
            ready_workers: ready,
            expected_workers: state.expected_workers,
            availability: stats.availability(),
        })),
    )
}

async fn list_workers(State(state): State<AdminState>) -> impl IntoResponse {
    let workers = state.registry.all().await;
    let stats = state.registry.stats().await;

    Json(ApiResponse::success(WorkersResponse { workers, stats }))
}

async fn get_worker(
    State(state): State<AdminState>,
    Path(pid): Path<u32>,
) -> axum::response::Response {
    match state.registry.get(pid).await {
        Some(info) => (StatusCode::OK, Json(ApiResponse::success(info))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Worker not found: {}", pid))),
        )
            .into_response(),
    }
}

async fn prometheus_metrics() -> axum::response::Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        )
            .into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================
