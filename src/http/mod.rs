//! Worker HTTP application
//!
//! The application every worker serves: a health check, the `/verify`
//! endpoint (JSON or urlencoded form bodies), a JSON 404 fallback and a
//! handler for malformed JSON bodies, wrapped in request tracing, CORS and
//! security headers.
//!
//! [`serve`] runs it on any [`axum::serve::Listener`], so the same app works
//! over a plain TCP listener (standalone mode) and over the handoff listener
//! that receives connections from the master.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::shutdown::Shutdown;

/// Required length of a verification code
pub const CODE_LENGTH: usize = 6;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of `POST /verify`
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    /// Any JSON value; only strings can verify
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

/// Urlencoded body of `POST /verify`
#[derive(Debug, Deserialize)]
pub struct VerifyForm {
    #[serde(default)]
    pub code: Option<String>,
}

/// Message body used by every endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pid: u32,
    pub version: &'static str,
}

/// Check a verification code: exactly six UTF-16 code units, the last one not `7`
pub fn is_valid_code(code: &str) -> bool {
    let units: Vec<u16> = code.encode_utf16().collect();
    units.len() == CODE_LENGTH && units[CODE_LENGTH - 1] != u16::from(b'7')
}

// ============================================================================
// Router
// ============================================================================

/// Build the application router with all layers
pub fn build_app() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/verify", post(verify))
        .fallback(not_found)
        .layer(middleware::from_fn(error_report_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(security_header("x-content-type-options", "nosniff"))
        .layer(security_header("x-frame-options", "SAMEORIGIN"))
        .layer(security_header("referrer-policy", "no-referrer"))
        .layer(security_header("x-dns-prefetch-control", "off"))
        .layer(security_header("cross-origin-opener-policy", "same-origin"))
        .layer(security_header(
            "strict-transport-security",
            "max-age=15552000; includeSubDomains",
        ))
        .layer(security_header(
            "content-security-policy",
            "default-src 'self'; frame-ancestors 'self'; object-src 'none'",
        ))
}

fn security_header(name: &'static str, value: &'static str) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::if_not_present(
        HeaderName::from_static(name),
        HeaderValue::from_static(value),
    )
}

/// Serve `app` on `listener` until `shutdown` fires, then finish in-flight requests
pub async fn serve<L>(listener: L, app: Router, shutdown: Shutdown) -> std::io::Result<()>
where
    L: axum::serve::Listener,
    L::Addr: std::fmt::Debug,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.signal())
        .await
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

async fn verify(request: Request) -> Response {
    let code = if is_form(request.headers()) {
        match Form::<VerifyForm>::from_request(request, &()).await {
            Ok(Form(form)) => form.code,
            Err(rejection) => {
                tracing::debug!(error = %rejection.body_text(), "Rejected form body");
                None
            }
        }
    } else {
        match Json::<VerifyRequest>::from_request(request, &()).await {
            Ok(Json(VerifyRequest {
                code: Some(serde_json::Value::String(code)),
            })) => Some(code),
            Ok(_) => None,
            Err(rejection) => return bad_json(rejection),
        }
    };

    match code {
        Some(code) if is_valid_code(&code) => Json(MessageResponse::new("Success")).into_response(),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(MessageResponse::new("Verification Error")),
        )
            .into_response(),
    }
}

fn bad_json(rejection: JsonRejection) -> Response {
    tracing::debug!(error = %rejection.body_text(), "Rejected request body");
    let status = match rejection {
        JsonRejection::JsonSyntaxError(_) | JsonRejection::JsonDataError(_) => StatusCode::BAD_REQUEST,
        other => other.status(),
    };
    (status, Json(MessageResponse::new("Invalid JSON payload"))).into_response()
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(MessageResponse::new("Not found")))
}

// ============================================================================
// Middleware
// ============================================================================

/// Report server errors together with the request that caused them
pub async fn error_report_middleware(request: Request<Body>, next: Next) -> Response {
    let uri = request.uri().clone();
    let method = request.method().clone();
    let headers = request.headers().clone();

    let response = next.run(request).await;

    let status = response.status();
    if status.is_server_error() {
        tracing::error!(
            pid = std::process::id(),
            %method,
            %uri,
            ?headers,
            status = status.as_u16(),
            "App error"
        );
    }

    response
}

// ============================================================================
// Tests
// ============================================================================
