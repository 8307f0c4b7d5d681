//! HTTP surface for code submissions.
//!
//! | Route | Method | Purpose |
//! |---|---|---|
//! | `/health` | GET | daemon liveness |
//! | `/submit` | POST | run `{"code": "..."}` and return its output |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use forge_config::Config;
use forge_core::{ping_within, Executor};
use forge_types::{ExecutionRequest, ForgeError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const EXIT_CODE_HEADER: &str = "x-forge-exit-code";
pub const TRUNCATED_HEADER: &str = "x-forge-truncated";

const HEALTHY: &str = "The Forge is active";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
    pub image: String,
    pub command: Vec<String>,
    pub timeout: Duration,
    pub max_code_size: usize,
    pub ping_timeout: Duration,
}

impl AppState {
    pub fn from_config(executor: Arc<Executor>, config: &Config) -> Self {
        Self {
            executor,
            image: config.image.clone(),
            command: config.command.clone(),
            timeout: config.execution_timeout(),
            max_code_size: config.max_code_size,
            ping_timeout: config.ping_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Submission {
    #[serde(default)]
    code: String,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/submit", post(submit).fallback(post_only))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves; in-flight requests are drained.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Starting HTTP server");
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Response {
    match ping_within(state.executor.runtime().as_ref(), state.ping_timeout).await {
        Ok(()) => (StatusCode::OK, HEALTHY).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn post_only() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, "Only POST method is allowed").into_response()
}

async fn submit(State(state): State<AppState>, body: Bytes) -> Response {
    let submission: Submission = match serde_json::from_slice(&body) {
        Ok(s) => s,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid JSON Format").into_response(),
    };
    if submission.code.is_empty() {
        return (StatusCode::BAD_REQUEST, "Code cannot be empty").into_response();
    }
    if submission.code.len() > state.max_code_size {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Code exceeds {} bytes", state.max_code_size),
        )
            .into_response();
    }

    info!(bytes = submission.code.len(), image = %state.image, "Received submission");
    let request = ExecutionRequest::new(submission.code, state.image, state.command);

    match state.executor.execute(&request, state.timeout).await {
        Ok(result) => {
            let mut response = (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                result.output,
            )
                .into_response();
            let headers = response.headers_mut();
            if let Some(code) = result.exit_code {
                headers.insert(EXIT_CODE_HEADER, HeaderValue::from(code));
            }
            if result.truncated {
                headers.insert(TRUNCATED_HEADER, HeaderValue::from_static("true"));
            }
            response
        }
        Err(e) => {
            warn!(kind = e.kind(), error = %e, "Submission failed");
            (status_for(&e), format!("Execution Failed: {e}")).into_response()
        }
    }
}

/// HTTP status for an execution error.
pub fn status_for(err: &ForgeError) -> StatusCode {
    match err {
        ForgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ForgeError::Connection(_) | ForgeError::ImageNotFound(_) | ForgeError::ImageCheck(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
