//! Read-only HTTP dashboard.
//!
//! A thin view over [`Queue`] inspection operations: an HTML page at `/`
//! and JSON under `/api/`. No write operations are exposed.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::errors::QueueError;
use crate::queue::Queue;
use crate::schema::{Job, JobState};

#[derive(Clone)]
struct AppState {
    queue: Queue,
}

/// JSON body of `GET /api/stats`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    pending: i64,
    processing: i64,
    completed: i64,
    failed: i64,
    dead: i64,
    total_completed: i64,
    avg_execution_time: f64,
    success_rate: i64,
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    state: Option<String>,
    limit: Option<i64>,
}

/// Plain-text error response, 500 unless a handler says otherwise.
struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(error: QueueError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("../assets/dashboard.html"))
}

async fn stats_handler(
    State(state): State<AppState>,
) -> Result<axum::Json<StatsResponse>, AppError> {
    let metrics = state.queue.metrics().await?;

    Ok(axum::Json(StatsResponse {
        pending: metrics.stats.pending,
        processing: metrics.stats.processing,
        completed: metrics.stats.completed,
        failed: metrics.stats.failed,
        dead: metrics.stats.dead,
        total_completed: metrics.total_completed,
        avg_execution_time: metrics.avg_execution_time_ms,
        success_rate: metrics.success_rate,
    }))
}

async fn jobs_handler(
    State(state): State<AppState>,
    Query(params): Query<JobsQuery>,
) -> Result<axum::Json<Vec<Job>>, AppError> {
    let state_filter = match params.state.as_deref().filter(|s| !s.is_empty()) {
        Some(name) => Some(
            JobState::parse(name)
                .ok_or_else(|| AppError::bad_request(format!("unknown job state: {name}")))?,
        ),
        None => None,
    };
    let limit = params.limit.unwrap_or(50);

    let jobs = state.queue.list(state_filter, limit).await?;
    Ok(axum::Json(jobs))
}

async fn not_found_handler() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Build the dashboard router over a queue handle.
pub fn create_router(queue: Queue) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/jobs", get(jobs_handler))
        .fallback(not_found_handler)
        .with_state(AppState { queue })
}

/// Serve the dashboard until a shutdown signal arrives.
pub async fn serve(
    addr: SocketAddr,
    queue: Queue,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(queue);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Dashboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("Dashboard shutting down");
        })
        .await?;

    Ok(())
}
