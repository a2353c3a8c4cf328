//! Axum HTTP surface for the Streaming Core and Task Queue: a `Router` built
//! from a shared `AppState`, a request body limit and timeout layered on top,
//! and `axum::serve` driving the listener.

pub mod sse;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::GatewayConfig;
use crate::core::StreamingCore;
use crate::error::StreamError;
use crate::observability::{Observer, PrometheusObserver};
use crate::queue::{Task, TaskQueue, TaskStore};

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<StreamingCore>,
    pub queue: Arc<TaskQueue>,
    pub task_store: Arc<dyn TaskStore>,
    pub observer: Arc<dyn Observer>,
    /// Present only when the observability backend is `prometheus`; backs
    /// `GET /metrics`.
    pub prometheus: Option<Arc<PrometheusObserver>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/task", post(handle_create_task))
        .route("/streams/{stream_id}", get(handle_stream_status))
        .route("/streams/{stream_id}/recovery", get(handle_stream_recovery))
        .route("/streams/{stream_id}/events", get(handle_stream_events))
        .route("/streams/{stream_id}/cancel", post(handle_stream_cancel))
        .route("/stats", get(handle_stats))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Bind and serve the gateway, applying a request body limit and timeout.
pub async fn run_gateway(host: &str, port: u16, gateway_config: &GatewayConfig, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = build_router(state)
        .layer(RequestBodyLimitLayer::new(
            gateway_config.request_body_limit_bytes,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(gateway_config.request_timeout_secs),
        ));

    tracing::info!(%addr, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_response(err: &StreamError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "error_code": format!("{err:?}").split('(').next().unwrap_or("UNKNOWN").to_string(),
        "message": err.to_string(),
    });
    (status, Json(body)).into_response()
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    input: Option<String>,
    bot_name: Option<String>,
    #[serde(rename = "botRef")]
    bot_ref: Option<BotRef>,
}

#[derive(Debug, Deserialize)]
struct BotRef {
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateTaskResponse {
    task_id: String,
}

/// `POST /task` — enqueue a task, returning its id immediately.
async fn handle_create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> Response {
    let now = chrono::Utc::now();
    let task: Task = match state
        .task_store
        .create(
            body.input.unwrap_or_default(),
            body.bot_name,
            body.bot_ref.map(|r| r.name),
            now,
        )
        .await
    {
        Ok(task) => task,
        Err(e) => return error_response(&e),
    };

    state.queue.enqueue(task.id.clone());
    (StatusCode::OK, Json(CreateTaskResponse { task_id: task.id })).into_response()
}

/// `GET /streams/{stream_id}` — current status plus buffer bounds.
async fn handle_stream_status(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Response {
    let status = match state.core.get_stream_status(&stream_id) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    let buffer_stats = state
        .core
        .get_stream(&stream_id)
        .map(|ctx| ctx.buffer.stats())
        .ok();

    Json(json!({
        "status": format!("{:?}", status.status).to_lowercase(),
        "current_offset": status.current_offset,
        "client_count": status.client_count,
        "buffer": buffer_stats.map(|b| json!({
            "min_offset": b.min_offset,
            "max_offset": b.max_offset,
            "size": b.current_size,
        })),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct OffsetQuery {
    offset: Option<u64>,
}

/// `GET /streams/{stream_id}/recovery?offset=N`
async fn handle_stream_recovery(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(params): Query<OffsetQuery>,
) -> Response {
    match state
        .core
        .get_recovery_info(&stream_id, params.offset.unwrap_or(0))
    {
        Ok(info) => Json(json!({
            "can_recover": info.can_recover,
            "min_available": info.buffer_coverage.min_available,
            "max_available": info.buffer_coverage.max_available,
            "missing_count": info.buffer_coverage.missing_count,
            "stream_active": info.stream_active,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /streams/{stream_id}/events?offset=N` (SSE). Terminal streams with a
/// still-buffered history are replayed once then closed; active streams are
/// replayed from `offset` (if given) and then followed live.
async fn handle_stream_events(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(params): Query<OffsetQuery>,
) -> Response {
    let status = match state.core.get_stream_status(&stream_id) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    if status.status.is_terminal() {
        return match state
            .core
            .replay_from_buffer(&stream_id, params.offset.unwrap_or(0))
        {
            Ok(events) => {
                let stream = futures_util::stream::iter(
                    events.into_iter().map(crate::emitter::SseMessage::Event),
                );
                sse::sse_response(stream).into_response()
            }
            Err(StreamError::StreamNotFound(_)) => (
                StatusCode::GONE,
                Json(json!({
                    "error_code": "BUFFER_GONE",
                    "message": "stream is terminal and its buffer has been collected",
                })),
            )
                .into_response(),
            Err(e) => error_response(&e),
        };
    }

    match state
        .core
        .connect_client(&stream_id, None, params.offset)
        .await
    {
        Ok(connected) => {
            sse::sse_response(ReceiverStream::new(connected.receiver)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize, Default)]
struct CancelRequest {
    reason: Option<String>,
}

/// `POST /streams/{stream_id}/cancel`. The body is optional; an empty or
/// absent body cancels with no reason recorded.
async fn handle_stream_cancel(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let reason = serde_json::from_slice::<CancelRequest>(&body)
        .ok()
        .and_then(|b| b.reason);
    match state.core.cancel_stream(&stream_id, reason).await {
        Ok(()) => Json(json!({ "cancelled": true })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /stats` — operator introspection snapshot across streams and tasks.
async fn handle_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.core.stats();
    Json(json!({
        "active_streams": stats.active_streams,
        "total_clients": stats.total_clients,
        "total_streams_created": stats.state.total_streams,
        "streams_completed": stats.state.completed_streams,
        "streams_cancelled": stats.state.cancelled_streams,
        "streams_errored": stats.state.error_streams,
        "running_tasks": state.queue.running_count(),
    }))
}

/// `GET /metrics` — Prometheus text exposition, when that backend is active.
async fn handle_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(observer) => observer.encode().into_response(),
        None => (
            StatusCode::NOT_FOUND,
            "prometheus observability backend is not active",
        )
            .into_response(),
    }
}
