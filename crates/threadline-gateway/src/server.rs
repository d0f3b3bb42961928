//! Axum-based HTTP server with SSE streaming.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, patch, post},
};
use futures::StreamExt;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use threadline_core::error::ThreadlineError;
use threadline_core::protocol::{ChatRequest, ChatResult, StopRequest, StopResponse};
use threadline_core::store::Conversation;
use threadline_core::types::{ThreadId, ThreadSettings};

use crate::coordinator::InvocationError;
use crate::state::GatewayState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const THREAD_ID_HEADER: &str = "x-thread-id";

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route("/chat/stop", post(stop_handler))
        .route("/chat/active", get(active_handler))
        .route("/conversations", get(list_conversations_handler))
        .route("/conversations/{thread_id}/settings", patch(update_settings_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the gateway HTTP server.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.bind_addr());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn chat_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResult>, ApiError> {
    let result = state.coordinator.run_once(request).await?;
    Ok(Json(result))
}

async fn chat_stream_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let (thread_id, frames) = state.coordinator.run_streaming(request).await?;
    debug!(%thread_id, "Streaming invocation");

    let sse_stream = frames.map(|frame| {
        let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().data(data))
    });

    let mut response = Sse::new(sse_stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response();

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(value) = HeaderValue::from_str(thread_id.as_str()) {
        headers.insert(THREAD_ID_HEADER, value);
    }

    Ok(response)
}

async fn stop_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<StopRequest>,
) -> Result<Json<StopResponse>, ApiError> {
    let response = state.coordinator.stop(request).await?;
    Ok(Json(response))
}

async fn active_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let threads = state.coordinator.active();
    Json(json!({
        "count": threads.len(),
        "threads": threads,
    }))
}

/// Conversations, most recently active first. API keys are never echoed back.
async fn list_conversations_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let mut conversations = state.store.list().await?;
    conversations.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
    for conversation in &mut conversations {
        conversation.settings.api_key = None;
    }
    Ok(Json(conversations))
}

/// Replace a thread's model overrides. Applied from the next invocation on.
async fn update_settings_handler(
    State(state): State<Arc<GatewayState>>,
    Path(thread_id): Path<String>,
    Json(settings): Json<ThreadSettings>,
) -> Result<impl IntoResponse, ApiError> {
    let thread_id = ThreadId::from(thread_id);
    state.store.update_settings(&thread_id, settings).await?;
    info!(%thread_id, "Updated thread settings");
    Ok(Json(json!({
        "status": "updated",
        "thread_id": thread_id,
    })))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");

    Json(json!({
        "status": "ok",
        "version": version,
        "active": state.registry.active_count(),
    }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Nginx's "client closed request"; used for stopped and cancelled runs.
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Maps coordinator failures onto HTTP responses.
pub struct ApiError(InvocationError);

impl From<InvocationError> for ApiError {
    fn from(err: InvocationError) -> Self {
        ApiError(err)
    }
}

impl From<ThreadlineError> for ApiError {
    fn from(err: ThreadlineError) -> Self {
        ApiError(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            InvocationError::NotFound(_) => StatusCode::NOT_FOUND,
            InvocationError::AlreadyRunning(_) => StatusCode::CONFLICT,
            InvocationError::Stopped | InvocationError::Cancelled => client_closed_request(),
            InvocationError::Upstream { .. } | InvocationError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
