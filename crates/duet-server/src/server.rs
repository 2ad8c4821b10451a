//! Axum HTTP + SSE surface.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use duet_core::{MarkRead, MessageId, RoomId, StreamEvent, UserId};
use duet_store::AppendOutcome;
use duet_telemetry::metrics::HTTP_REQUESTS_TOTAL;
use futures::{Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::app::DuetApp;
use crate::errors::ApiError;
use crate::health::{self, HealthResponse};
use crate::identity::Identity;
use crate::live::ConnectionManager;
use crate::service::{ChatService, SendMessage};
use crate::shutdown::ShutdownCoordinator;

const DEFAULT_FETCH_LIMIT: usize = 100;
const MAX_FETCH_LIMIT: usize = 1_000;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub sessions: Arc<ConnectionManager>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(app: &DuetApp, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            service: Arc::clone(&app.service),
            sessions: Arc::clone(&app.sessions),
            shutdown: Arc::clone(&app.shutdown),
            metrics,
            start_time: Instant::now(),
        }
    }

    fn authorize(&self, room: &str, user: &UserId) -> Result<RoomId, ApiError> {
        let room = RoomId::from(room);
        self.service.rooms().authorize(&room, user)?;
        Ok(room)
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/rooms/{room}/messages", post(post_message).get(get_messages))
        .route("/api/rooms/{room}/stream", get(stream))
        .route("/api/rooms/{room}/typing", post(set_typing))
        .route("/api/rooms/{room}/read", post(mark_read))
        .route("/api/rooms/{room}/unread", get(unread))
        .route("/api/rooms/{room}/presence", get(presence))
        .route("/api/sessions", get(my_sessions))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(middleware::from_fn(count_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn count_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let response = next.run(req).await;
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

/// POST /api/rooms/{room}/messages
#[instrument(skip_all, fields(room = %room, user = %user.0))]
async fn post_message(
    State(state): State<AppState>,
    Path(room): Path<String>,
    user: Identity,
    Json(body): Json<SendMessage>,
) -> Result<Response, ApiError> {
    let room = state.authorize(&room, &user.0)?;
    let response = match state.service.send(&room, &user.0, body).await? {
        AppendOutcome::Stored(message) => (StatusCode::CREATED, Json(json!(message))).into_response(),
        AppendOutcome::Duplicate(message) => (
            StatusCode::OK,
            Json(json!({ "duplicate": true, "message": message })),
        )
            .into_response(),
    };
    Ok(response)
}

#[derive(Debug, Default, Deserialize)]
struct FetchParams {
    #[serde(default)]
    since: i64,
    limit: Option<usize>,
}

/// GET /api/rooms/{room}/messages?since=&limit=
async fn get_messages(
    State(state): State<AppState>,
    Path(room): Path<String>,
    user: Identity,
    Query(params): Query<FetchParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = state.authorize(&room, &user.0)?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_FETCH_LIMIT)
        .clamp(1, MAX_FETCH_LIMIT);
    let messages = state.service.fetch(&room, params.since, limit).await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    #[serde(default)]
    since: i64,
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to encode stream event");
            Event::default().comment("encoding error")
        })
}

/// GET /api/rooms/{room}/stream?since=
async fn stream(
    State(state): State<AppState>,
    Path(room): Path<String>,
    user: Identity,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let room = state.authorize(&room, &user.0)?;
    let opened = state.sessions.open(room, user.0, params.since)?;
    let events =
        ReceiverStream::new(opened.events).map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingBody {
    to: UserId,
    is_typing: bool,
}

/// POST /api/rooms/{room}/typing
async fn set_typing(
    State(state): State<AppState>,
    Path(room): Path<String>,
    user: Identity,
    Json(body): Json<TypingBody>,
) -> Result<StatusCode, ApiError> {
    let room = state.authorize(&room, &user.0)?;
    state
        .service
        .set_typing(&room, &user.0, &body.to, body.is_typing)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadBody {
    message_id: Option<MessageId>,
}

/// POST /api/rooms/{room}/read
async fn mark_read(
    State(state): State<AppState>,
    Path(room): Path<String>,
    user: Identity,
    body: Option<Json<ReadBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = state.authorize(&room, &user.0)?;
    let through = match body.and_then(|Json(b)| b.message_id) {
        Some(id) => MarkRead::Through(id),
        None => MarkRead::All,
    };
    let read = state.service.mark_read(&room, &user.0, through).await?;
    Ok(Json(json!(read)))
}

/// GET /api/rooms/{room}/unread
async fn unread(
    State(state): State<AppState>,
    Path(room): Path<String>,
    user: Identity,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = state.authorize(&room, &user.0)?;
    let read = state.service.read_state(&room, &user.0).await?;
    Ok(Json(json!(read)))
}

/// GET /api/rooms/{room}/presence
async fn presence(
    State(state): State<AppState>,
    Path(room): Path<String>,
    user: Identity,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = state.authorize(&room, &user.0)?;
    let users = state.service.presence(&room).await?;
    Ok(Json(json!({ "users": users })))
}

/// GET /api/sessions: the caller's own live sessions.
async fn my_sessions(State(state): State<AppState>, user: Identity) -> Json<serde_json::Value> {
    Json(json!({ "sessions": state.sessions.sessions_for(&user.0) }))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        state.sessions.session_count(),
        state.service.cache().len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            duet_telemetry::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// A running server. Dropping it does not stop anything; call
/// [`stop`](Self::stop).
pub struct ServerHandle {
    pub addr: SocketAddr,
    app: DuetApp,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn app(&self) -> &DuetApp {
        &self.app
    }

    /// Drain every session, stop accepting requests and wait for the
    /// background tasks.
    pub async fn stop(self) {
        self.app.shutdown(vec![self.server]).await;
    }
}

/// Bind the configured address and serve until shutdown.
pub async fn start(
    app: DuetApp,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(&app, metrics);
    let router = build_router(state);

    let addr = format!("{}:{}", app.settings.server.host, app.settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, room = %app.settings.room.id, "duet server started");

    let token = app.shutdown.token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        app,
        server,
    })
}
