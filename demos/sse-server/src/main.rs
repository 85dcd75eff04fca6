//! Demo server streaming session events over SSE.
//!
//! Run with: cargo run -p sse-server-demo
//!
//! Then:
//!   curl -N http://localhost:3000/sessions/demo/events
//!   curl -X POST http://localhost:3000/sessions/demo/events \
//!        -H 'content-type: application/json' \
//!        -d '{"type": "status_change", "data": {"status": "running"}, "persist": true}'
//!
//! Environment:
//! - `EVENT_HUB_ADDR`: listen address (default `127.0.0.1:3000`)
//! - `EVENT_HUB_CONFIG`: JSON hub configuration, missing fields use defaults
//! - `EVENT_HUB_DATABASE_URL`: SQLite log instead of memory (feature: sqlite)

use std::{net::SocketAddr, sync::Arc};

use agent_events_core::{EventLog, PersistSink, SessionEvent, SinkError};
use agent_events_hub::{EventHub, HubConfig, HubError, SubscriberStats};
use agent_events_sse::{DeliveryStream, ProtocolError, into_sse, last_event_id};
use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Archives persisted events to the log output.
struct LoggingSink;

#[async_trait]
impl PersistSink for LoggingSink {
    async fn persist(&self, event: &SessionEvent) -> Result<(), SinkError> {
        tracing::info!(
            session_id = %event.session_id,
            sequence = event.sequence,
            event_type = event.event_type(),
            "Archived event"
        );
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Invalid event type: {0:?}")]
    InvalidEventType(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Hub(HubError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Hub(HubError::Log(_)) => StatusCode::BAD_GATEWAY,
            Self::Hub(HubError::InvalidSessionId(_))
            | Self::Protocol(_)
            | Self::InvalidEventType(_) => StatusCode::BAD_REQUEST,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    persist: bool,
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    sequence: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    length: usize,
    first_sequence: i64,
    last_sequence: i64,
    subscribers: Vec<SubscriberStats>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let config = match std::env::var("EVENT_HUB_CONFIG") {
        Ok(raw) => serde_json::from_str::<HubConfig>(&raw).context("parsing EVENT_HUB_CONFIG")?,
        Err(_) => HubConfig::default(),
    };
    let addr: SocketAddr = std::env::var("EVENT_HUB_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
        .parse()
        .context("parsing EVENT_HUB_ADDR")?;

    let hub = EventHub::with_sink(open_log().await?, Arc::new(LoggingSink), config);

    let app = Router::new()
        .route(
            "/sessions/{session_id}/events",
            get(stream_events).post(publish_event).delete(delete_events),
        )
        .route("/sessions/{session_id}", get(session_info))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(hub.clone());

    tracing::info!("Server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.close().await;
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_log() -> anyhow::Result<Arc<dyn EventLog>> {
    if let Ok(url) = std::env::var("EVENT_HUB_DATABASE_URL") {
        tracing::info!(%url, "Using SQLite event log");
        let log = agent_events_hub::storage::SqliteLog::connect(&url).await?;
        return Ok(Arc::new(log));
    }
    Ok(Arc::new(agent_events_hub::storage::MemoryLog::new()))
}

#[cfg(not(feature = "sqlite"))]
async fn open_log() -> anyhow::Result<Arc<dyn EventLog>> {
    Ok(Arc::new(agent_events_hub::storage::MemoryLog::new()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn stream_events(
    Path(session_id): Path<String>,
    State(hub): State<EventHub>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let checkpoint = last_event_id(&headers)?;
    let stream = DeliveryStream::resume(&hub, &session_id, checkpoint).await?;
    Ok(into_sse(stream).into_response())
}

async fn publish_event(
    Path(session_id): Path<String>,
    State(hub): State<EventHub>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, ApiError> {
    let PublishRequest {
        event_type,
        data,
        persist,
    } = request;
    if event_type.trim().is_empty() || event_type.contains(['\n', '\r']) {
        return Err(ApiError::InvalidEventType(event_type));
    }

    let sequence = hub
        .publish_event(&session_id, &event_type, &data, persist)
        .await?;
    Ok(Json(PublishResponse { sequence }))
}

async fn delete_events(
    Path(session_id): Path<String>,
    State(hub): State<EventHub>,
) -> Result<StatusCode, ApiError> {
    if hub.delete_stream(&session_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn session_info(
    Path(session_id): Path<String>,
    State(hub): State<EventHub>,
) -> Result<Response, ApiError> {
    let Some(info) = hub.stream_info(&session_id).await? else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let subscribers = hub.get_subscriber_stats(&session_id).await;
    Ok(Json(SessionResponse {
        length: info.length,
        first_sequence: info.first_sequence,
        last_sequence: info.last_sequence,
        subscribers,
    })
    .into_response())
}
