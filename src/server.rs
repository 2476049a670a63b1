//! Webhook HTTP server.
//!
//! Receives storage-upload notifications, writes them to the durable
//! [`WorkQueue`] and acknowledges immediately; a [`Worker`] running in the
//! same process does the actual processing.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/events` | Enqueue an upload notification |
//! | `GET`  | `/events/{event_id}` | Job and event record status |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Acknowledgment contract
//!
//! The event source retries anything that is not a 2xx, so `POST /events`
//! only answers non-2xx for transport-level problems:
//!
//! | Situation | Response |
//! |-----------|----------|
//! | New event queued | `202 {"status": "accepted"}` |
//! | Event id already queued | `200 {"status": "duplicate"}` |
//! | Unparseable payload | `200 {"status": "ignored", "reason": ...}` |
//! | Enqueue failed | `200 {"status": "error"}` (logged) |
//!
//! Accepted payloads are a CloudEvent envelope (`{"id", "data": {...}}`) or
//! a bare object notification (`{"id", "bucket", "name", "contentType",
//! "timeCreated"}`). The `ce-id` header supplies the id when the body has
//! none.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{UploadEvent, EVENTS};
use crate::pipeline::Pipeline;
use crate::queue::{WorkQueue, Worker};
use crate::store::{RecordStore, SqliteStore};

#[derive(Clone)]
struct AppState {
    queue: Arc<WorkQueue>,
    records: Arc<dyn RecordStore>,
}

/// Build the router. Exposed separately from [`run_server`] so tests can
/// serve it on their own listener.
pub fn app(queue: Arc<WorkQueue>, records: Arc<dyn RecordStore>) -> Router {
    Router::new()
        .route("/events", post(handle_post_event))
        .route("/events/{event_id}", get(handle_get_event))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { queue, records })
}

/// Start the webhook server and queue worker on `[server].bind`.
///
/// Runs until Ctrl-C; the worker finishes its current job before the
/// function returns.
pub async fn run_server(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;

    let pipeline = Arc::new(Pipeline::from_config(config, pool.clone())?);
    let queue = Arc::new(WorkQueue::from_config(&config.queue, pool.clone()));
    let records: Arc<dyn RecordStore> = Arc::new(SqliteStore::new(pool.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Worker::new(
        queue.clone(),
        pipeline,
        Duration::from_millis(config.queue.poll_interval_ms),
        Duration::from_secs(config.pipeline.stale_after_secs.max(0) as u64),
    );
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "webhook server listening");
    println!("docqa listening on http://{}", config.server.bind);

    axum::serve(listener, app(queue, records))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    worker_handle.await.context("queue worker panicked")?;
    pool.close().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = ?err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{:#}", err),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /events ============

async fn handle_post_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let event = match parse_notification(&headers, &body) {
        Ok(event) => event,
        Err(reason) => {
            tracing::warn!(reason = %reason, "ignoring malformed notification");
            return (
                StatusCode::OK,
                Json(json!({"status": "ignored", "reason": reason})),
            );
        }
    };

    match state.queue.enqueue(&event).await {
        Ok(true) => {
            tracing::info!(
                event_id = %event.event_id,
                bucket = %event.bucket,
                object = %event.object_name,
                "event accepted"
            );
            (
                StatusCode::ACCEPTED,
                Json(json!({"status": "accepted", "event_id": event.event_id})),
            )
        }
        Ok(false) => {
            tracing::info!(event_id = %event.event_id, "event already queued");
            (
                StatusCode::OK,
                Json(json!({"status": "duplicate", "event_id": event.event_id})),
            )
        }
        Err(e) => {
            tracing::error!(event_id = %event.event_id, error = ?e, "failed to enqueue event");
            (
                StatusCode::OK,
                Json(json!({"status": "error", "event_id": event.event_id})),
            )
        }
    }
}

/// Turn a notification body into an [`UploadEvent`]. The error is a
/// human-readable reason returned to the caller.
pub fn parse_notification(headers: &HeaderMap, body: &[u8]) -> Result<UploadEvent, String> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {}", e))?;
    if !payload.is_object() {
        return Err("body must be a JSON object".to_string());
    }
    let data = match payload.get("data") {
        Some(d) if d.is_object() => d,
        Some(_) => return Err("'data' must be an object".to_string()),
        None => &payload,
    };

    let event_id = non_empty_str(&payload, "id")
        .or_else(|| {
            headers
                .get("ce-id")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
        .ok_or("missing event id")?
        .to_string();
    let bucket = non_empty_str(data, "bucket").ok_or("missing 'bucket'")?;
    let name = non_empty_str(data, "name").ok_or("missing 'name'")?;
    let mime_type = non_empty_str(data, "contentType").unwrap_or_default();
    let uploaded_at = match non_empty_str(data, "timeCreated") {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| format!("invalid 'timeCreated': {}", e))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    Ok(UploadEvent {
        event_id,
        bucket: bucket.to_string(),
        object_name: name.to_string(),
        mime_type: mime_type.to_string(),
        uploaded_at,
    })
}

fn non_empty_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

// ============ GET /events/{event_id} ============

async fn handle_get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let job = state.queue.get(&event_id).await.map_err(internal)?;
    let record = state
        .records
        .get(EVENTS, &event_id)
        .await
        .map_err(internal)?;

    if job.is_none() && record.is_none() {
        return Err(not_found(format!("no event with id: {}", event_id)));
    }
    Ok(Json(json!({
        "event_id": event_id,
        "job": job,
        "event": record,
    })))
}
