//! HTTP ingress for change webhooks.
//!
//! Ingestion is decoupled from pipeline execution: the webhook handler
//! persists the event, queues its id on an mpsc channel, and answers
//! immediately. A dispatcher task drains the channel and spawns one pipeline
//! run per event.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use procwatch_pipeline::Pipeline;
use procwatch_shared::{ProcwatchError, Result};
use procwatch_storage::Storage;

/// Queued events waiting for a pipeline task.
const JOB_QUEUE_DEPTH: usize = 256;

// ── Config ──

pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

// ── App state ──

/// Shared handler state. The job sender feeds the dispatcher; handlers never
/// touch the pipeline directly.
pub struct AppState {
    storage: Arc<Storage>,
    jobs: mpsc::Sender<i64>,
    webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(
        storage: Arc<Storage>,
        jobs: mpsc::Sender<i64>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            storage,
            jobs,
            webhook_secret,
        }
    }
}

// ── Error handling ──

struct AppError(ProcwatchError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "request failed");
        let body = serde_json::json!({ "error": self.0.to_string() });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

impl From<ProcwatchError> for AppError {
    fn from(err: ProcwatchError) -> Self {
        Self(err)
    }
}

// ── Entrypoint ──

/// Serve HTTP until shutdown. Spawns the dispatcher task that owns the
/// pipeline and consumes queued event ids.
pub async fn serve(
    storage: Arc<Storage>,
    pipeline: Arc<Pipeline>,
    webhook_secret: Option<String>,
    config: ServeConfig,
) -> Result<()> {
    let (jobs, queue) = mpsc::channel(JOB_QUEUE_DEPTH);
    tokio::spawn(dispatch_jobs(pipeline, queue));

    let state = Arc::new(AppState::new(storage, jobs, webhook_secret));
    let app = router(state);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ProcwatchError::Network(format!("could not bind {addr}: {e}")))?;
    info!(%addr, "procwatch listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| ProcwatchError::Network(format!("server error: {e}")))?;
    Ok(())
}

/// Build the router (for testing without binding to a port).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/change", post(receive_change))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Drain the job queue, one spawned pipeline run per event id.
async fn dispatch_jobs(pipeline: Arc<Pipeline>, mut queue: mpsc::Receiver<i64>) {
    while let Some(event_id) = queue.recv().await {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline.run(event_id).await;
        });
    }
}

// ── POST /webhooks/change ──

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    watch_uuid: String,
    #[serde(default)]
    watch_url: String,
}

async fn receive_change(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> std::result::Result<Response, AppError> {
    if let Some(secret) = &state.webhook_secret {
        let presented = headers
            .get("x-webhook-secret")
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret.as_str()) {
            warn!(watch_uuid = payload.watch_uuid, "webhook secret mismatch");
            return Ok((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "detail": "Invalid webhook secret" })),
            )
                .into_response());
        }
    }

    let session = state.storage.session()?;
    let event = session
        .create_event(&payload.watch_uuid, &payload.watch_url)
        .await?;

    info!(
        event_id = event.id,
        watch_uuid = payload.watch_uuid,
        watch_url = payload.watch_url,
        "webhook received"
    );

    // A full queue sheds the run, not the event; replay can pick it up
    if let Err(e) = state.jobs.try_send(event.id) {
        warn!(event_id = event.id, error = %e, "job queue rejected event");
    }

    Ok(Json(serde_json::json!({ "status": "accepted", "event_id": event.id })).into_response())
}

// ── GET /health ──

async fn health(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    let session = state.storage.session()?;
    let events_total = session.events_count().await?;
    let events_today = session.events_today_count().await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "events_total": events_total,
        "events_today": events_today,
    })))
}
