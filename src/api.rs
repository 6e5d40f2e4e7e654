//! HTTP surface: trigger, poll, cancel, and a live event socket.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::errors::StoreError;
use crate::models::{ExecutionLog, ExecutionRun, FeatureDescriptor, SuggestionDescriptor};
use crate::pipeline::{Pipeline, RunRequest};

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub repo_id: String,
    pub repo_url: String,
    pub feature_node_id: String,
    pub suggestion_id: String,
    /// Optional richer context for the plan generator; falls back to the
    /// bare ids when absent.
    pub feature: Option<FeatureDescriptor>,
    pub suggestion: Option<SuggestionDescriptor>,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    /// Return entries with sequence strictly greater than this.
    #[serde(default)]
    pub after: i64,
    pub limit: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/logs", get(get_run_logs))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn create_run(
    State(state): State<SharedState>,
    Json(payload): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<ExecutionRun>), ApiError> {
    for (field, value) in [
        ("repo_id", &payload.repo_id),
        ("repo_url", &payload.repo_url),
        ("feature_node_id", &payload.feature_node_id),
        ("suggestion_id", &payload.suggestion_id),
    ] {
        if value.trim().is_empty() {
            return Err(ApiError::BadRequest(format!("{} must not be empty", field)));
        }
    }

    let feature = payload.feature.unwrap_or_else(|| FeatureDescriptor {
        id: payload.feature_node_id.clone(),
        name: payload.feature_node_id.clone(),
        description: String::new(),
    });
    let suggestion = payload.suggestion.unwrap_or_else(|| SuggestionDescriptor {
        id: payload.suggestion_id.clone(),
        name: payload.suggestion_id.clone(),
        rationale: String::new(),
        complexity: String::new(),
        test_cases: Vec::new(),
    });

    let run = state
        .pipeline
        .clone()
        .start(RunRequest {
            repo_id: payload.repo_id,
            repo_url: payload.repo_url,
            feature,
            suggestion,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRun>, ApiError> {
    let run_id = id.clone();
    let run = state
        .pipeline
        .store()
        .call(move |s| s.get_run(&run_id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {} not found", id)))?;
    Ok(Json(run))
}

async fn get_run_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<ExecutionLog>>, ApiError> {
    let limit = query.limit.unwrap_or(500).min(5000);
    let run_id = id.clone();
    let store = state.pipeline.store();
    let exists = {
        let run_id = run_id.clone();
        store.call(move |s| s.get_run(&run_id)).await?.is_some()
    };
    if !exists {
        return Err(ApiError::NotFound(format!("run {} not found", id)));
    }
    let logs = store
        .call(move |s| s.logs_after(&run_id, query.after, limit))
        .await?;
    Ok(Json(logs))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRun>, ApiError> {
    match state.pipeline.cancel(&id).await {
        Ok(run) => Ok(Json(run)),
        Err(StoreError::RunNotFound { id }) => {
            Err(ApiError::NotFound(format!("run {} not found", id)))
        }
        Err(StoreError::InvalidTransition { from, .. }) => Err(ApiError::Conflict(format!(
            "run {} is already {}",
            id, from
        ))),
        Err(StoreError::Other(e)) => Err(e.into()),
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// ── Live event socket ─────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let rx = state.pipeline.logs().subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

/// Forward broadcast frames to the socket until either side goes away.
async fn forward_events(socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}
