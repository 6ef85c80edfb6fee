// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP surface: workflow enumeration, submission, engine lifecycle, and
//! the client WebSocket registration endpoint.
//!
//! HTTP callers authenticate with the `X-API-Key` header; the WebSocket
//! handshake carries the same secret in a `token` header.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use easel_core::{ClientId, GatewayError, WorkflowInput};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connections::{ClientFrame, ClientHandle, ConnectionManager, CLIENT_QUEUE_CAPACITY};
use crate::engine::{EngineProcess, EngineStatus};
use crate::jobs::JobRegistry;
use crate::submit::Submitter;
use crate::workflows::WorkflowStore;

/// Shared context for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub api_key: String,
    pub connections: Arc<ConnectionManager>,
    pub registry: Arc<JobRegistry>,
    pub submitter: Arc<Submitter>,
    pub store: Arc<WorkflowStore>,
    pub engine: Option<Arc<EngineProcess>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/workflows", get(list_workflows))
        .route("/workflows/", get(list_workflows))
        .route("/workflows/:workflow_id", get(get_workflow))
        .route("/workflows/:workflow_id/queue", post(queue_workflow))
        .route("/ws/register", get(ws_register))
        .route("/lifecycle/start", post(lifecycle_start))
        .route("/lifecycle/stop", post(lifecycle_stop))
        .route("/lifecycle/status", get(lifecycle_status))
        .with_state(state)
}

/// GatewayError carried into an HTTP response.
struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if provided == Some(state.api_key.as_str()) {
        Ok(())
    } else {
        Err(ApiError(GatewayError::Unauthorized))
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "service": "easel-gateway", "status": "ok" }))
}

async fn list_workflows(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, ApiError> {
    require_api_key(&state, &headers)?;
    Ok(Json(state.store.workflow_ids()))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_api_key(&state, &headers)?;
    let descriptor = state.store.descriptor(&workflow_id)?;
    Ok(Json(descriptor).into_response())
}

#[derive(Deserialize)]
struct QueueQuery {
    websocket_cid: String,
}

async fn queue_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<QueueQuery>,
    headers: HeaderMap,
    Json(inputs): Json<Vec<WorkflowInput>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;
    let cid = ClientId::from_string(query.websocket_cid);
    let request_id = state.submitter.queue_workflow(&cid, &workflow_id, inputs).await?;
    Ok(Json(json!({ "request_id": request_id })))
}

#[derive(Deserialize)]
struct RegisterQuery {
    /// Resume an earlier connection id, keeping its backend pairing.
    cid: Option<String>,
}

async fn ws_register(
    State(state): State<AppState>,
    Query(query): Query<RegisterQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = headers.get("token").and_then(|v| v.to_str().ok());
    if token != Some(state.api_key.as_str()) {
        return Err(ApiError(GatewayError::Unauthorized));
    }
    let resume = query.cid.filter(|s| !s.is_empty()).map(ClientId::from_string);
    Ok(ws.on_upgrade(move |socket| handle_client_socket(state, socket, resume)))
}

/// Run one registered client connection to completion.
async fn handle_client_socket(state: AppState, socket: WebSocket, resume: Option<ClientId>) {
    let (handle, rx) = ClientHandle::channel(CLIENT_QUEUE_CAPACITY);
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(client_writer(sink, rx));

    let cid = match state.connections.accept_client(resume, handle).await {
        Ok((cid, _sid)) => cid,
        Err(e) => {
            warn!(error = %e, "client registration failed");
            writer.abort();
            return;
        }
    };

    client_reader(&state, &cid, stream).await;
    info!(%cid, "client disconnected");
    state.connections.disconnect(cid.as_str()).await;
}

/// Drain queued frames onto the client socket. Ends at the first close
/// frame or transport error.
async fn client_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ClientFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let result = match frame {
            ClientFrame::Text(text) => sink.send(Message::Text(text)).await,
            ClientFrame::Binary(bytes) => sink.send(Message::Binary(bytes)).await,
            ClientFrame::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                    .await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}

/// Forward client text frames to the paired backend until the client goes
/// away.
async fn client_reader(state: &AppState, cid: &ClientId, mut stream: SplitStream<WebSocket>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Err(e) = state.connections.forward_to_backend(cid.as_str(), text).await {
                    debug!(%cid, error = %e, "client frame not forwarded");
                }
            }
            // Clients speak text toward the engine; binary input is not
            // part of the protocol.
            Ok(Message::Binary(_)) => {}
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {} // Ping/Pong
        }
    }
}

async fn lifecycle_start(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_api_key(&state, &headers)?;
    let engine = state.engine.as_ref().ok_or_else(|| {
        ApiError(GatewayError::not_found("engine process manager".to_string()))
    })?;
    let status = engine.start().await;
    let code = if status == EngineStatus::Starting || status == EngineStatus::Running {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((code, Json(json!({ "status": status }))).into_response())
}

async fn lifecycle_stop(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_api_key(&state, &headers)?;
    let engine = state.engine.as_ref().ok_or_else(|| {
        ApiError(GatewayError::not_found("engine process manager".to_string()))
    })?;
    let status = engine.stop().await;
    let code = if status == EngineStatus::NotRunning {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((code, Json(json!({ "status": status }))).into_response())
}

async fn lifecycle_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;
    let engine = state.engine.as_ref().ok_or_else(|| {
        ApiError(GatewayError::not_found("engine process manager".to_string()))
    })?;
    Ok(Json(json!({ "status": engine.status().await })))
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
