//! HTTP/WebSocket server: job admission and live observation.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::channels::WebSubmitter;
use crate::error::ChannelError;
use crate::queue::JobQueue;
use crate::render::BroadcastRenderer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub submitter: WebSubmitter,
    pub frames: BroadcastRenderer,
}

/// Body of `POST /api/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub text: String,
    #[serde(default)]
    pub user: Option<String>,
}

/// Client → server WebSocket message.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "message")]
    Message {
        content: String,
        #[serde(default)]
        user: Option<String>,
    },
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", get(list_jobs).post(submit_job))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `app` on `listener` until the server fails.
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP/WS server listening");
    }
    axum::serve(listener, app).await
}

// ── REST ────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ai-delegate",
        "pending": state.queue.pending(),
        "processing": state.queue.processing(),
        "observers": state.frames.observer_count(),
    }))
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.queue.records())
}

async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> impl IntoResponse {
    match state.submitter.submit(&body.text, body.user.as_deref()) {
        Ok(id) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "id": id }))),
        Err(ChannelError::InvalidMessage(reason)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": reason })),
        ),
        Err(e) => {
            warn!(error = %e, "Web submission failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket observer connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut frames = state.frames.subscribe();
    info!("WebSocket observer connected");

    loop {
        tokio::select! {
            result = frames.recv() => {
                match result {
                    Ok(frame) => {
                        if let Ok(json) = serde_json::to_string(&frame) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Observer disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Frames are whole snapshots, so the next one catches up.
                        warn!(missed = n, "Observer lagged behind frame broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Message { content, user }) => {
                                match state.submitter.submit(&content, user.as_deref()) {
                                    Ok(id) => debug!(job_id = %id, "Job submitted over WebSocket"),
                                    Err(ChannelError::InvalidMessage(_)) => continue,
                                    Err(e) => {
                                        warn!(error = %e, "WebSocket submission failed");
                                        break;
                                    }
                                }
                            }
                            Err(e) => debug!(error = %e, "Invalid JSON from observer"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket observer disconnected");
}
