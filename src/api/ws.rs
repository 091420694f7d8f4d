//! WebSocket push channel.
//!
//! A client joins the jobs it wants to follow and receives their events as
//! JSON text frames. Control requests can be sent over the same socket.

use std::collections::HashSet;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::jobs::{ControlOutcome, JobStatusResponse};

/// Requests a client can send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start receiving events for a job.
    JoinJob { job_id: Uuid },
    LeaveJob { job_id: Uuid },
    RequestStatus { job_id: Uuid },
    PauseJob { job_id: Uuid },
    ResumeJob { job_id: Uuid },
    CancelJob { job_id: Uuid },
}

/// Server replies that are not engine events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full status of one job. Sent on join, on request, and after lag.
    JobStatusSnapshot { job: JobStatusResponse },
    /// Result of a pause/resume/cancel request.
    ControlResult { job_id: Uuid, result: ControlOutcome },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<Uuid>,
    },
}

pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, msg: &T) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize WS message");
            true
        }
    }
}

async fn snapshot(state: &AppState, job_id: Uuid) -> ServerMessage {
    match state.manager.status(job_id).await {
        Ok(job) => ServerMessage::JobStatusSnapshot { job },
        Err(e) => ServerMessage::Error {
            message: e.to_string(),
            job_id: Some(job_id),
        },
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");

    let mut rx = state.events.subscribe();
    let mut joined: HashSet<Uuid> = HashSet::new();

    loop {
        tokio::select! {
            // Forward events for joined jobs
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if joined.contains(&event.job_id()) && !send_json(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        // Re-sync every followed job
                        let mut alive = true;
                        for job_id in joined.clone() {
                            let msg = snapshot(&state, job_id).await;
                            if !send_json(&mut socket, &msg).await {
                                alive = false;
                                break;
                            }
                        }
                        if !alive {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            // Requests from the client
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(&text, &state, &mut joined).await;
                        if let Some(reply) = reply {
                            if !send_json(&mut socket, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(followed = joined.len(), "WebSocket connection closed");
}

async fn handle_client_message(
    text: &str,
    state: &AppState,
    joined: &mut HashSet<Uuid>,
) -> Option<ServerMessage> {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, text = text, "Unrecognized WS message from client");
            return Some(ServerMessage::Error {
                message: format!("Unrecognized message: {e}"),
                job_id: None,
            });
        }
    };

    match msg {
        ClientMessage::JoinJob { job_id } => {
            let reply = snapshot(state, job_id).await;
            if matches!(reply, ServerMessage::JobStatusSnapshot { .. }) {
                joined.insert(job_id);
                debug!(job_id = %job_id, "Client joined job");
            }
            Some(reply)
        }
        ClientMessage::LeaveJob { job_id } => {
            joined.remove(&job_id);
            None
        }
        ClientMessage::RequestStatus { job_id } => Some(snapshot(state, job_id).await),
        ClientMessage::PauseJob { job_id } => {
            Some(control_reply(job_id, state.manager.pause(job_id).await))
        }
        ClientMessage::ResumeJob { job_id } => {
            Some(control_reply(job_id, state.manager.resume(job_id).await))
        }
        ClientMessage::CancelJob { job_id } => {
            Some(control_reply(job_id, state.manager.cancel(job_id).await))
        }
    }
}

fn control_reply(job_id: Uuid, result: crate::error::Result<ControlOutcome>) -> ServerMessage {
    match result {
        Ok(result) => ServerMessage::ControlResult { job_id, result },
        Err(e) => ServerMessage::Error {
            message: e.to_string(),
            job_id: Some(job_id),
        },
    }
}
