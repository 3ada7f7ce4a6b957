//! WebSocket progress stream: `GET /v1/audit/{id}/ws`.
//!
//! Upgrade handling and the close-frame-on-finish pattern follow the
//! websocket handler idiom of accepting the upgrade, then running the
//! session loop inside `on_upgrade`'s async block and sending a best-effort
//! `Close` frame when the loop ends for any reason.

use super::ApiState;
use crate::broadcaster::ProgressEvent;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tracing::debug;

const CLOSE_UNKNOWN_JOB: u16 = 1008;
const CLOSE_NORMAL: u16 = 1000;

pub async fn audit_progress_ws(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(mut receiver) = state.dispatcher.subscribe(&job_id) else {
        return ws.on_upgrade(move |mut socket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_UNKNOWN_JOB,
                    reason: format!("unknown job {job_id}").into(),
                })))
                .await;
        });
    };

    ws.on_upgrade(move |socket| async move {
        stream_progress(socket, &mut receiver, &job_id).await;
    })
}

async fn stream_progress(
    mut socket: WebSocket,
    receiver: &mut tokio::sync::broadcast::Receiver<ProgressEvent>,
    job_id: &str,
) {
    loop {
        tokio::select! {
            event = receiver.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(job_id, skipped, "progress subscriber lagged, continuing");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                let is_terminal = matches!(event, ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. });
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };

                if socket.send(Message::Text(payload.into())).await.is_err() {
                    return;
                }
                if is_terminal {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) => return,
                    Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => continue,
                }
            }
        }
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: "audit finished".into(),
        })))
        .await;
}
