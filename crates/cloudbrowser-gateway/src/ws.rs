//! The realtime transport: a single duplex WebSocket connection per
//! client carrying both session and queue events (§6). This module only
//! drives the wire protocol; all bookkeeping (roles, timers, abandonment,
//! queue ordering) lives in `cloudbrowser_core`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use cloudbrowser_core::queue::QueueStatus;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::AppState;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum QueueWireEvent {
    #[serde(rename = "queue:joined")]
    Joined { position: usize, total_in_queue: usize, estimated_wait_seconds: u64 },
    #[serde(rename = "queue:status")]
    Status { status: QueueStatus, position: usize, total_in_queue: usize, estimated_wait_seconds: u64 },
    #[serde(rename = "queue:ready")]
    Ready { session_id: String, port: u16 },
    #[serde(rename = "queue:error")]
    Error { error: String },
    #[serde(rename = "queue:invalid")]
    Invalid,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut joined_session: Option<String> = None;
    let mut session_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut queue_task: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            warn!("dropping malformed ws frame from {client_id}");
            continue;
        };

        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");

        match kind {
            "session:join" | "session:reconnect" => {
                let Some(session_id) = value.get("sessionId").and_then(Value::as_str) else {
                    continue;
                };
                let viewer = value.get("viewer").and_then(Value::as_bool).unwrap_or(false);

                if let Some(prior) = joined_session.take() {
                    if let Some(handle) = session_task.take() {
                        handle.abort();
                    }
                    state.realtime.leave(&prior, &client_id, true).await;
                }

                match state.realtime.join(session_id, &client_id, viewer).await {
                    None => {
                        let _ = out_tx.send(
                            serde_json::to_string(&serde_json::json!({
                                "type": "session:error",
                                "error": "session not found or not active",
                            }))
                            .unwrap(),
                        );
                    }
                    Some(join_result) => {
                        let _ = out_tx.send(serde_json::to_string(&join_result.event).unwrap());
                        joined_session = Some(session_id.to_string());
                        let client_filter = client_id.clone();
                        let out_tx = out_tx.clone();
                        let mut receiver = join_result.receiver;
                        session_task = Some(tokio::spawn(async move {
                            loop {
                                match receiver.recv().await {
                                    Ok((target, event)) => {
                                        if let Some(target) = &target {
                                            if target != &client_filter {
                                                continue;
                                            }
                                        }
                                        let is_ended = matches!(
                                            event,
                                            cloudbrowser_core::realtime::SessionEvent::Ended { .. }
                                        );
                                        if out_tx.send(serde_json::to_string(&event).unwrap()).is_err() {
                                            break;
                                        }
                                        if is_ended {
                                            break;
                                        }
                                    }
                                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                                }
                            }
                        }));
                    }
                }
            }
            "queue:join" => {
                let Some(queue_id) = value.get("queueId").and_then(Value::as_str) else {
                    continue;
                };
                let queue_id = queue_id.to_string();

                match state.queue.get_with_wait(&queue_id).await {
                    None => {
                        let _ = out_tx.send(serde_json::to_string(&QueueWireEvent::Invalid).unwrap());
                    }
                    Some((entry, wait)) => {
                        let _ = out_tx.send(
                            serde_json::to_string(&QueueWireEvent::Joined {
                                position: entry.position,
                                total_in_queue: entry.total_in_queue,
                                estimated_wait_seconds: wait,
                            })
                            .unwrap(),
                        );

                        if let Some(mut receiver) = state.queue.subscribe(&queue_id).await {
                            if let Some(handle) = queue_task.take() {
                                handle.abort();
                            }
                            let out_tx = out_tx.clone();
                            let queue = state.queue.clone();
                            queue_task = Some(tokio::spawn(async move {
                                while let Some(note) = receiver.recv().await {
                                    let wire = match note.status {
                                        QueueStatus::Ready => QueueWireEvent::Ready {
                                            session_id: note.session_id.unwrap_or_default(),
                                            port: note.port.unwrap_or_default(),
                                        },
                                        QueueStatus::RateLimited => QueueWireEvent::Error {
                                            error: "rate limit exceeded".to_string(),
                                        },
                                        other => {
                                            let wait = queue.estimated_wait_seconds().await;
                                            let snapshot = queue.get(&note.entry_id).await;
                                            QueueWireEvent::Status {
                                                status: other,
                                                position: snapshot.as_ref().map(|s| s.position).unwrap_or(0),
                                                total_in_queue: snapshot.map(|s| s.total_in_queue).unwrap_or(0),
                                                estimated_wait_seconds: wait,
                                            }
                                        }
                                    };
                                    let terminal =
                                        matches!(wire, QueueWireEvent::Ready { .. } | QueueWireEvent::Error { .. });
                                    if out_tx.send(serde_json::to_string(&wire).unwrap()).is_err() || terminal {
                                        break;
                                    }
                                }
                            }));
                        }
                    }
                }
            }
            other => debug!("ignoring unknown ws message type {other:?} from {client_id}"),
        }
    }

    if let Some(session_id) = joined_session {
        state.realtime.leave(&session_id, &client_id, true).await;
    }
    if let Some(handle) = session_task {
        handle.abort();
    }
    if let Some(handle) = queue_task {
        handle.abort();
    }
    writer.abort();
}
