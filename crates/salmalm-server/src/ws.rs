// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket bridge: one connection per UI session. Client frames are
//! `{type: "message", text, session}` or `{type: "abort"}`; server frames
//! are `chunk | tool | thinking | done | error | shutdown`. The `shutdown`
//! frame is broadcast to every open connection before the listener drains,
//! followed by a 1001 close.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    Extension,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use salmalm_core::{AgentEvent, Session};

use crate::auth::AuthContext;
use crate::state::AppState;

/// GET /ws — authenticated upgrade (the middleware ran before us).
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app, ctx))
}

async fn handle_socket(mut socket: WebSocket, app: AppState, ctx: AuthContext) {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
    let mut shutdown_rx = app.shutdown.subscribe();
    // The session the last message frame targeted; abort frames apply to it.
    let mut current_session: Option<String> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                send_json(&mut socket, &json!({
                    "type": "shutdown",
                    "message": "Server shutting down",
                })).await;
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "going away".into(),
                    })))
                    .await;
                break;
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(v) = serde_json::from_str::<Value>(&text) else {
                            send_json(&mut socket, &json!({
                                "type": "error",
                                "message": "invalid JSON frame",
                            })).await;
                            continue;
                        };
                        match v["type"].as_str().unwrap_or("") {
                            "message" => {
                                let session = v["session"].as_str().unwrap_or("web").to_string();
                                let msg_text = v["text"].as_str().unwrap_or("").to_string();
                                if !Session::valid_id(&session) || msg_text.is_empty() {
                                    send_json(&mut socket, &json!({
                                        "type": "error",
                                        "message": "missing text or invalid session",
                                    })).await;
                                    continue;
                                }
                                current_session = Some(session.clone());
                                let processor = app.agent.processor(
                                    ctx.user_id, ctx.tier, Some(event_tx.clone()));
                                let queue = app.queue.clone();
                                tokio::spawn(async move {
                                    queue.process(&session, &msg_text, processor, Some("ws")).await;
                                });
                            }
                            "abort" => {
                                if let Some(session) = &current_session {
                                    app.abort.set_abort(session);
                                }
                            }
                            other => {
                                warn!(kind = other, "unknown WebSocket frame type");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!("WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let frame = match event {
                    AgentEvent::Chunk(text) => Some(json!({ "type": "chunk", "text": text })),
                    AgentEvent::Thinking(text) => Some(json!({ "type": "thinking", "text": text })),
                    AgentEvent::Tool { name, preview } =>
                        Some(json!({ "type": "tool", "name": name, "args": preview })),
                    AgentEvent::Done { model } => Some(json!({ "type": "done", "model": model })),
                    AgentEvent::Error(message) => Some(json!({ "type": "error", "message": message })),
                    // Status narration is an SSE-only event; the WS frame set
                    // is chunk/tool/thinking/done/error/shutdown.
                    AgentEvent::Status(_) => None,
                };
                if let Some(frame) = frame {
                    send_json(&mut socket, &frame).await;
                }
            }
        }
    }

    debug!("WebSocket connection closed");
}

async fn send_json(socket: &mut WebSocket, value: &Value) {
    let _ = socket.send(WsMessage::Text(value.to_string())).await;
}
