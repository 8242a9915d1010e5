// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat endpoints: one-shot `/chat`, the SSE `/chat/stream` variant,
//! `/chat/abort`, and `/chat/regenerate`. All turns go through the message
//! queue so delivery modes and per-session serialization apply uniformly.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use base64::Engine;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

use salmalm_core::{AgentEvent, Session};
use salmalm_model::{
    router::{classify, pick_tier},
    ContentBlock, ImageSource, Message, MessageContent, Role,
};

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub image_mime: Option<String>,
    /// Reserved for channel-side localization; carried through untouched.
    #[serde(default)]
    pub lang: Option<String>,
}

fn session_id(req: &Option<String>) -> Result<String, ApiError> {
    let id = req.clone().unwrap_or_else(|| "web".to_string());
    if !Session::valid_id(&id) {
        return Err(ApiError::bad_request("invalid session id"));
    }
    Ok(id)
}

/// Attach an uploaded image to the session as a canonical image block, so
/// the next model call sees it regardless of provider.
fn attach_image(
    app: &AppState,
    session_id: &str,
    ctx: &AuthContext,
    image_base64: &str,
    image_mime: Option<&str>,
) -> Result<(), ApiError> {
    base64::engine::general_purpose::STANDARD
        .decode(image_base64)
        .map_err(|_| ApiError::bad_request("image_base64 is not valid base64"))?;
    let mut session = app.store.load(session_id, ctx.user_id)?;
    session.messages.push(Message {
        role: Role::User,
        content: MessageContent::Blocks(vec![ContentBlock::Image {
            source: ImageSource::Base64 {
                media_type: image_mime.unwrap_or("image/png").to_string(),
                data: image_base64.to_string(),
            },
        }]),
        tool_calls: vec![],
        tool_call_id: None,
        model: None,
        timestamp: Some(chrono::Utc::now()),
    });
    app.store.persist(&session)?;
    Ok(())
}

/// POST /chat — returns `{response, model, complexity}`.
pub async fn chat(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<Value>, ApiError> {
    let sid = session_id(&req.session)?;

    // Runtime queue configuration rides the same endpoint.
    if let Some(args) = req.message.strip_prefix("/queue") {
        let reply = app.queue.handle_queue_command(&sid, args);
        return Ok(Json(json!({ "response": reply, "model": "", "complexity": 0 })));
    }

    if let Some(image) = &req.image_base64 {
        attach_image(&app, &sid, &ctx, image, req.image_mime.as_deref())?;
    }

    let intent = classify(&req.message);
    let complexity = pick_tier(&req.message, intent, true);

    let processor = app.agent.processor(ctx.user_id, ctx.tier, None);
    let response = app.queue.process(&sid, &req.message, processor, Some("web")).await;

    // The model that actually answered (fallbacks may have rerouted it).
    let model = app
        .store
        .load(&sid, ctx.user_id)
        .ok()
        .and_then(|s| {
            s.messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .and_then(|m| m.model.clone())
        })
        .unwrap_or_default();

    Ok(Json(json!({
        "response": response,
        "model": model,
        "complexity": complexity,
    })))
}

/// POST /chat/stream — Server-Sent Events with types
/// `status | chunk | thinking | tool | done | error | close`.
pub async fn chat_stream(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let sid = session_id(&req.session)?;
    if !app.config.streaming_enabled {
        return Err(ApiError::bad_request("streaming is disabled on this host"));
    }
    if let Some(image) = &req.image_base64 {
        attach_image(&app, &sid, &ctx, image, req.image_mime.as_deref())?;
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<String>();

    let processor = app.agent.processor(ctx.user_id, ctx.tier, Some(tx));
    let queue = app.queue.clone();
    let message = req.message.clone();
    tokio::spawn(async move {
        let response = queue.process(&sid, &message, processor, Some("web")).await;
        let _ = done_tx.send(response);
    });

    let events =
        UnboundedReceiverStream::new(rx).map(|ev| Ok::<_, Infallible>(agent_event_to_sse(ev)));
    let close = stream::once(async move {
        let response = done_rx.await.unwrap_or_default();
        Ok(Event::default()
            .event("close")
            .data(json!({ "response": response }).to_string()))
    });

    Ok(Sse::new(events.chain(close)).keep_alive(KeepAlive::default()))
}

fn agent_event_to_sse(ev: AgentEvent) -> Event {
    match ev {
        AgentEvent::Status(text) => Event::default()
            .event("status")
            .data(json!({ "text": text }).to_string()),
        AgentEvent::Chunk(text) => Event::default()
            .event("chunk")
            .data(json!({ "text": text }).to_string()),
        AgentEvent::Thinking(text) => Event::default()
            .event("thinking")
            .data(json!({ "text": text }).to_string()),
        AgentEvent::Tool { name, preview } => Event::default()
            .event("tool")
            .data(json!({ "name": name, "args": preview }).to_string()),
        AgentEvent::Done { model } => Event::default()
            .event("done")
            .data(json!({ "model": model }).to_string()),
        AgentEvent::Error(message) => Event::default()
            .event("error")
            .data(json!({ "message": message }).to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    pub session: String,
}

/// POST /chat/abort — sets the cooperative abort flag; the running loop
/// freezes its streamed tokens as the final assistant message.
pub async fn abort(
    State(app): State<AppState>,
    Json(req): Json<AbortRequest>,
) -> Result<Json<Value>, ApiError> {
    if !Session::valid_id(&req.session) {
        return Err(ApiError::bad_request("invalid session id"));
    }
    app.abort.set_abort(&req.session);
    info!(session = %req.session, "abort via API");
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct RegenerateRequest {
    pub session_id: String,
    pub message_index: usize,
}

/// POST /chat/regenerate — re-produce the assistant turn at the given
/// user/assistant index. The displaced answer is kept as an inactive
/// alternative; the fresh one becomes active.
pub async fn regenerate(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<RegenerateRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut session = app.store.load(&req.session_id, ctx.user_id)?;

    // message_index counts only user/assistant turns, matching what the UI
    // renders.
    let ua: Vec<(usize, &Message)> = session
        .messages
        .iter()
        .enumerate()
        .filter(|(_, m)| matches!(m.role, Role::User | Role::Assistant))
        .collect();
    let Some(&(real_idx, target)) = ua.get(req.message_index) else {
        return Err(ApiError::bad_request("message_index out of range"));
    };
    if target.role != Role::Assistant {
        return Err(ApiError::bad_request("message_index is not an assistant turn"));
    }
    let old_content = target.text();
    let old_model = target.model.clone().unwrap_or_default();

    // The user turn that produced this answer.
    let user_text = session.messages[..real_idx]
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.text())
        .ok_or_else(|| ApiError::bad_request("no user message precedes this turn"))?;
    let user_idx = session.messages[..real_idx]
        .iter()
        .rposition(|m| m.role == Role::User)
        .expect("user message located above");

    app.store
        .save_alternative(&req.session_id, req.message_index, &old_content, &old_model, false)?;

    // Roll back through the displaced user turn; the agent re-appends it.
    session.messages.truncate(user_idx);
    app.store.persist(&session)?;

    let response = app
        .agent
        .run(&req.session_id, &user_text, ctx.user_id, ctx.tier, None)
        .await;

    app.store
        .save_alternative(&req.session_id, req.message_index, &response, "", true)?;

    Ok(Json(json!({ "response": response })))
}
