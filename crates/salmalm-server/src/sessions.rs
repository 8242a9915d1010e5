// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Session management endpoints: listing, CRUD, rollback, branching, and
//! per-session message views. Ownership checks live in the store; this
//! layer only translates HTTP ↔ store calls.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use salmalm_core::Session;
use salmalm_model::Role;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /sessions
pub async fn list(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    let sessions = app.store.list(ctx.user_id)?;
    Ok(Json(json!({ "sessions": sessions })))
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub id: Option<String>,
}

/// POST /sessions/create
pub async fn create(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = req
        .id
        .unwrap_or_else(|| format!("s-{}", uuid::Uuid::new_v4()));
    if !Session::valid_id(&id) {
        return Err(ApiError::bad_request("invalid session id"));
    }
    let session = app.store.load(&id, ctx.user_id)?;
    app.store.persist(&session)?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    pub id: String,
}

/// POST /sessions/delete
pub async fn delete(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<IdRequest>,
) -> Result<Json<Value>, ApiError> {
    app.store.delete(&req.id, ctx.user_id)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub id: String,
    pub title: String,
}

/// POST /sessions/rename
pub async fn rename(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Value>, ApiError> {
    app.store.rename(&req.id, ctx.user_id, &req.title)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct ClearRequest {
    #[serde(default)]
    pub keep: Option<String>,
}

/// POST /sessions/clear — delete all of the caller's sessions except `keep`.
pub async fn clear(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<ClearRequest>,
) -> Result<Json<Value>, ApiError> {
    let removed = app.store.clear(ctx.user_id, req.keep.as_deref())?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub id: String,
    #[serde(default = "one")]
    pub count: usize,
}

fn one() -> usize {
    1
}

/// POST /sessions/rollback — drop the last `count` turn pairs.
pub async fn rollback(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<RollbackRequest>,
) -> Result<Json<Value>, ApiError> {
    let removed = app.store.rollback(&req.id, ctx.user_id, req.count)?;
    Ok(Json(json!({ "removed_messages": removed })))
}

#[derive(Debug, Deserialize)]
pub struct BranchRequest {
    pub id: String,
    pub message_index: usize,
}

/// POST /sessions/branch — copy messages 0..=index into a new session.
pub async fn branch(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<BranchRequest>,
) -> Result<Json<Value>, ApiError> {
    let new_id = app.store.branch(&req.id, ctx.user_id, req.message_index)?;
    Ok(Json(json!({ "new_session_id": new_id })))
}

/// GET /sessions/:id/messages
pub async fn messages(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = app.store.load(&id, ctx.user_id)?;
    Ok(Json(json!({ "messages": session.messages })))
}

/// GET /sessions/:id/last — the most recent assistant reply.
pub async fn last(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = app.store.load(&id, ctx.user_id)?;
    let last = session
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .ok_or_else(|| ApiError::not_found("no assistant message yet"))?;
    Ok(Json(json!({
        "content": last.text(),
        "model": last.model,
    })))
}

/// GET /sessions/:id/summary
pub async fn summary(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = app.store.load(&id, ctx.user_id)?;
    Ok(Json(json!({
        "id": session.id,
        "title": session.effective_title(),
        "message_count": session.messages.len(),
        "turn_pairs": session.turn_pairs(),
        "total_chars": session.total_chars(),
        "parent_session_id": session.parent_session_id,
        "last_active": session.last_active,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AlternativesQuery {
    pub index: usize,
}

/// GET /sessions/:id/alternatives?index=N
pub async fn alternatives(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(q): Query<AlternativesQuery>,
) -> Result<Json<Value>, ApiError> {
    // Ownership check via load; alternatives have no owner column.
    let _ = app.store.load(&id, ctx.user_id)?;
    let alts = app.store.alternatives(&id, q.index)?;
    Ok(Json(json!({ "alternatives": alts })))
}
