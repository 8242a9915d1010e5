// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use salmalm_core::Schedule;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /cron
pub async fn list(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "jobs": app.cron.list() }))
}

#[derive(Debug, Deserialize)]
pub struct AddRequest {
    pub name: String,
    pub schedule: Schedule,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// POST /cron/add
pub async fn add(
    State(app): State<AppState>,
    Json(req): Json<AddRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }
    let job = app.cron.add(&req.name, req.schedule, &req.prompt, req.model);
    Ok(Json(json!({ "job": job })))
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    pub id: String,
}

/// POST /cron/delete
pub async fn delete(
    State(app): State<AppState>,
    Json(req): Json<IdRequest>,
) -> Result<Json<Value>, ApiError> {
    if !app.cron.remove(&req.id) {
        return Err(ApiError::not_found(format!("no cron job {}", req.id)));
    }
    Ok(Json(json!({ "ok": true })))
}

/// POST /cron/toggle
pub async fn toggle(
    State(app): State<AppState>,
    Json(req): Json<IdRequest>,
) -> Result<Json<Value>, ApiError> {
    match app.cron.toggle(&req.id) {
        Some(enabled) => Ok(Json(json!({ "enabled": enabled }))),
        None => Err(ApiError::not_found(format!("no cron job {}", req.id))),
    }
}

/// POST /cron/run — run a job immediately through the agent pipeline.
pub async fn run(
    State(app): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<IdRequest>,
) -> Result<Json<Value>, ApiError> {
    let processor = app.agent.processor(ctx.user_id, ctx.tier, None);
    let response = app.cron.run_job(&req.id, &app.queue, processor).await;
    Ok(Json(json!({ "response": response })))
}
