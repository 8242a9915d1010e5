// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Operational endpoints: status, metrics, usage rollups, uptime, and the
//! self-diagnosis report.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

/// GET /status
pub async fn status(State(app): State<AppState>) -> Json<Value> {
    let totals = app.meter.totals();
    Json(json!({
        "uptime_secs": app.uptime_secs(),
        "active_lanes": app.queue.active_sessions(),
        "providers": app.gateway.available_providers(),
        "vault_unlocked": app.vault.lock().expect("vault lock").is_unlocked(),
        "usage": totals,
        "cost_cap_usd": app.config.cost_cap_usd,
    }))
}

/// GET /metrics
pub async fn metrics(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "gateway": app.gateway.metrics_snapshot(),
        "usage": app.meter.totals(),
        "models": app.meter.model_breakdown(),
    }))
}

/// GET /usage/daily
pub async fn usage_daily(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "daily": app.meter.daily_report(7) }))
}

/// GET /usage/monthly
pub async fn usage_monthly(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "monthly": app.meter.monthly_report(3) }))
}

/// GET /uptime — unauthenticated liveness probe.
pub async fn uptime(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "uptime_secs": app.uptime_secs() }))
}

/// GET /doctor — checks an operator reads before filing a bug.
pub async fn doctor(State(app): State<AppState>) -> Result<Json<Value>, ApiError> {
    let vault_unlocked = app.vault.lock().expect("vault lock").is_unlocked();
    let providers = app.gateway.available_providers();
    let sessions = app.store.list(0).map(|s| s.len());
    let cost_ok = app.meter.check_cost_cap().is_ok();

    let mut problems: Vec<String> = Vec::new();
    if !vault_unlocked {
        problems.push("vault is locked: set SALMALM_VAULT_PW".into());
    }
    if providers.is_empty() {
        problems.push("no provider API keys configured in the vault".into());
    }
    if !cost_ok {
        problems.push("cost cap reached: raise costCapUsd in config.json".into());
    }
    if let Err(e) = &sessions {
        problems.push(format!("session store unhealthy: {e}"));
    }

    Ok(Json(json!({
        "ok": problems.is_empty(),
        "vault_unlocked": vault_unlocked,
        "providers": providers,
        "session_count": sessions.unwrap_or(0),
        "cost_cap_ok": cost_ok,
        "problems": problems,
    })))
}
