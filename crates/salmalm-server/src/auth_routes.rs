// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::client_ip;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// POST /auth/login — rate-limited with per-IP exponential backoff. On
/// success the token is returned and also set as a session cookie.
pub async fn login(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    Json(creds): Json<Credentials>,
) -> Response {
    let ip = client_ip(&app, &headers, addr.ip());
    if let Some(wait) = app.auth.locked_for(ip) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, wait.to_string())],
            Json(json!({ "error": format!("too many failed logins; retry in {wait}s") })),
        )
            .into_response();
    }

    match app.auth.login(&creds.username, &creds.password) {
        Ok(token) => {
            app.auth.record_success(ip);
            info!(user = %creds.username, "login ok");
            let cookie = format!(
                "salmalm_session={token}; HttpOnly; SameSite=Strict; Path=/"
            );
            let mut response =
                Json(json!({ "token": token })).into_response();
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            response
        }
        Err(reason) => {
            app.auth.record_failure(ip);
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": reason })),
            )
                .into_response()
        }
    }
}

/// POST /auth/register
pub async fn register(
    State(app): State<AppState>,
    Json(creds): Json<Credentials>,
) -> Response {
    match app.auth.register(&creds.username, &creds.password) {
        Ok(id) => Json(json!({ "id": id })).into_response(),
        Err(reason) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": reason })),
        )
            .into_response(),
    }
}
