// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! HTTP surface of the gateway: REST + SSE + WebSocket over axum, with
//! bearer / API-key / cookie authentication and per-IP login backoff.

mod auth;
mod auth_routes;
mod chat;
mod cron_routes;
mod error;
mod sessions;
mod state;
mod system;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tracing::info;

pub use auth::{AuthContext, AuthService};
pub use state::{App, AppState};

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat::chat))
        .route("/chat/stream", post(chat::chat_stream))
        .route("/chat/abort", post(chat::abort))
        .route("/chat/regenerate", post(chat::regenerate))
        .route("/sessions", get(sessions::list))
        .route("/sessions/create", post(sessions::create))
        .route("/sessions/delete", post(sessions::delete))
        .route("/sessions/rename", post(sessions::rename))
        .route("/sessions/clear", post(sessions::clear))
        .route("/sessions/rollback", post(sessions::rollback))
        .route("/sessions/branch", post(sessions::branch))
        .route("/sessions/:id/messages", get(sessions::messages))
        .route("/sessions/:id/last", get(sessions::last))
        .route("/sessions/:id/summary", get(sessions::summary))
        .route("/sessions/:id/alternatives", get(sessions::alternatives))
        .route("/cron", get(cron_routes::list))
        .route("/cron/add", post(cron_routes::add))
        .route("/cron/delete", post(cron_routes::delete))
        .route("/cron/toggle", post(cron_routes::toggle))
        .route("/cron/run", post(cron_routes::run))
        .route("/status", get(system::status))
        .route("/metrics", get(system::metrics))
        .route("/usage/daily", get(system::usage_daily))
        .route("/usage/monthly", get(system::usage_monthly))
        .route("/uptime", get(system::uptime))
        .route("/doctor", get(system::doctor))
        .route("/auth/login", post(auth_routes::login))
        .route("/auth/register", post(auth_routes::register))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            app.clone(),
            auth::require_auth,
        ))
        // Image uploads arrive base64-inline; cap bodies well above that.
        .layer(tower_http::limit::RequestBodyLimitLayer::new(16 * 1024 * 1024))
        .with_state(app)
}

/// Bind and serve until SIGTERM / Ctrl-C. The cron scheduler loop is
/// spawned alongside the listener.
pub async fn serve(app: AppState) -> anyhow::Result<()> {
    // Scheduled prompts run as the local admin.
    {
        let cron = Arc::clone(&app.cron);
        let queue = Arc::clone(&app.queue);
        let agent = Arc::clone(&app.agent);
        tokio::spawn(cron.run_loop(queue, move || {
            agent.processor(0, salmalm_tools::AuthTier::Admin, None)
        }));
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], app.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "salmalm listening");

    // On SIGTERM/Ctrl-C, tell open WebSocket connections first (they send a
    // `shutdown` frame and close with 1001), then let axum drain.
    let shutdown_tx = app.shutdown.clone();
    axum::serve(
        listener,
        router(app).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    })
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}
