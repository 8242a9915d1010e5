// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Authentication: bearer session tokens, the vault API key, and the
//! session cookie all resolve to an [`AuthContext`]. Login failures feed a
//! per-IP exponential-backoff lockout; loopback is exempt so local tools
//! are never locked out.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use salmalm_tools::AuthTier;
use salmalm_vault::Vault;

use crate::state::AppState;

const PBKDF2_ITERATIONS: u32 = 100_000;
/// Failures tolerated before the lockout starts doubling.
const FREE_FAILURES: u32 = 3;
const MAX_LOCKOUT: Duration = Duration::from_secs(15 * 60);

/// Who is making this request. Attached as a request extension by the
/// middleware; user 0 is the local admin.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: i64,
    pub tier: AuthTier,
}

#[derive(Default)]
struct IpBackoff {
    failures: u32,
    locked_until: Option<Instant>,
}

pub struct AuthService {
    conn: Mutex<Connection>,
    vault: Arc<Mutex<Vault>>,
    /// token → user id; session tokens live for the process lifetime.
    tokens: Mutex<HashMap<String, i64>>,
    backoff: Mutex<HashMap<IpAddr, IpBackoff>>,
}

impl AuthService {
    pub fn open(db_path: &Path, vault: Arc<Mutex<Vault>>) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 username TEXT NOT NULL UNIQUE,
                 pw_hash TEXT NOT NULL,
                 salt TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            vault,
            tokens: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, username: &str, password: &str) -> Result<i64, String> {
        if username.is_empty() || password.len() < 8 {
            return Err("username required; password must be at least 8 characters".into());
        }
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = derive_hash(password, &salt);
        let conn = self.conn.lock().expect("auth lock");
        conn.execute(
            "INSERT INTO users (username, pw_hash, salt, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                username,
                hex::encode(hash),
                hex::encode(salt),
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|_| "username already taken".to_string())?;
        let id = conn.last_insert_rowid();
        info!(user = username, id, "user registered");
        Ok(id)
    }

    /// Verify credentials and mint a session token. `Err` carries a
    /// human-readable reason; callers must have passed the backoff gate.
    pub fn login(&self, username: &str, password: &str) -> Result<String, String> {
        let row: Option<(i64, String, String)> = {
            let conn = self.conn.lock().expect("auth lock");
            conn.query_row(
                "SELECT id, pw_hash, salt FROM users WHERE username = ?1",
                params![username],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(|e| e.to_string())?
        };
        let Some((id, stored_hash, salt)) = row else {
            // Hash anyway so unknown-user and wrong-password take the same time.
            let _ = derive_hash(password, &[0u8; 16]);
            return Err("invalid credentials".into());
        };
        let salt = hex::decode(salt).map_err(|_| "corrupt user record".to_string())?;
        let candidate = derive_hash(password, &salt);
        let stored = hex::decode(stored_hash).map_err(|_| "corrupt user record".to_string())?;
        if candidate.ct_eq(&stored[..]).unwrap_u8() != 1 {
            return Err("invalid credentials".into());
        }
        let token = mint_token();
        self.tokens.lock().expect("auth lock").insert(token.clone(), id);
        Ok(token)
    }

    /// Resolve a request's credentials. Accepted, in order: a minted session
    /// token (bearer or cookie), and the vault `api_token` (admin).
    pub fn authenticate(&self, headers: &HeaderMap) -> Option<AuthContext> {
        let presented = bearer(headers)
            .or_else(|| api_key_header(headers))
            .or_else(|| session_cookie(headers))?;

        if let Some(&user_id) = self.tokens.lock().expect("auth lock").get(presented) {
            return Some(AuthContext { user_id, tier: AuthTier::User });
        }
        let vault = self.vault.lock().expect("vault lock");
        if let Some(api_token) = vault.get("api_token") {
            if api_token.as_bytes().ct_eq(presented.as_bytes()).unwrap_u8() == 1 {
                return Some(AuthContext { user_id: 0, tier: AuthTier::Admin });
            }
        }
        None
    }

    // ── Exponential backoff per IP ────────────────────────────────────────────

    /// Seconds the caller must still wait, if locked out.
    pub fn locked_for(&self, ip: IpAddr) -> Option<u64> {
        if ip.is_loopback() {
            return None;
        }
        let backoff = self.backoff.lock().expect("auth lock");
        let entry = backoff.get(&ip)?;
        let until = entry.locked_until?;
        let now = Instant::now();
        (until > now).then(|| (until - now).as_secs().max(1))
    }

    /// Record a failed login: after the free allowance, lockout doubles with
    /// every further failure (2s, 4s, 8s, ... capped at 15 min).
    pub fn record_failure(&self, ip: IpAddr) {
        if ip.is_loopback() {
            return;
        }
        let mut backoff = self.backoff.lock().expect("auth lock");
        let entry = backoff.entry(ip).or_default();
        entry.failures += 1;
        if entry.failures > FREE_FAILURES {
            let exponent = (entry.failures - FREE_FAILURES).min(20);
            let lockout =
                Duration::from_secs(1u64 << exponent).min(MAX_LOCKOUT);
            entry.locked_until = Some(Instant::now() + lockout);
            warn!(%ip, failures = entry.failures, lockout_secs = lockout.as_secs(), "login lockout");
        }
    }

    pub fn record_success(&self, ip: IpAddr) {
        self.backoff.lock().expect("auth lock").remove(&ip);
    }
}

fn derive_hash(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    out
}

fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Tokens are opaque; hashing the randomness keeps them uniform hex.
    hex::encode(Sha256::digest(bytes))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key")?.to_str().ok()
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "salmalm_session").then_some(value)
    })
}

/// Axum middleware guarding every route except `/auth/*` and `/uptime`.
pub async fn require_auth(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path.starts_with("/auth/") || path == "/uptime" {
        return next.run(req).await;
    }
    // Loopback requests without credentials act as the local admin, which is
    // what keeps the CLI and local web UI usable before any user exists.
    let ctx = match app.auth.authenticate(req.headers()) {
        Some(ctx) => ctx,
        None if client_ip(&app, req.headers(), addr.ip()).is_loopback() => AuthContext {
            user_id: 0,
            tier: AuthTier::Admin,
        },
        None => {
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };
    req.extensions_mut().insert(ctx);
    next.run(req).await
}

/// Resolve the client IP, honoring `X-Forwarded-For` only when the operator
/// enabled proxy trust.
pub fn client_ip(app: &AppState, headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    if app.config.trust_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
        {
            return forwarded;
        }
    }
    peer
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, AuthService) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(Mutex::new(Vault::new(dir.path().join("vault"))));
        let svc = AuthService::open(&dir.path().join("db"), vault).unwrap();
        (dir, svc)
    }

    #[test]
    fn register_then_login_round_trips() {
        let (_d, svc) = service();
        svc.register("alice", "correct horse battery").unwrap();
        let token = svc.login("alice", "correct horse battery").unwrap();
        assert_eq!(token.len(), 64);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        let ctx = svc.authenticate(&headers).unwrap();
        assert!(ctx.user_id > 0);
        assert_eq!(ctx.tier, AuthTier::User);
    }

    #[test]
    fn wrong_password_rejected() {
        let (_d, svc) = service();
        svc.register("bob", "password123").unwrap();
        assert!(svc.login("bob", "password124").is_err());
        assert!(svc.login("carol", "whatever1").is_err());
    }

    #[test]
    fn short_password_rejected_at_registration() {
        let (_d, svc) = service();
        assert!(svc.register("x", "short").is_err());
    }

    #[test]
    fn duplicate_username_rejected() {
        let (_d, svc) = service();
        svc.register("dup", "password123").unwrap();
        assert!(svc.register("dup", "password456").is_err());
    }

    #[test]
    fn vault_api_token_grants_admin() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = Vault::new(dir.path().join("vault"));
        vault.create("pw").unwrap();
        vault.set("api_token", "secret-api-token-value").unwrap();
        let svc =
            AuthService::open(&dir.path().join("db"), Arc::new(Mutex::new(vault))).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret-api-token-value".parse().unwrap());
        let ctx = svc.authenticate(&headers).unwrap();
        assert_eq!(ctx.user_id, 0);
        assert_eq!(ctx.tier, AuthTier::Admin);
    }

    #[test]
    fn cookie_token_is_accepted() {
        let (_d, svc) = service();
        svc.register("eve", "password123").unwrap();
        let token = svc.login("eve", "password123").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("other=1; salmalm_session={token}")
                .parse()
                .unwrap(),
        );
        assert!(svc.authenticate(&headers).is_some());
    }

    #[test]
    fn backoff_locks_after_free_failures_and_doubles() {
        let (_d, svc) = service();
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        for _ in 0..FREE_FAILURES {
            svc.record_failure(ip);
        }
        assert!(svc.locked_for(ip).is_none(), "free allowance");
        svc.record_failure(ip);
        let first = svc.locked_for(ip).unwrap();
        svc.record_failure(ip);
        let second = svc.locked_for(ip).unwrap();
        assert!(second > first, "lockout must grow: {first} → {second}");
    }

    #[test]
    fn loopback_is_exempt_from_backoff() {
        let (_d, svc) = service();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..20 {
            svc.record_failure(ip);
        }
        assert!(svc.locked_for(ip).is_none());
    }

    #[test]
    fn success_resets_backoff() {
        let (_d, svc) = service();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        for _ in 0..6 {
            svc.record_failure(ip);
        }
        assert!(svc.locked_for(ip).is_some());
        svc.record_success(ip);
        assert!(svc.locked_for(ip).is_none());
    }
}
