// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Durable session storage: a SQLite table keyed by session id plus one
//! JSON snapshot file per session, kept in sync on every write. The SQLite
//! side also hosts the audit log and the message-alternatives table used by
//! regenerate.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use salmalm_model::MessageContent;

use crate::session::{Session, SessionInfo, ADMIN_USER};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid session id")]
    InvalidId,
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("permission denied")]
    Denied,
    #[error("message index out of range")]
    BadIndex,
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt session data: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Alternative {
    pub id: i64,
    pub content: String,
    pub model: String,
    pub created_at: String,
    pub is_active: bool,
}

pub struct SessionStore {
    conn: Mutex<Connection>,
    sessions_dir: PathBuf,
    system_prompt: String,
}

impl SessionStore {
    pub fn open(
        db_path: &Path,
        sessions_dir: &Path,
        system_prompt: impl Into<String>,
    ) -> StoreResult<Self> {
        std::fs::create_dir_all(sessions_dir)?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                 id TEXT PRIMARY KEY,
                 user_id INTEGER NOT NULL DEFAULT 0,
                 parent_id TEXT,
                 title TEXT,
                 messages TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS audit_log (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts TEXT NOT NULL,
                 session_id TEXT,
                 tool TEXT NOT NULL,
                 args_preview TEXT
             );
             CREATE TABLE IF NOT EXISTS message_alternatives (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL,
                 message_index INTEGER NOT NULL,
                 content TEXT NOT NULL,
                 model TEXT DEFAULT '',
                 created_at TEXT NOT NULL,
                 is_active INTEGER DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_alt_session_msg
                 ON message_alternatives(session_id, message_index);
             CREATE TABLE IF NOT EXISTS usage_detail (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts TEXT NOT NULL,
                 session_id TEXT,
                 model TEXT NOT NULL,
                 input_tokens INTEGER DEFAULT 0,
                 output_tokens INTEGER DEFAULT 0,
                 cost REAL DEFAULT 0.0,
                 intent TEXT DEFAULT ''
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            sessions_dir: sessions_dir.to_path_buf(),
            system_prompt: system_prompt.into(),
        })
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }

    fn check_owner(session_user: i64, caller: i64) -> StoreResult<()> {
        if caller != ADMIN_USER && session_user != caller {
            return Err(StoreError::Denied);
        }
        Ok(())
    }

    /// Load a session, lazily creating one (with the system prompt as its
    /// first message) on first access.
    pub fn load(&self, id: &str, user_id: i64) -> StoreResult<Session> {
        if !Session::valid_id(id) {
            return Err(StoreError::InvalidId);
        }
        let row: Option<(i64, String)> = {
            let conn = self.conn.lock().expect("store lock");
            conn.query_row(
                "SELECT user_id, messages FROM sessions WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
        };
        match row {
            Some((owner, _)) => {
                Self::check_owner(owner, user_id)?;
                // The JSON snapshot is the full-fidelity copy; the DB row is
                // the queryable index. Read the snapshot, fall back to the
                // row's message JSON if the file is missing.
                let session = match std::fs::read_to_string(self.snapshot_path(id)) {
                    Ok(text) => serde_json::from_str(&text)?,
                    Err(_) => self.session_from_row(id)?,
                };
                Ok(session)
            }
            None => Ok(Session::new(id, user_id, &self.system_prompt)),
        }
    }

    fn session_from_row(&self, id: &str) -> StoreResult<Session> {
        let conn = self.conn.lock().expect("store lock");
        let (user_id, parent_id, title, messages, updated_at): (
            i64,
            Option<String>,
            Option<String>,
            String,
            String,
        ) = conn.query_row(
            "SELECT user_id, parent_id, title, messages, updated_at
             FROM sessions WHERE id = ?1",
            params![id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )?;
        // Legacy rows may carry internal marker keys inside message objects;
        // strip them before typed deserialization.
        let mut raw: Vec<serde_json::Value> = serde_json::from_str(&messages)?;
        salmalm_model::strip_internal_keys(&mut raw);
        Ok(Session {
            id: id.to_string(),
            user_id,
            messages: serde_json::from_value(serde_json::Value::Array(raw))?,
            parent_session_id: parent_id,
            title,
            model_override: None,
            last_active: updated_at.parse().unwrap_or_else(|_| Utc::now()),
            tts_enabled: false,
            tts_voice: None,
        })
    }

    /// Transactional write of the full session: DB row and JSON snapshot.
    /// Must complete before a turn's result is returned to the caller.
    pub fn persist(&self, session: &Session) -> StoreResult<()> {
        let messages_json = serde_json::to_string(&session.messages)?;
        {
            let conn = self.conn.lock().expect("store lock");
            conn.execute(
                "INSERT OR REPLACE INTO sessions
                     (id, user_id, parent_id, title, messages, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.id,
                    session.user_id,
                    session.parent_session_id,
                    session.effective_title(),
                    messages_json,
                    session.last_active.to_rfc3339(),
                ],
            )?;
        }
        let snapshot = serde_json::to_string_pretty(session)?;
        let tmp = self.snapshot_path(&session.id).with_extension("json.tmp");
        std::fs::write(&tmp, snapshot)?;
        std::fs::rename(&tmp, self.snapshot_path(&session.id))?;
        Ok(())
    }

    pub fn list(&self, user_id: i64) -> StoreResult<Vec<SessionInfo>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT id, user_id, parent_id, title, messages, updated_at
             FROM sessions ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, owner, parent, title, messages, updated_at) = row?;
            if user_id != ADMIN_USER && owner != user_id {
                continue;
            }
            let count = serde_json::from_str::<Vec<serde_json::Value>>(&messages)
                .map(|v| v.len())
                .unwrap_or(0);
            out.push(SessionInfo {
                id,
                user_id: owner,
                title: title.unwrap_or_else(|| "New chat".into()),
                message_count: count,
                updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
                parent_session_id: parent,
            });
        }
        Ok(out)
    }

    pub fn rename(&self, id: &str, user_id: i64, title: &str) -> StoreResult<()> {
        let mut session = self.load_existing(id, user_id)?;
        session.title = Some(title.to_string());
        self.persist(&session)
    }

    pub fn delete(&self, id: &str, user_id: i64) -> StoreResult<()> {
        // Ownership check through load_existing before removal.
        let _ = self.load_existing(id, user_id)?;
        let conn = self.conn.lock().expect("store lock");
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        conn.execute(
            "DELETE FROM message_alternatives WHERE session_id = ?1",
            params![id],
        )?;
        drop(conn);
        if let Err(e) = std::fs::remove_file(self.snapshot_path(id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session = id, "failed to remove snapshot: {e}");
            }
        }
        info!(session = id, "session deleted");
        Ok(())
    }

    /// Delete every session owned by `user_id` except `keep_id`.
    pub fn clear(&self, user_id: i64, keep_id: Option<&str>) -> StoreResult<usize> {
        let infos = self.list(user_id)?;
        let mut removed = 0;
        for info in infos {
            if Some(info.id.as_str()) == keep_id {
                continue;
            }
            if user_id != ADMIN_USER && info.user_id != user_id {
                continue;
            }
            self.delete(&info.id, user_id)?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn edit_message(
        &self,
        id: &str,
        user_id: i64,
        index: usize,
        new_content: &str,
    ) -> StoreResult<()> {
        let mut session = self.load_existing(id, user_id)?;
        let msg = session.messages.get_mut(index).ok_or(StoreError::BadIndex)?;
        msg.content = MessageContent::Text(new_content.to_string());
        self.persist(&session)
    }

    pub fn delete_message(&self, id: &str, user_id: i64, index: usize) -> StoreResult<()> {
        let mut session = self.load_existing(id, user_id)?;
        if index >= session.messages.len() {
            return Err(StoreError::BadIndex);
        }
        session.messages.remove(index);
        self.persist(&session)
    }

    /// Drop the last `count` user/assistant turn pairs (and any tool traffic
    /// between them).
    pub fn rollback(&self, id: &str, user_id: i64, count: usize) -> StoreResult<usize> {
        let mut session = self.load_existing(id, user_id)?;
        let user_indices: Vec<usize> = session
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == salmalm_model::Role::User)
            .map(|(i, _)| i)
            .collect();
        if user_indices.is_empty() || count == 0 {
            return Ok(0);
        }
        let cut_at = user_indices[user_indices.len().saturating_sub(count)];
        let removed = session.messages.len() - cut_at;
        session.messages.truncate(cut_at);
        self.persist(&session)?;
        Ok(removed)
    }

    /// Copy messages `0..=message_index` into a new session whose
    /// `parent_session_id` records the origin.
    pub fn branch(&self, id: &str, user_id: i64, message_index: usize) -> StoreResult<String> {
        let session = self.load_existing(id, user_id)?;
        if message_index >= session.messages.len() {
            return Err(StoreError::BadIndex);
        }
        let new_id = format!("b-{}", uuid::Uuid::new_v4());
        let branched = Session {
            id: new_id.clone(),
            user_id: session.user_id,
            messages: session.messages[..=message_index].to_vec(),
            parent_session_id: Some(session.id.clone()),
            title: None,
            model_override: session.model_override.clone(),
            last_active: Utc::now(),
            tts_enabled: session.tts_enabled,
            tts_voice: session.tts_voice.clone(),
        };
        self.persist(&branched)?;
        info!(from = id, to = %new_id, at = message_index, "session branched");
        Ok(new_id)
    }

    fn load_existing(&self, id: &str, user_id: i64) -> StoreResult<Session> {
        if !Session::valid_id(id) {
            return Err(StoreError::InvalidId);
        }
        let exists: bool = {
            let conn = self.conn.lock().expect("store lock");
            conn.query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()?
            .is_some()
        };
        if !exists {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.load(id, user_id)
    }

    // ─── Message alternatives (regenerate) ────────────────────────────────────

    pub fn save_alternative(
        &self,
        session_id: &str,
        message_index: usize,
        content: &str,
        model: &str,
        active: bool,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock");
        if active {
            conn.execute(
                "UPDATE message_alternatives SET is_active = 0
                 WHERE session_id = ?1 AND message_index = ?2",
                params![session_id, message_index as i64],
            )?;
        }
        conn.execute(
            "INSERT INTO message_alternatives
                 (session_id, message_index, content, model, created_at, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                message_index as i64,
                content,
                model,
                Utc::now().to_rfc3339(),
                active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn alternatives(
        &self,
        session_id: &str,
        message_index: usize,
    ) -> StoreResult<Vec<Alternative>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT id, content, model, created_at, is_active
             FROM message_alternatives
             WHERE session_id = ?1 AND message_index = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id, message_index as i64], |r| {
            Ok(Alternative {
                id: r.get(0)?,
                content: r.get(1)?,
                model: r.get(2)?,
                created_at: r.get(3)?,
                is_active: r.get::<_, i64>(4)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

/// Tool dispatches land in the `audit_log` table.
impl salmalm_tools::AuditSink for SessionStore {
    fn append(&self, session_id: &str, tool: &str, args_preview: &str) {
        let conn = self.conn.lock().expect("store lock");
        if let Err(e) = conn.execute(
            "INSERT INTO audit_log (ts, session_id, tool, args_preview)
             VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), session_id, tool, args_preview],
        ) {
            warn!("audit append failed: {e}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
