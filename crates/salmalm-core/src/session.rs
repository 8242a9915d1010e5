// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use salmalm_model::{Message, Role};

/// The admin/local user. Sessions owned by user 0 predate multi-user mode;
/// user 0 also bypasses ownership checks.
pub const ADMIN_USER: i64 = 0;

pub const SESSION_ID_MAX_LEN: usize = 64;

/// Durable conversation state for one session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub user_id: i64,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub tts_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_voice: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, user_id: i64, system_prompt: &str) -> Self {
        Self {
            id: id.into(),
            user_id,
            messages: vec![Message::system(system_prompt)],
            parent_session_id: None,
            title: None,
            model_override: None,
            last_active: Utc::now(),
            tts_enabled: false,
            tts_voice: None,
        }
    }

    /// `[a-zA-Z0-9_-]`, 1..=64 chars.
    pub fn valid_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= SESSION_ID_MAX_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }

    /// Derive a title from the first user message when none is set.
    pub fn effective_title(&self) -> String {
        if let Some(t) = &self.title {
            return t.clone();
        }
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| {
                let text = m.text();
                let line = text.lines().next().unwrap_or("").trim();
                let mut title: String = line.chars().take(48).collect();
                if line.chars().count() > 48 {
                    title.push('…');
                }
                title
            })
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "New chat".to_string())
    }

    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.char_len()).sum()
    }

    /// Count of user/assistant message pairs (tool traffic excluded).
    pub fn turn_pairs(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .count()
            .min(
                self.messages
                    .iter()
                    .filter(|m| m.role == Role::Assistant)
                    .count(),
            )
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

/// Row summary returned by session listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: i64,
    pub title: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_with_system_prompt() {
        let s = Session::new("s1", 0, "be helpful");
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.messages[0].role, Role::System);
    }

    #[test]
    fn valid_ids() {
        assert!(Session::valid_id("abc-DEF_123"));
        assert!(Session::valid_id("subagent-42"));
        assert!(!Session::valid_id(""));
        assert!(!Session::valid_id("has space"));
        assert!(!Session::valid_id("dot.dot"));
        assert!(!Session::valid_id(&"x".repeat(65)));
        assert!(Session::valid_id(&"x".repeat(64)));
    }

    #[test]
    fn title_derived_from_first_user_message() {
        let mut s = Session::new("s1", 0, "sys");
        s.messages.push(Message::user("What is the weather like today?"));
        assert_eq!(s.effective_title(), "What is the weather like today?");
    }

    #[test]
    fn long_title_is_truncated_with_ellipsis() {
        let mut s = Session::new("s1", 0, "sys");
        s.messages.push(Message::user(&"a".repeat(100)));
        let t = s.effective_title();
        assert!(t.ends_with('…'));
        assert_eq!(t.chars().count(), 49);
    }

    #[test]
    fn explicit_title_wins() {
        let mut s = Session::new("s1", 0, "sys");
        s.title = Some("named".into());
        s.messages.push(Message::user("ignored"));
        assert_eq!(s.effective_title(), "named");
    }

    #[test]
    fn empty_session_titles_as_new_chat() {
        let s = Session::new("s1", 0, "sys");
        assert_eq!(s.effective_title(), "New chat");
    }

    #[test]
    fn turn_pairs_counts_min_of_user_and_assistant() {
        let mut s = Session::new("s1", 0, "sys");
        s.messages.push(Message::user("a"));
        s.messages.push(Message::assistant("b"));
        s.messages.push(Message::user("c"));
        assert_eq!(s.turn_pairs(), 1);
    }

    #[test]
    fn serde_round_trip_preserves_messages() {
        let mut s = Session::new("s1", 7, "sys");
        s.messages.push(Message::user("hello"));
        s.parent_session_id = Some("parent".into());
        let json = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "s1");
        assert_eq!(back.user_id, 7);
        assert_eq!(back.messages.len(), 2);
        assert_eq!(back.parent_session_id.as_deref(), Some("parent"));
    }
}
