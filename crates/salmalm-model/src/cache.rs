// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! LRU response cache for tool-free, non-streaming calls. Keys are
//! deterministic fingerprints over (model, session scope, normalized
//! message tail); entries expire after ~12 hours and eviction is strictly
//! LRU beyond 256 entries.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::types::{Message, MessageContent};

const CAPACITY: usize = 256;
const TTL: Duration = Duration::from_secs(12 * 60 * 60);
/// How many trailing messages participate in the fingerprint.
const FINGERPRINT_TAIL: usize = 6;

struct Entry {
    text: String,
    created: Instant,
}

pub struct ResponseCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::with_ttl(TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(CAPACITY).expect("nonzero capacity"),
            )),
            ttl,
        }
    }

    pub fn get(&self, model: &str, messages: &[Message], session_id: Option<&str>) -> Option<String> {
        let key = fingerprint(model, messages, session_id);
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.get(&key) {
            Some(e) if e.created.elapsed() < self.ttl => Some(e.text.clone()),
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, model: &str, messages: &[Message], session_id: Option<&str>, text: &str) {
        if text.is_empty() {
            return;
        }
        let key = fingerprint(model, messages, session_id);
        self.entries.lock().expect("cache lock").put(
            key,
            Entry { text: text.to_string(), created: Instant::now() },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic hash over the model id, the session scope, and the last N
/// messages after normalization: trailing whitespace stripped, role order
/// preserved, non-text blocks excluded.
pub fn fingerprint(model: &str, messages: &[Message], session_id: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(session_id.unwrap_or("").as_bytes());
    let tail_start = messages.len().saturating_sub(FINGERPRINT_TAIL);
    for m in &messages[tail_start..] {
        hasher.update([0]);
        hasher.update(format!("{:?}", m.role).as_bytes());
        hasher.update([1]);
        let text = match &m.content {
            MessageContent::Text(t) => t.trim_end().to_string(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    crate::types::ContentBlock::Text { text } => Some(text.trim_end()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
        hasher.update(text.as_bytes());
    }
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
