// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-session cancellation flags with partial-response preservation.
//! Streamed tokens are accumulated here; on abort the accumulator is frozen
//! atomically so the user keeps whatever was generated before the stop.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::info;

#[derive(Default)]
struct State {
    flags: HashMap<String, bool>,
    accumulators: HashMap<String, Vec<String>>,
    partial_responses: HashMap<String, String>,
}

#[derive(Default)]
pub struct AbortController {
    state: Mutex<State>,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the accumulator at the start of a streaming response.
    pub fn start_streaming(&self, session_id: &str) {
        let mut s = self.state.lock().expect("abort lock");
        s.accumulators.insert(session_id.to_string(), Vec::new());
    }

    /// Append a streamed token. Once aborted, tokens are frozen and further
    /// appends are dropped.
    pub fn accumulate_token(&self, session_id: &str, token: &str) {
        let mut s = self.state.lock().expect("abort lock");
        if s.flags.get(session_id).copied().unwrap_or(false) {
            return;
        }
        s.accumulators
            .entry(session_id.to_string())
            .or_default()
            .push(token.to_string());
    }

    /// Set the abort flag and freeze the accumulated tokens as the partial
    /// response, in one critical section.
    pub fn set_abort(&self, session_id: &str) {
        let mut s = self.state.lock().expect("abort lock");
        s.flags.insert(session_id.to_string(), true);
        if let Some(tokens) = s.accumulators.remove(session_id) {
            s.partial_responses
                .insert(session_id.to_string(), tokens.concat());
        }
        info!(session = session_id, "abort requested");
    }

    pub fn is_aborted(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .expect("abort lock")
            .flags
            .get(session_id)
            .copied()
            .unwrap_or(false)
    }

    /// Consume the frozen partial response.
    pub fn take_partial(&self, session_id: &str) -> Option<String> {
        self.state
            .lock()
            .expect("abort lock")
            .partial_responses
            .remove(session_id)
    }

    /// Current accumulated text without consuming it.
    pub fn accumulated(&self, session_id: &str) -> String {
        self.state
            .lock()
            .expect("abort lock")
            .accumulators
            .get(session_id)
            .map(|t| t.concat())
            .unwrap_or_default()
    }

    /// Clear all per-session state (called at turn end).
    pub fn clear(&self, session_id: &str) {
        let mut s = self.state.lock().expect("abort lock");
        s.flags.remove(session_id);
        s.accumulators.remove(session_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
