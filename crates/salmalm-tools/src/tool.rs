// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Authorization level required to invoke a tool. Callers carry the tier
/// they authenticated at; the registry refuses calls below a tool's tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthTier {
    Anonymous = 0,
    User = 1,
    Admin = 2,
}

/// Per-call context handed to every tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub tier: AuthTier,
    /// Directory tools may write under (and read from).
    pub workspace: PathBuf,
}

/// Trait every tool implements.
///
/// Tools return plain strings — results are fed back into the conversation
/// as `tool_result` content. Failures are returned as "❌"-prefixed strings
/// rather than errors so the model can read them and recover.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the arguments object.
    fn schema(&self) -> Value;
    fn tier(&self) -> AuthTier {
        AuthTier::User
    }
    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> String;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
