// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::sanitize::{args_preview, sanitize_path, strip_env_expansion, Access, PathJail, PATH_KEYS};
use crate::tool::{AuthTier, Tool, ToolContext};

/// Receives one line per tool dispatch. Implemented by the session store
/// (SQLite `audit_log` table); the registry itself never touches storage.
pub trait AuditSink: Send + Sync {
    fn append(&self, session_id: &str, tool: &str, args_preview: &str);
}

/// Canonical schema triple handed to the gateway.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Central registry: name → handler, plus the security policy applied to
/// every dispatch (tier check, path jail, env-expansion stripping, audit).
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    jail: PathJail,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ToolRegistry {
    pub fn new(workspace: PathBuf, home_read: Option<PathBuf>) -> Self {
        Self {
            tools: HashMap::new(),
            jail: PathJail { workspace, home_read },
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for every tool the given tier may call.
    pub fn specs_for_tier(&self, tier: AuthTier) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .filter(|t| tier >= t.tier())
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Dispatch one call. All failure modes come back as "❌" strings so the
    /// result can be fed to the model as a `tool_result`.
    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        session_id: &str,
        tier: AuthTier,
    ) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("❌ Unknown tool: {name}");
        };
        if tier < tool.tier() {
            warn!(tool = name, ?tier, "tool call below required tier");
            return format!("❌ Permission denied: {name} requires a higher auth tier");
        }

        let args = match self.sanitize_args(name, args) {
            Ok(a) => a,
            Err(msg) => return msg,
        };

        if let Some(audit) = &self.audit {
            audit.append(session_id, name, &args_preview(&args));
        }
        info!(tool = name, session = session_id, "tool dispatch");

        let ctx = ToolContext {
            session_id: session_id.to_string(),
            tier,
            workspace: self.jail.workspace.clone(),
        };
        match tokio::time::timeout(tool.timeout(), tool.execute(&args, &ctx)).await {
            Ok(result) => result,
            Err(_) => format!("❌ Tool timed out after {}s", tool.timeout().as_secs()),
        }
    }

    /// Rewrite string arguments: path keys are resolved against the jail
    /// (write access for the writing tools), everything except the exec
    /// command string loses `$VAR` expansions.
    fn sanitize_args(&self, tool_name: &str, args: &Value) -> Result<Value, String> {
        let Some(obj) = args.as_object() else {
            return Ok(args.clone());
        };
        let write_tool = matches!(tool_name, "write_file" | "edit_file" | "append_file");
        let mut out = serde_json::Map::new();
        for (key, value) in obj {
            let Some(s) = value.as_str() else {
                out.insert(key.clone(), value.clone());
                continue;
            };
            if PATH_KEYS.contains(&key.as_str()) {
                let access = if write_tool { Access::Write } else { Access::Read };
                let resolved = sanitize_path(s, &self.jail, access)?;
                out.insert(key.clone(), Value::String(resolved.display().to_string()));
            } else if key == "command" {
                // The exec tool enforces its own policy; stripping here would
                // mangle legitimate quoting before the allowlist sees it.
                out.insert(key.clone(), value.clone());
            } else {
                out.insert(key.clone(), Value::String(strip_env_expansion(s)));
            }
        }
        Ok(Value::Object(out))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct EchoTool {
        tier: AuthTier,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its arguments"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn tier(&self) -> AuthTier {
            self.tier
        }
        async fn execute(&self, args: &Value, _ctx: &ToolContext) -> String {
            format!("echo:{args}")
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps past its own timeout"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> String {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "never".into()
        }
    }

    fn registry() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ws")).unwrap();
        let reg = ToolRegistry::new(dir.path().join("ws"), None);
        (dir, reg)
    }

    #[tokio::test]
    async fn unknown_tool_reports_error_string() {
        let (_d, reg) = registry();
        let out = reg.execute("nope", &json!({}), "s1", AuthTier::Admin).await;
        assert!(out.starts_with("❌ Unknown tool"));
    }

    #[tokio::test]
    async fn tier_below_required_is_denied() {
        let (_d, mut reg) = registry();
        reg.register(EchoTool { tier: AuthTier::Admin });
        let out = reg.execute("echo", &json!({}), "s1", AuthTier::User).await;
        assert!(out.contains("Permission denied"));
    }

    #[tokio::test]
    async fn tier_at_or_above_required_passes() {
        let (_d, mut reg) = registry();
        reg.register(EchoTool { tier: AuthTier::User });
        let out = reg.execute("echo", &json!({"x": 1}), "s1", AuthTier::Admin).await;
        assert!(out.starts_with("echo:"));
    }

    #[tokio::test]
    async fn path_arg_traversal_is_blocked_before_dispatch() {
        let (_d, mut reg) = registry();
        reg.register(EchoTool { tier: AuthTier::User });
        let out = reg
            .execute("echo", &json!({"path": "../../etc/passwd"}), "s1", AuthTier::User)
            .await;
        assert!(out.contains("Path traversal blocked"));
    }

    #[tokio::test]
    async fn env_expansion_is_stripped_from_plain_args() {
        let (_d, mut reg) = registry();
        reg.register(EchoTool { tier: AuthTier::User });
        let out = reg
            .execute("echo", &json!({"text": "see $SECRET_TOKEN now"}), "s1", AuthTier::User)
            .await;
        assert!(!out.contains("$SECRET_TOKEN"));
        assert!(out.contains("see  now"));
    }

    #[tokio::test]
    async fn timeout_produces_error_string() {
        let (_d, mut reg) = registry();
        reg.register(SlowTool);
        let out = reg.execute("slow", &json!({}), "s1", AuthTier::User).await;
        assert!(out.contains("timed out"));
    }

    struct RecordingSink(Mutex<Vec<(String, String)>>);

    impl AuditSink for RecordingSink {
        fn append(&self, session_id: &str, tool: &str, _preview: &str) {
            self.0
                .lock()
                .unwrap()
                .push((session_id.to_string(), tool.to_string()));
        }
    }

    #[tokio::test]
    async fn every_dispatch_is_audited() {
        let (_d, mut reg) = registry();
        reg.register(EchoTool { tier: AuthTier::User });
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let reg = reg.with_audit(sink.clone());
        reg.execute("echo", &json!({}), "sess-9", AuthTier::User).await;
        let entries = sink.0.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], ("sess-9".to_string(), "echo".to_string()));
    }

    #[test]
    fn specs_filter_by_tier() {
        let (_d, mut reg) = registry();
        reg.register(EchoTool { tier: AuthTier::Admin });
        assert!(reg.specs_for_tier(AuthTier::User).is_empty());
        assert_eq!(reg.specs_for_tier(AuthTier::Admin).len(), 1);
    }
}
