// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Builtin filesystem tools. Path arguments arrive already resolved and
//! jail-checked by the registry, so these tools only do I/O.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{AuthTier, Tool, ToolContext};

const READ_CAP: usize = 64 * 1024;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace (or home, when reads are allowed)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> String {
        let path = args["path"].as_str().unwrap_or("");
        match tokio::fs::read_to_string(path).await {
            Ok(mut text) => {
                if text.len() > READ_CAP {
                    text.truncate(READ_CAP);
                    text.push_str("\n[file truncated]");
                }
                text
            }
            Err(e) => format!("❌ read failed: {e}"),
        }
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file inside the workspace, creating it if needed."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    fn tier(&self) -> AuthTier {
        AuthTier::User
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> String {
        let path = args["path"].as_str().unwrap_or("");
        let content = args["content"].as_str().unwrap_or("");
        match tokio::fs::write(path, content).await {
            Ok(()) => format!("✅ Wrote {} bytes to {path}", content.len()),
            Err(e) => format!("❌ write failed: {e}"),
        }
    }
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List entries of a workspace directory."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Defaults to the workspace root" }
            }
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> String {
        let path = args["path"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| ctx.workspace.display().to_string());
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => return format!("❌ list failed: {e}"),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let kind = entry
                .file_type()
                .await
                .map(|t| if t.is_dir() { "dir" } else { "file" })
                .unwrap_or("?");
            names.push(format!("{kind}  {}", entry.file_name().to_string_lossy()));
        }
        names.sort();
        if names.is_empty() {
            "(empty)".into()
        } else {
            names.join("\n")
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
