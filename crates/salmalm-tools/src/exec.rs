// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Command execution tools. `exec` runs a narrow allowlist of first words
//! with a pattern blocklist on top; interpreters are refused in favor of
//! `python_eval`, which runs a denylist-checked snippet in a resource-capped
//! subprocess.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use crate::tool::{AuthTier, Tool, ToolContext};

const OUTPUT_CAP: usize = 16 * 1024;

const ALLOWED_FIRST_WORDS: [&str; 24] = [
    "ls", "cat", "head", "tail", "grep", "find", "echo", "pwd", "date", "whoami", "df", "du",
    "ps", "git", "curl", "wc", "uname", "uptime", "free", "which", "sort", "uniq", "file", "stat",
];

const BLOCKED_PATTERNS: [&str; 10] = [
    "rm -rf /",
    "mkfs",
    ":(){",
    "dd if=",
    "> /dev/",
    "shutdown",
    "reboot",
    "sudo ",
    "chmod 777",
    "curl | sh",
];

const INTERPRETERS: [&str; 8] = ["python", "python3", "node", "ruby", "perl", "sh", "bash", "zsh"];

/// Imports and attribute patterns `python_eval` refuses outright.
const PY_DENYLIST: [&str; 12] = [
    "import os",
    "import sys",
    "import subprocess",
    "import shutil",
    "import socket",
    "import ctypes",
    "from os",
    "from subprocess",
    "__import__",
    "__builtins__",
    "__subclasses__",
    "__globals__",
];

pub struct ExecTool {
    /// Pipes and redirects pass only when the operator opted in
    /// (`SALMALM_ALLOW_SHELL`).
    pub allow_shell: bool,
}

impl ExecTool {
    /// Policy gate; `Err` carries the user-visible refusal.
    fn check(&self, command: &str) -> Result<(), String> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err("❌ Empty command".into());
        }
        for pattern in BLOCKED_PATTERNS {
            if trimmed.contains(pattern) {
                warn!(command = trimmed, pattern, "blocked command");
                return Err(format!("❌ Blocked: dangerous pattern `{pattern}`"));
            }
        }
        let first = trimmed.split_whitespace().next().unwrap_or("");
        let first = first.rsplit('/').next().unwrap_or(first);
        if INTERPRETERS.contains(&first) {
            return Err(format!(
                "❌ Blocked: `{first}` is not allowed; use python_eval for code execution"
            ));
        }
        if !ALLOWED_FIRST_WORDS.contains(&first) {
            return Err(format!("❌ Blocked: `{first}` is not on the command allowlist"));
        }
        if !self.allow_shell && trimmed.contains(['|', '>', '<', ';', '&']) {
            return Err(
                "❌ Blocked: pipes/redirects require SALMALM_ALLOW_SHELL=1".into(),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Run a read-only shell command from a small allowlist (ls, cat, grep, git status, ...)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The command line to run" }
            },
            "required": ["command"]
        })
    }

    fn tier(&self) -> AuthTier {
        AuthTier::Admin
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> String {
        let command = args["command"].as_str().unwrap_or("");
        if let Err(msg) = self.check(command) {
            return msg;
        }

        let output = if self.allow_shell {
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&ctx.workspace)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
        } else {
            let mut parts = command.split_whitespace();
            let program = parts.next().unwrap_or("");
            Command::new(program)
                .args(parts)
                .current_dir(&ctx.workspace)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
        };

        match output {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                let err = String::from_utf8_lossy(&out.stderr);
                if !err.trim().is_empty() {
                    text.push_str("\n[stderr]\n");
                    text.push_str(&err);
                }
                if !out.status.success() {
                    text.push_str(&format!(
                        "\n[exit status: {}]",
                        out.status.code().unwrap_or(-1)
                    ));
                }
                truncate(text)
            }
            Err(e) => format!("❌ exec failed: {e}"),
        }
    }
}

pub struct PythonEvalTool;

impl PythonEvalTool {
    fn check(code: &str) -> Result<(), String> {
        for pattern in PY_DENYLIST {
            if code.contains(pattern) {
                warn!(pattern, "python_eval denied");
                return Err(format!("❌ Security blocked: `{pattern}` is not allowed"));
            }
        }
        // Dunder access beyond the explicit denylist is refused wholesale.
        if code.contains("__") {
            return Err("❌ Security blocked: dunder access is not allowed".into());
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for PythonEvalTool {
    fn name(&self) -> &str {
        "python_eval"
    }

    fn description(&self) -> &str {
        "Evaluate a short Python snippet in an isolated, resource-limited subprocess."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "Python source to evaluate" }
            },
            "required": ["code"]
        })
    }

    fn tier(&self) -> AuthTier {
        AuthTier::Admin
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> String {
        let code = args["code"].as_str().unwrap_or("");
        if let Err(msg) = Self::check(code) {
            return msg;
        }

        let mut cmd = Command::new("python3");
        cmd.arg("-I") // isolated: no site, no env paths, no user site-packages
            .arg("-")
            .current_dir(&ctx.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_rlimits(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return format!("❌ python_eval failed to start: {e}"),
        };
        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(code.as_bytes()).await.is_err() {
                return "❌ python_eval failed to write code".into();
            }
        }
        match child.wait_with_output().await {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                let err = String::from_utf8_lossy(&out.stderr);
                if !err.trim().is_empty() {
                    text.push_str("\n[stderr]\n");
                    text.push_str(&err);
                }
                if text.trim().is_empty() {
                    text = "(no output)".into();
                }
                truncate(text)
            }
            Err(e) => format!("❌ python_eval failed: {e}"),
        }
    }
}

/// CPU, address-space, fd, process, and file-size caps applied in the child
/// before exec. No-op on non-Unix targets.
#[cfg(unix)]
fn apply_rlimits(cmd: &mut Command) {
    fn limit(v: u64) -> libc::rlimit {
        libc::rlimit { rlim_cur: v, rlim_max: v }
    }
    unsafe {
        cmd.pre_exec(|| {
            libc::setrlimit(libc::RLIMIT_CPU, &limit(5)); // seconds
            libc::setrlimit(libc::RLIMIT_AS, &limit(256 * 1024 * 1024)); // bytes
            libc::setrlimit(libc::RLIMIT_NOFILE, &limit(16));
            libc::setrlimit(libc::RLIMIT_NPROC, &limit(8));
            libc::setrlimit(libc::RLIMIT_FSIZE, &limit(4 * 1024 * 1024));
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_cmd: &mut Command) {}

fn truncate(mut text: String) -> String {
    if text.len() > OUTPUT_CAP {
        text.truncate(OUTPUT_CAP);
        text.push_str("\n[output truncated]");
    }
    text
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn exec() -> ExecTool {
        ExecTool { allow_shell: false }
    }

    #[test]
    fn rm_rf_root_is_blocked() {
        let err = exec().check("rm -rf /").unwrap_err();
        assert!(err.contains("Blocked"));
    }

    #[test]
    fn interpreters_are_blocked() {
        for p in ["python3 evil.py", "bash -c id", "/usr/bin/python3 x.py"] {
            let err = exec().check(p).unwrap_err();
            assert!(err.contains("Blocked"), "{p} should be blocked");
        }
    }

    #[test]
    fn unlisted_command_is_blocked() {
        let err = exec().check("nmap localhost").unwrap_err();
        assert!(err.contains("allowlist"));
    }

    #[test]
    fn allowlisted_command_passes_policy() {
        assert!(exec().check("ls -la").is_ok());
        assert!(exec().check("git status").is_ok());
    }

    #[test]
    fn pipes_need_opt_in() {
        let err = exec().check("cat a.txt | grep x").unwrap_err();
        assert!(err.contains("SALMALM_ALLOW_SHELL"));
        let open = ExecTool { allow_shell: true };
        assert!(open.check("cat a.txt | grep x").is_ok());
    }

    #[test]
    fn blocklist_wins_over_allow_shell() {
        let open = ExecTool { allow_shell: true };
        assert!(open.check("echo hi; rm -rf /").is_err());
    }

    #[test]
    fn python_import_os_is_security_blocked() {
        let err = PythonEvalTool::check("import os\nos.system('id')").unwrap_err();
        assert!(err.contains("Security blocked"));
    }

    #[test]
    fn python_dunder_access_is_security_blocked() {
        let err = PythonEvalTool::check("().__class__.__mro__").unwrap_err();
        assert!(err.contains("Security blocked"));
    }

    #[test]
    fn plain_arithmetic_passes_policy() {
        assert!(PythonEvalTool::check("print(2 + 2)").is_ok());
    }

    #[tokio::test]
    async fn exec_runs_allowlisted_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            session_id: "s".into(),
            tier: AuthTier::Admin,
            workspace: dir.path().to_path_buf(),
        };
        let out = exec().execute(&json!({"command": "echo hello"}), &ctx).await;
        assert!(out.contains("hello"));
    }

    #[tokio::test]
    async fn exec_reports_blocked_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            session_id: "s".into(),
            tier: AuthTier::Admin,
            workspace: dir.path().to_path_buf(),
        };
        let out = exec().execute(&json!({"command": "rm -rf /"}), &ctx).await;
        assert!(out.starts_with("❌ Blocked"));
    }
}
