// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Argument sanitization applied before any tool runs: path jailing,
//! environment-expansion stripping, and the secret-scrubbed preview written
//! to the audit log.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Argument names treated as filesystem paths.
pub const PATH_KEYS: [&str; 6] =
    ["path", "file_path", "image_path", "audio_path", "file1", "file2"];

/// Prefixes no tool may touch regardless of jail configuration.
const SENSITIVE_PREFIXES: [&str; 7] = [
    "/etc/", "/var/", "/root/", "/proc/", "/sys/", "C:\\Windows", "C:\\System",
];

/// Where a sanitized path is allowed to land.
#[derive(Debug, Clone)]
pub struct PathJail {
    pub workspace: PathBuf,
    /// When set, reads (not writes) may also resolve under this directory.
    pub home_read: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Resolve `raw` (following symlinks) and reject anything escaping the jail.
///
/// Relative paths resolve against the workspace. For writes the target may
/// not exist yet; its parent directory is resolved instead.
pub fn sanitize_path(raw: &str, jail: &PathJail, access: Access) -> Result<PathBuf, String> {
    if raw.contains("..") {
        return Err("❌ Path traversal blocked".into());
    }
    let candidate = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        jail.workspace.join(raw)
    };
    if is_sensitive(&candidate) {
        return Err("❌ Access to sensitive path blocked".into());
    }

    // Follow symlinks so a link escaping the jail cannot smuggle access.
    let resolved = resolve(&candidate, access)?;
    if is_sensitive(&resolved) {
        return Err("❌ Access to sensitive path blocked".into());
    }

    let workspace = jail.workspace.canonicalize().unwrap_or_else(|_| jail.workspace.clone());
    if resolved.starts_with(&workspace) {
        return Ok(resolved);
    }
    if access == Access::Read {
        if let Some(home) = &jail.home_read {
            let home = home.canonicalize().unwrap_or_else(|_| home.clone());
            if resolved.starts_with(&home) {
                return Ok(resolved);
            }
        }
    }
    Err("❌ Path outside workspace blocked".into())
}

fn resolve(candidate: &Path, access: Access) -> Result<PathBuf, String> {
    match candidate.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) if access == Access::Write => {
            // New file: canonicalize the parent and re-append the file name.
            let parent = candidate.parent().ok_or("❌ Invalid path")?;
            let name = candidate.file_name().ok_or("❌ Invalid path")?;
            let parent = parent
                .canonicalize()
                .map_err(|_| "❌ Path does not exist".to_string())?;
            Ok(parent.join(name))
        }
        Err(_) => Err("❌ Path does not exist".into()),
    }
}

fn is_sensitive(path: &Path) -> bool {
    let s = path.to_string_lossy();
    SENSITIVE_PREFIXES.iter().any(|p| s.starts_with(p))
}

/// Strip `$VAR` / `${VAR}` from non-command arguments so tool args can never
/// expand environment variables downstream.
pub fn strip_env_expansion(value: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\$\{[A-Za-z_][A-Za-z0-9_]*\}|\$[A-Za-z_][A-Za-z0-9_]*")
            .expect("static regex")
    });
    re.replace_all(value, "").into_owned()
}

/// Compact, secret-scrubbed argument preview for the audit log.
pub fn args_preview(args: &Value) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_\-]{20,}").expect("static regex"));
    let raw = args.to_string();
    let scrubbed = re.replace_all(&raw, "***");
    scrubbed.chars().take(200).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn jail() -> (tempfile::TempDir, PathJail) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ws")).unwrap();
        let jail = PathJail {
            workspace: dir.path().join("ws"),
            home_read: None,
        };
        (dir, jail)
    }

    #[test]
    fn dotdot_is_traversal_blocked() {
        let (_d, j) = jail();
        let err = sanitize_path("../../etc/passwd", &j, Access::Read).unwrap_err();
        assert!(err.contains("Path traversal blocked"));
    }

    #[test]
    fn sensitive_prefixes_rejected() {
        let (_d, j) = jail();
        for p in ["/etc/shadow", "/proc/self/environ", "/sys/kernel", "/root/.ssh/id_rsa"] {
            let err = sanitize_path(p, &j, Access::Read).unwrap_err();
            assert!(err.contains("blocked"), "{p} should be blocked");
        }
    }

    #[test]
    fn relative_path_resolves_inside_workspace() {
        let (_d, j) = jail();
        std::fs::write(j.workspace.join("notes.txt"), "x").unwrap();
        let p = sanitize_path("notes.txt", &j, Access::Read).unwrap();
        assert!(p.ends_with("notes.txt"));
    }

    #[test]
    fn write_to_new_file_in_workspace_allowed() {
        let (_d, j) = jail();
        let p = sanitize_path("fresh.txt", &j, Access::Write).unwrap();
        assert!(p.ends_with("fresh.txt"));
    }

    #[test]
    fn absolute_path_outside_workspace_blocked() {
        let (dir, j) = jail();
        let outside = dir.path().join("elsewhere.txt");
        std::fs::write(&outside, "x").unwrap();
        let err = sanitize_path(outside.to_str().unwrap(), &j, Access::Read).unwrap_err();
        assert!(err.contains("outside workspace"));
    }

    #[test]
    fn home_read_permits_reads_not_writes() {
        let (dir, mut j) = jail();
        let home = dir.path().join("home");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join("doc.txt"), "x").unwrap();
        j.home_read = Some(home.clone());

        let read = sanitize_path(home.join("doc.txt").to_str().unwrap(), &j, Access::Read);
        assert!(read.is_ok());
        let write = sanitize_path(home.join("doc.txt").to_str().unwrap(), &j, Access::Write);
        assert!(write.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_workspace_blocked() {
        let (dir, j) = jail();
        let outside = dir.path().join("secret.txt");
        std::fs::write(&outside, "x").unwrap();
        let link = j.workspace.join("sneaky");
        std::os::unix::fs::symlink(&outside, &link).unwrap();
        let err = sanitize_path("sneaky", &j, Access::Read).unwrap_err();
        assert!(err.contains("outside workspace"));
    }

    #[test]
    fn env_expansion_stripped() {
        assert_eq!(strip_env_expansion("echo $HOME"), "echo ");
        assert_eq!(strip_env_expansion("a ${PATH} b"), "a  b");
        assert_eq!(strip_env_expansion("no vars here"), "no vars here");
        assert_eq!(strip_env_expansion("price is $5"), "price is $5");
    }

    #[test]
    fn args_preview_scrubs_and_truncates() {
        let args = serde_json::json!({
            "key": "sk-ant-REDACTED",
            "text": "x".repeat(500),
        });
        let preview = args_preview(&args);
        assert!(preview.len() <= 200);
        assert!(!preview.contains("AbCdEfGhIjKlMnOpQrStUvWxYz"));
    }
}
