// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::{Config, QueueConfig};

/// Resolve the home directory: `SALMALM_HOME` wins, then `~/.salmalm`.
pub fn home_dir() -> PathBuf {
    std::env::var_os("SALMALM_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(crate::default_home)
}

/// Load configuration from `<home>/config.json` (if present) and apply
/// environment-variable overrides on top.
pub fn load() -> anyhow::Result<Config> {
    load_from(&home_dir())
}

/// Like [`load`] but with an explicit home directory (used by tests).
pub fn load_from(home: &Path) -> anyhow::Result<Config> {
    let mut config = read_config_file(home)?;
    config.home = home.to_path_buf();

    // queue.json overrides the queue block; it predates config.json and is
    // still what the /queue command persists.
    let queue_path = home.join("queue.json");
    if queue_path.is_file() {
        match std::fs::read_to_string(&queue_path)
            .map_err(anyhow::Error::from)
            .and_then(|t| serde_json::from_str::<QueueConfig>(&t).map_err(Into::into))
        {
            Ok(q) => config.queue = q,
            Err(e) => warn!(path = %queue_path.display(), "failed to load queue config: {e}"),
        }
    }

    apply_env(&mut config);
    Ok(config)
}

fn read_config_file(home: &Path) -> anyhow::Result<Config> {
    let path = home.join("config.json");
    if !path.is_file() {
        return Ok(Config::default());
    }
    debug!(path = %path.display(), "loading config");
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn apply_env(config: &mut Config) {
    if let Some(port) = env_parse::<u16>("SALMALM_PORT") {
        config.port = port;
    }
    if let Ok(pw) = std::env::var("SALMALM_VAULT_PW") {
        if !pw.is_empty() {
            config.vault_password = Some(pw);
        }
    }
    if let Some(t) = env_parse::<u64>("SALMALM_LLM_TIMEOUT") {
        config.llm_timeout_secs = t;
    }
    if let Some(t) = env_parse::<f32>("SALMALM_TEMP_CHAT") {
        config.temp_chat = t;
    }
    if let Some(t) = env_parse::<f32>("SALMALM_TEMP_TOOL") {
        config.temp_tool = t;
    }
    if let Some(v) = env_flag("SALMALM_TRUST_PROXY") {
        config.trust_proxy = v;
    }
    if let Some(v) = env_flag("SALMALM_ALLOW_SHELL") {
        config.allow_shell = v;
    }
    if let Some(v) = env_flag("SALMALM_ALLOW_HOME_READ") {
        config.allow_home_read = v;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparseable {name}={raw:?}");
            None
        }
    }
}

/// "1", "true", "yes" (case-insensitive) enable; anything else disables.
fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    Some(matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    ))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = load_from(dir.path()).unwrap();
        assert_eq!(c.port, Config::default().port);
        assert_eq!(c.home, dir.path());
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"port": 9000, "costCapUsd": 5.5}"#,
        )
        .unwrap();
        let c = load_from(dir.path()).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.cost_cap_usd, 5.5);
    }

    #[test]
    fn queue_json_overrides_queue_block() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("queue.json"),
            r#"{"mode": "steer", "debounceMs": 250, "cap": 5, "drop": "old"}"#,
        )
        .unwrap();
        let c = load_from(dir.path()).unwrap();
        assert_eq!(c.queue.mode, crate::QueueMode::Steer);
        assert_eq!(c.queue.debounce_ms, 250);
        assert_eq!(c.queue.cap, 5);
    }

    #[test]
    fn invalid_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{not json").unwrap();
        assert!(load_from(dir.path()).is_err());
    }
}
