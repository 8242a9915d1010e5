// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// Environment variables take priority over the per-host `config.json`:
/// `SALMALM_HOME`, `SALMALM_PORT`, `SALMALM_VAULT_PW`, `SALMALM_TEMP_CHAT`,
/// `SALMALM_TEMP_TOOL`, `SALMALM_LLM_TIMEOUT`, `SALMALM_TRUST_PROXY`,
/// `SALMALM_ALLOW_SHELL`, `SALMALM_ALLOW_HOME_READ`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Home directory holding the vault, database, sessions, and workspace.
    pub home: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Vault password supplied via environment (headless deployments).
    #[serde(skip_serializing)]
    pub vault_password: Option<String>,
    /// Outbound LLM request timeout in seconds.
    pub llm_timeout_secs: u64,
    /// Sampling temperature for plain chat turns.
    pub temp_chat: f32,
    /// Sampling temperature when tools are offered (lower for precision).
    pub temp_tool: f32,
    /// Honor `X-Forwarded-For` when resolving client IPs.
    pub trust_proxy: bool,
    /// Allow pipes/redirects in the exec tool.
    pub allow_shell: bool,
    /// Allow tools to read (not write) under the user's home directory.
    pub allow_home_read: bool,
    /// Hard USD ceiling for cumulative provider spend. 0 disables the cap.
    pub cost_cap_usd: f64,
    /// Default max output tokens per provider call.
    pub max_tokens: u32,
    /// Provider fallback order tried when the primary call fails.
    pub fallback_order: Vec<String>,
    /// Whether `/chat` responses may be served from the response cache.
    pub cache_enabled: bool,
    /// Whether `/chat/stream` is enabled.
    pub streaming_enabled: bool,
    pub queue: QueueConfig,
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: default_home(),
            port: 8811,
            vault_password: None,
            llm_timeout_secs: 120,
            temp_chat: 0.7,
            temp_tool: 0.3,
            trust_proxy: false,
            allow_shell: false,
            allow_home_read: false,
            cost_cap_usd: 10.0,
            max_tokens: 4096,
            fallback_order: vec!["anthropic".into(), "xai".into(), "google".into()],
            cache_enabled: true,
            streaming_enabled: true,
            queue: QueueConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Config {
    pub fn workspace_dir(&self) -> PathBuf {
        self.home.join("workspace")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("salmalm.db")
    }

    pub fn vault_path(&self) -> PathBuf {
        self.home.join("vault")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.home.join("uploads")
    }

    pub fn cron_path(&self) -> PathBuf {
        self.home.join("cron.json")
    }
}

pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".salmalm")
}

// ─── Message queue ────────────────────────────────────────────────────────────

/// Queue delivery mode for inbound messages. One arm per behavior; see the
/// lane implementation in `salmalm-core`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    Collect,
    Steer,
    Followup,
    SteerBacklog,
    Interrupt,
}

impl QueueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collect" => Some(Self::Collect),
            "steer" => Some(Self::Steer),
            "followup" => Some(Self::Followup),
            "steer-backlog" => Some(Self::SteerBacklog),
            "interrupt" => Some(Self::Interrupt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Steer => "steer",
            Self::Followup => "followup",
            Self::SteerBacklog => "steer-backlog",
            Self::Interrupt => "interrupt",
        }
    }
}

/// What to do with the oldest/newest pending messages when a lane's pending
/// list exceeds its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    Old,
    New,
    Summarize,
}

impl DropPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "old" => Some(Self::Old),
            "new" => Some(Self::New),
            "summarize" => Some(Self::Summarize),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Old => "old",
            Self::New => "new",
            Self::Summarize => "summarize",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub mode: QueueMode,
    pub debounce_ms: u64,
    pub cap: usize,
    pub drop: DropPolicy,
    pub max_concurrent: MaxConcurrent,
    /// Per-channel mode overrides keyed by channel name ("web", "telegram").
    pub by_channel: std::collections::HashMap<String, QueueMode>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Collect,
            debounce_ms: 1000,
            cap: 20,
            drop: DropPolicy::Summarize,
            max_concurrent: MaxConcurrent::default(),
            by_channel: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxConcurrent {
    pub main: usize,
    pub subagent: usize,
}

impl Default for MaxConcurrent {
    fn default() -> Self {
        Self { main: 4, subagent: 8 }
    }
}

// ─── Agent loop budgets ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Maximum model ↔ tool iterations per turn.
    pub max_iterations: u32,
    /// Wall-clock budget per turn in seconds.
    pub max_turn_secs: u64,
    /// Maximum additional USD spend per turn (0 disables the per-turn cap).
    pub max_turn_cost_usd: f64,
    /// Bound on tools executed concurrently within one iteration.
    pub max_parallel_tools: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_turn_secs: 180,
            max_turn_cost_usd: 2.0,
            max_parallel_tools: 4,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
