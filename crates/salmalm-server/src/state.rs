// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Application assembly: one [`App`] owns every process-wide component and
//! is shared (as `Arc<App>`) with the axum handlers. Nothing here is a
//! module-global — lifecycle belongs to the struct.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, warn};

use salmalm_config::Config;
use salmalm_core::{
    AbortController, AgentLoop, CronService, MessageQueue, SessionStore, SubAgentManager,
};
use salmalm_model::{GatewayOptions, LlmGateway, UsageMeter};
use salmalm_tools::{ExecTool, ListDirTool, PythonEvalTool, ReadFileTool, ToolRegistry, WriteFileTool};
use salmalm_vault::Vault;

use crate::auth::AuthService;

/// System prompt for every new session. The cache boundary separates the
/// stable prefix from per-deployment context so Anthropic's prompt cache
/// keeps its hit rate.
const SYSTEM_PROMPT: &str = "\
You are SalmAlm, a personal AI gateway assistant. You can call tools to read \
and write files in your workspace, run allowlisted shell commands, and \
evaluate Python snippets. Be concise; prefer doing over explaining.
<!-- CACHE_BOUNDARY -->
Messages may arrive merged from a queue; treat newline-separated questions \
as one combined request.";

/// Completion notices land in the parent session as a system message, so
/// the user sees them on their next turn whatever channel they're on.
struct SessionNotifier {
    store: Arc<SessionStore>,
}

impl salmalm_core::Notifier for SessionNotifier {
    fn notify(&self, parent_session_id: &str, text: &str) {
        match self.store.load(parent_session_id, 0) {
            Ok(mut session) => {
                session.messages.push(salmalm_model::Message::system(text));
                if let Err(e) = self.store.persist(&session) {
                    warn!(session = parent_session_id, "notify persist failed: {e}");
                }
            }
            Err(e) => warn!(session = parent_session_id, "notify load failed: {e}"),
        }
    }
}

pub struct App {
    pub config: Config,
    pub vault: Arc<Mutex<Vault>>,
    pub meter: Arc<UsageMeter>,
    pub gateway: Arc<LlmGateway>,
    pub store: Arc<SessionStore>,
    pub tools: Arc<ToolRegistry>,
    pub queue: Arc<MessageQueue>,
    pub abort: Arc<AbortController>,
    pub agent: Arc<AgentLoop>,
    pub subagents: Arc<SubAgentManager>,
    pub cron: Arc<CronService>,
    pub auth: AuthService,
    /// Fired once on graceful shutdown so open WebSocket connections can
    /// send a `shutdown` frame before the listener drains.
    pub shutdown: tokio::sync::broadcast::Sender<()>,
    pub started_at: Instant,
}

pub type AppState = Arc<App>;

impl App {
    pub fn bootstrap(config: Config) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.home)
            .with_context(|| format!("creating {}", config.home.display()))?;
        std::fs::create_dir_all(config.workspace_dir())?;
        std::fs::create_dir_all(config.uploads_dir())?;

        // Vault: unlock with the configured password, or create on first run.
        let mut vault = Vault::new(config.vault_path());
        match &config.vault_password {
            Some(pw) if vault.exists() => {
                if !vault.unlock(pw) {
                    anyhow::bail!("vault unlock failed: wrong SALMALM_VAULT_PW");
                }
                info!("vault unlocked");
            }
            Some(pw) => {
                vault.create(pw).context("creating vault")?;
                info!("vault created at {}", vault.path().display());
            }
            None => {
                warn!("no SALMALM_VAULT_PW set; vault is locked and no provider keys are available");
            }
        }
        let vault = Arc::new(Mutex::new(vault));

        let meter = Arc::new(UsageMeter::new(config.cost_cap_usd));
        let gateway = Arc::new(LlmGateway::new(
            Arc::clone(&vault),
            Arc::clone(&meter),
            GatewayOptions {
                timeout: Duration::from_secs(config.llm_timeout_secs),
                max_tokens: config.max_tokens,
                temp_chat: config.temp_chat,
                temp_tool: config.temp_tool,
                cache_enabled: config.cache_enabled,
                fallback_order: config.fallback_order.clone(),
                base_urls: HashMap::new(),
            },
        ));

        let store = Arc::new(SessionStore::open(
            &config.db_path(),
            &config.sessions_dir(),
            SYSTEM_PROMPT,
        )?);

        let home_read = config
            .allow_home_read
            .then(|| dirs::home_dir())
            .flatten();
        let mut registry = ToolRegistry::new(config.workspace_dir(), home_read);
        registry.register(ReadFileTool);
        registry.register(WriteFileTool);
        registry.register(ListDirTool);
        registry.register(ExecTool { allow_shell: config.allow_shell });
        registry.register(PythonEvalTool);
        // The sub-agent tool's manager slot is filled once the manager
        // exists; the registry itself is an input to the agent the manager
        // wraps, so this is a two-phase hookup.
        let (subagent_tool, subagent_slot) = salmalm_core::SubAgentTool::new();
        registry.register(subagent_tool);
        let tools = Arc::new(registry.with_audit(store.clone()));

        let queue = Arc::new(MessageQueue::new(config.queue.clone()));
        let abort = Arc::new(AbortController::new());
        {
            // Interrupt mode propagates into the running agent loop.
            let abort_hook = Arc::clone(&abort);
            queue.set_interrupt_hook(Arc::new(move |session_id| {
                abort_hook.set_abort(session_id);
            }));
        }

        let agent = Arc::new(AgentLoop::new(
            Arc::clone(&gateway),
            Arc::clone(&tools),
            Arc::clone(&store),
            Arc::clone(&abort),
            Arc::clone(&queue),
            config.agent.clone(),
        ));
        let subagents = Arc::new(SubAgentManager::new(
            Arc::clone(&agent),
            Arc::clone(&queue),
            Arc::clone(&abort),
        ));
        let _ = subagent_slot.set(Arc::clone(&subagents));
        subagents.set_notifier(Arc::new(SessionNotifier { store: Arc::clone(&store) }));
        let cron = Arc::new(CronService::load(config.cron_path()));
        let auth = AuthService::open(&config.db_path(), Arc::clone(&vault))?;
        let (shutdown, _) = tokio::sync::broadcast::channel(1);

        Ok(Arc::new(Self {
            config,
            vault,
            meter,
            gateway,
            store,
            tools,
            queue,
            abort,
            agent,
            subagents,
            cron,
            auth,
            shutdown,
            started_at: Instant::now(),
        }))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
