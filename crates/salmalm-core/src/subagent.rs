// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Background sub-agents: independent agent loops on `subagent-*` session
//! ids, bounded by the queue's sub-agent semaphore. Completion is reported
//! through an injected [`Notifier`] so this module stays channel-agnostic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use salmalm_tools::AuthTier;

use crate::abort::AbortController;
use crate::agent::AgentLoop;
use crate::queue::MessageQueue;
use crate::session::ADMIN_USER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_session_id: String,
}

impl Job {
    pub fn session_id(&self) -> String {
        format!("subagent-{}", self.id)
    }
}

/// Channel-side completion callback. The web UI and WebSocket layer
/// implement this; the manager never learns what a channel is.
pub trait Notifier: Send + Sync {
    fn notify(&self, parent_session_id: &str, text: &str);
}

pub struct SubAgentManager {
    jobs: Mutex<HashMap<String, Job>>,
    agent: Arc<AgentLoop>,
    queue: Arc<MessageQueue>,
    abort: Arc<AbortController>,
    notifier: Mutex<Option<Arc<dyn Notifier>>>,
}

impl SubAgentManager {
    pub fn new(
        agent: Arc<AgentLoop>,
        queue: Arc<MessageQueue>,
        abort: Arc<AbortController>,
    ) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            agent,
            queue,
            abort,
            notifier: Mutex::new(None),
        }
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.notifier.lock().expect("jobs lock") = Some(notifier);
    }

    /// Start a background agent loop on the task. Returns the job id
    /// immediately; completion is pushed through the notifier.
    pub fn spawn(
        self: &Arc<Self>,
        task: &str,
        model: Option<String>,
        parent_session_id: &str,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let job = Job {
            id: id.clone(),
            task: task.to_string(),
            model: model.clone(),
            status: JobStatus::Running,
            result: None,
            started_at: Utc::now(),
            completed_at: None,
            parent_session_id: parent_session_id.to_string(),
        };
        let session_id = job.session_id();
        self.jobs.lock().expect("jobs lock").insert(id.clone(), job);
        info!(job = %id, session = %session_id, "sub-agent spawned");

        let manager = Arc::clone(self);
        let task_text = task.to_string();
        tokio::spawn(async move {
            // Pin the model for this sub-agent session before the first turn.
            if let Some(model) = model {
                if let Ok(mut session) = manager.agent.store().load(&session_id, ADMIN_USER) {
                    session.model_override = Some(model);
                    let _ = manager.agent.store().persist(&session);
                }
            }
            // Through the queue so the sub-agent global semaphore applies
            // and steering can reach the running loop.
            let processor = manager.agent.processor(ADMIN_USER, AuthTier::Admin, None);
            let result = manager
                .queue
                .process(&session_id, &task_text, processor, Some("subagent"))
                .await;
            manager.finish(&session_id, result);
        });
        id
    }

    fn finish(&self, session_id: &str, result: String) {
        let id = session_id.trim_start_matches("subagent-").to_string();
        let parent = {
            let mut jobs = self.jobs.lock().expect("jobs lock");
            let Some(job) = jobs.get_mut(&id) else {
                return;
            };
            if job.status == JobStatus::Cancelled {
                return;
            }
            job.status = if result.starts_with('❌') {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            job.completed_at = Some(Utc::now());
            job.result = Some(result.clone());
            job.parent_session_id.clone()
        };
        let preview: String = result.chars().take(500).collect();
        if let Some(notifier) = self.notifier.lock().expect("jobs lock").clone() {
            notifier.notify(&parent, &format!("🤖 Sub-agent [{id}] finished:\n{preview}"));
        }
    }

    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().expect("jobs lock").values().cloned().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.lock().expect("jobs lock").get(id).cloned()
    }

    /// Inject guidance into a running sub-agent. Falls back to an error
    /// string when the job is idle or unknown.
    pub fn steer(&self, id: &str, message: &str) -> String {
        let Some(job) = self.get(id) else {
            return format!("❌ Unknown sub-agent: {id}");
        };
        if job.status != JobStatus::Running {
            return format!("❌ Sub-agent [{id}] is not running ({:?})", job.status);
        }
        let session_id = job.session_id();
        if self.queue.inject_steer(&session_id, message) {
            "[steered]".to_string()
        } else {
            format!("❌ Sub-agent [{id}] is between turns; send a new task instead")
        }
    }

    pub fn stop(&self, id: &str) -> String {
        let Some(job) = self.get(id) else {
            return format!("❌ Unknown sub-agent: {id}");
        };
        self.abort.set_abort(&job.session_id());
        let mut jobs = self.jobs.lock().expect("jobs lock");
        if let Some(job) = jobs.get_mut(id) {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        }
        info!(job = id, "sub-agent stopped");
        format!("⏹️ Sub-agent [{id}] stopped")
    }

    /// Tail of the sub-agent's conversation, newest last.
    pub fn log(&self, id: &str, limit: usize) -> String {
        let Some(job) = self.get(id) else {
            return format!("❌ Unknown sub-agent: {id}");
        };
        match self.agent.store().load(&job.session_id(), ADMIN_USER) {
            Ok(session) => {
                let start = session.messages.len().saturating_sub(limit);
                session.messages[start..]
                    .iter()
                    .map(|m| format!("[{:?}] {}", m.role, m.text().chars().take(160).collect::<String>()))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Err(e) => {
                warn!(job = id, "log load failed: {e}");
                format!("❌ No log for sub-agent {id}")
            }
        }
    }
}

// ─── The sub_agent tool ───────────────────────────────────────────────────────

/// Tool surface over the manager, mirroring the agent-facing actions:
/// spawn, list, result, steer, stop, log.
///
/// The manager slot is filled after construction because the registry (which
/// owns this tool) is itself an input to the agent loop the manager wraps.
pub struct SubAgentTool {
    manager: Arc<std::sync::OnceLock<Arc<SubAgentManager>>>,
}

impl SubAgentTool {
    pub fn new() -> (Self, Arc<std::sync::OnceLock<Arc<SubAgentManager>>>) {
        let slot = Arc::new(std::sync::OnceLock::new());
        (Self { manager: Arc::clone(&slot) }, slot)
    }
}

#[async_trait::async_trait]
impl salmalm_tools::Tool for SubAgentTool {
    fn name(&self) -> &str {
        "sub_agent"
    }

    fn description(&self) -> &str {
        "Spawn and manage background sub-agents. Actions: spawn (task, model?), \
         list, result (agent_id), steer (agent_id, message), stop (agent_id), \
         log (agent_id, limit?)."
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["spawn", "list", "result", "steer", "stop", "log"]
                },
                "task": { "type": "string" },
                "model": { "type": "string" },
                "agent_id": { "type": "string" },
                "message": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["action"]
        })
    }

    fn tier(&self) -> salmalm_tools::AuthTier {
        salmalm_tools::AuthTier::Admin
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &salmalm_tools::ToolContext,
    ) -> String {
        let Some(manager) = self.manager.get() else {
            return "❌ Sub-agent manager is not initialized".to_string();
        };
        let action = args["action"].as_str().unwrap_or("list");
        match action {
            "spawn" => {
                let task = args["task"].as_str().unwrap_or("");
                if task.is_empty() {
                    return "❌ task is required".to_string();
                }
                let model = args["model"].as_str().map(str::to_string);
                let id = manager.spawn(task, model, &ctx.session_id);
                format!(
                    "🤖 Sub-agent spawned: [{id}]\nTask: {}\nWill notify on completion.",
                    task.chars().take(100).collect::<String>()
                )
            }
            "list" => {
                let jobs = manager.list();
                if jobs.is_empty() {
                    return "📋 No sub-agents.".to_string();
                }
                jobs.iter()
                    .map(|j| {
                        format!(
                            "[{}] {} — {:?}",
                            j.id,
                            j.task.chars().take(60).collect::<String>(),
                            j.status
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            "result" => {
                let id = args["agent_id"].as_str().unwrap_or("");
                match manager.get(id) {
                    Some(job) if job.status == JobStatus::Running => {
                        format!("⏳ [{id}] Still running.\nStarted: {}", job.started_at)
                    }
                    Some(job) => format!(
                        "[{id}] {:?}\n{}",
                        job.status,
                        job.result.as_deref().unwrap_or("(no result)")
                    ),
                    None => format!("❌ Unknown sub-agent: {id}"),
                }
            }
            "steer" => {
                let id = args["agent_id"].as_str().unwrap_or("");
                let message = args["message"].as_str().unwrap_or("");
                if id.is_empty() || message.is_empty() {
                    return "❌ agent_id and message are required".to_string();
                }
                manager.steer(id, message)
            }
            "stop" => manager.stop(args["agent_id"].as_str().unwrap_or("")),
            "log" => {
                let id = args["agent_id"].as_str().unwrap_or("");
                let limit = args["limit"].as_u64().unwrap_or(20) as usize;
                manager.log(id, limit)
            }
            other => format!(
                "❌ Unknown action: {other}. Available: spawn, list, result, steer, stop, log"
            ),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
