// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent execution loop: model call → tool calls → tool results →
//! model call, bounded by per-turn iteration, wall-clock, and cost budgets.
//! Cancellation is cooperative (the abort flag is polled before every model
//! call and tool dispatch); steered messages are injected at iteration
//! boundaries.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use salmalm_config::AgentConfig;
use salmalm_model::{
    CallFailure, CallOptions, LlmGateway, LlmResult, Message, StreamEvent, ToolSchema,
};
use salmalm_tools::{AuthTier, ToolRegistry};

use crate::abort::AbortController;
use crate::compact;
use crate::queue::{MessageQueue, Processor};
use crate::store::SessionStore;

/// Events streamed to the channel (SSE / WebSocket) during a turn.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Status(String),
    Chunk(String),
    Thinking(String),
    Tool { name: String, preview: String },
    Done { model: String },
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<AgentEvent>;

pub struct AgentLoop {
    gateway: Arc<LlmGateway>,
    tools: Arc<ToolRegistry>,
    store: Arc<SessionStore>,
    abort: Arc<AbortController>,
    queue: Arc<MessageQueue>,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(
        gateway: Arc<LlmGateway>,
        tools: Arc<ToolRegistry>,
        store: Arc<SessionStore>,
        abort: Arc<AbortController>,
        queue: Arc<MessageQueue>,
        config: AgentConfig,
    ) -> Self {
        Self { gateway, tools, store, abort, queue, config }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn abort_controller(&self) -> &Arc<AbortController> {
        &self.abort
    }

    pub fn gateway(&self) -> &Arc<LlmGateway> {
        &self.gateway
    }

    /// Build a queue [`Processor`] bound to this loop, so channels can hand
    /// the agent to [`MessageQueue::process`].
    pub fn processor(
        self: &Arc<Self>,
        user_id: i64,
        tier: AuthTier,
        events: Option<EventSender>,
    ) -> Processor {
        let agent = Arc::clone(self);
        Arc::new(move |session_id, message| {
            let agent = Arc::clone(&agent);
            let events = events.clone();
            Box::pin(async move {
                agent.run(&session_id, &message, user_id, tier, events).await
            })
        })
    }

    /// Run one full turn for a session and return the assistant reply.
    ///
    /// The session is persisted before this returns, so a crash between
    /// "reply shown" and the next turn never loses history.
    pub async fn run(
        &self,
        session_id: &str,
        user_message: &str,
        user_id: i64,
        tier: AuthTier,
        events: Option<EventSender>,
    ) -> String {
        let mut session = match self.store.load(session_id, user_id) {
            Ok(s) => s,
            Err(e) => return format!("❌ {e}"),
        };
        session.messages.push(Message::user(user_message));
        session.touch();

        self.abort.clear(session_id);
        self.abort.start_streaming(session_id);

        let started = Instant::now();
        let cost_at_start = self.gateway.meter.totals().total_cost_usd;
        let mut compacted_once = false;
        let mut reply = String::new();

        let tool_schemas: Vec<ToolSchema> = self
            .tools
            .specs_for_tier(tier)
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let mut iteration = 0u32;
        loop {
            iteration += 1;
            if iteration > self.config.max_iterations {
                reply = format!(
                    "⏹️ Stopped after {} tool iterations. Partial progress was kept; \
                     send a follow-up to continue.",
                    self.config.max_iterations
                );
                session.messages.push(Message::assistant(&reply));
                break;
            }

            // Cooperative cancellation, checked before every model call.
            if self.abort.is_aborted(session_id) {
                reply = self.freeze_partial(session_id, &mut session);
                break;
            }

            // Steered messages join the conversation at iteration boundaries.
            if let Some(steer) = self.queue.consume_steer(session_id) {
                info!(session = session_id, "steer message injected");
                send(&events, AgentEvent::Status("steering".into()));
                session.messages.push(Message::user(steer));
            }

            let opts = CallOptions {
                model: session.model_override.clone(),
                tools: tool_schemas.clone(),
                session_id: Some(session_id.to_string()),
                ..Default::default()
            };

            let result = self.call_model(session_id, &session.messages, opts, &events).await;

            // An abort raised mid-stream freezes whatever was accumulated;
            // the full model text is discarded in favor of the partial.
            if self.abort.is_aborted(session_id) {
                reply = self.freeze_partial(session_id, &mut session);
                break;
            }

            if result.error == Some(CallFailure::TokenOverflow) {
                if !compacted_once {
                    compacted_once = true;
                    warn!(session = session_id, "token overflow; compacting and retrying");
                    send(&events, AgentEvent::Status("compacting context".into()));
                    compact::compact(&mut session);
                    iteration -= 1; // the retry does not consume an iteration
                    continue;
                }
                reply = "❌ The conversation no longer fits the model's context window, \
                         even after compaction. Start a new session or delete old messages."
                    .to_string();
                session.messages.push(Message::assistant(&reply));
                break;
            }

            let mut assistant = Message::assistant(&result.content);
            assistant.tool_calls = result.tool_calls.clone();
            assistant.model = Some(result.model.clone());
            session.messages.push(assistant);

            if result.tool_calls.is_empty() {
                reply = result.content.clone();
                send(&events, AgentEvent::Done { model: result.model.clone() });
                break;
            }

            // Abort is also honored between the model call and tool dispatch.
            if self.abort.is_aborted(session_id) {
                reply = self.freeze_partial(session_id, &mut session);
                break;
            }

            // Bounded parallel execution, results pushed in call order so the
            // history stays aligned with the tool_use ids.
            for tc in &result.tool_calls {
                send(
                    &events,
                    AgentEvent::Tool {
                        name: tc.name.clone(),
                        preview: salmalm_tools::sanitize::args_preview(&tc.arguments),
                    },
                );
            }
            let outputs: Vec<(String, String)> = futures::stream::iter(
                result.tool_calls.iter().cloned().map(|tc| {
                    let tools = Arc::clone(&self.tools);
                    let id = tc.id.clone();
                    let name = tc.name.clone();
                    let args = tc.arguments.clone();
                    let sid = session_id.to_string();
                    async move {
                        let output = tools.execute(&name, &args, &sid, tier).await;
                        (id, output)
                    }
                }),
            )
            .buffered(self.config.max_parallel_tools.max(1))
            .collect()
            .await;

            for (id, output) in outputs {
                session.messages.push(Message::tool_result(id, output));
            }

            // Per-turn budgets: wall clock and cost delta since turn start.
            if started.elapsed().as_secs() > self.config.max_turn_secs {
                reply = format!(
                    "⏱️ Turn stopped: the {}s wall-clock budget was exceeded while \
                     running tools. Partial progress was kept.",
                    self.config.max_turn_secs
                );
                session.messages.push(Message::assistant(&reply));
                break;
            }
            let spent = self.gateway.meter.totals().total_cost_usd - cost_at_start;
            if self.config.max_turn_cost_usd > 0.0 && spent > self.config.max_turn_cost_usd {
                reply = format!(
                    "💸 Turn stopped: this turn spent ${spent:.4}, over the \
                     ${:.2} per-turn budget.",
                    self.config.max_turn_cost_usd
                );
                session.messages.push(Message::assistant(&reply));
                break;
            }
        }

        // Write-ahead durability: the store write completes before the reply
        // is handed back to the channel.
        if let Err(e) = self.store.persist(&session) {
            warn!(session = session_id, "persist failed: {e}");
            send(&events, AgentEvent::Error(format!("persist failed: {e}")));
        }
        self.abort.clear(session_id);
        reply
    }

    /// One model exchange; streams through the gateway when a caller is
    /// listening for events, otherwise uses the blocking call. Streamed
    /// tokens also feed the abort accumulator for partial recovery.
    async fn call_model(
        &self,
        session_id: &str,
        messages: &[Message],
        opts: CallOptions,
        events: &Option<EventSender>,
    ) -> LlmResult {
        match events {
            Some(tx) => {
                let abort = Arc::clone(&self.abort);
                let tx = tx.clone();
                let sid = session_id.to_string();
                self.gateway
                    .stream(messages, opts, move |event| match event {
                        StreamEvent::TextDelta { text } => {
                            abort.accumulate_token(&sid, text);
                            let _ = tx.send(AgentEvent::Chunk(text.clone()));
                        }
                        StreamEvent::ThinkingDelta { text } => {
                            let _ = tx.send(AgentEvent::Thinking(text.clone()));
                        }
                        StreamEvent::ToolUseStart { name, .. } => {
                            let _ = tx.send(AgentEvent::Status(format!("using {name}")));
                        }
                        StreamEvent::Error { message } => {
                            let _ = tx.send(AgentEvent::Error(message.clone()));
                        }
                        _ => {}
                    })
                    .await
            }
            None => {
                let result = self.gateway.call(messages, opts).await;
                // Keep abort recovery working for non-streamed turns too.
                self.abort.accumulate_token(session_id, &result.content);
                result
            }
        }
    }

    /// Freeze accumulated streamed tokens as the final assistant content.
    fn freeze_partial(&self, session_id: &str, session: &mut crate::session::Session) -> String {
        let partial = self
            .abort
            .take_partial(session_id)
            .unwrap_or_else(|| self.abort.accumulated(session_id));
        info!(session = session_id, chars = partial.len(), "turn aborted");
        if !partial.is_empty() {
            session.messages.push(Message::assistant(&partial));
            partial
        } else {
            "⏹️ Stopped.".to_string()
        }
    }
}

fn send(events: &Option<EventSender>, event: AgentEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
//
// The loop against live providers is covered by the workspace integration
// tests with stub servers; here we exercise the pure pieces.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_into_dropped_channel_is_harmless() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        send(&Some(tx), AgentEvent::Status("x".into()));
    }

    #[test]
    fn send_with_no_listener_is_noop() {
        send(&None, AgentEvent::Status("x".into()));
    }
}
