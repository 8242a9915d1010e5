// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Lane-based message queue: one FIFO lane per session with a serial
//! (1-permit) semaphore, two global concurrency semaphores (main /
//! sub-agent), five delivery modes, and cap/drop overflow policies.
//!
//! Per-session serialization is the invariant everything else leans on: at
//! most one processor call runs per lane at a time, so all session mutation
//! happens under the lane's semaphore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Semaphore};
use tracing::{info, warn};

use salmalm_config::{DropPolicy, QueueConfig, QueueMode};

/// The function a lane invokes to process one (possibly merged) message.
/// Receives (session_id, message) and returns the reply text.
pub type Processor = Arc<dyn Fn(String, String) -> BoxFuture<'static, String> + Send + Sync>;

/// Called on interrupt so cancellation propagates beyond the task handle
/// (AgentLoop polls the abort flag; sub-agents are not implicitly stopped).
pub type InterruptHook = Arc<dyn Fn(&str) + Send + Sync>;

const LANE_IDLE_SECS: u64 = 3600;
const CLEANUP_EVERY_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub text: String,
    pub queued_at: Instant,
    pub image_ref: Option<String>,
}

impl QueuedMessage {
    fn new(text: String) -> Self {
        Self { text, queued_at: Instant::now(), image_ref: None }
    }
}

/// Per-session overrides set by the `/queue` command.
#[derive(Debug, Clone, Default)]
pub struct LaneOptions {
    pub mode: Option<QueueMode>,
    pub debounce_ms: Option<u64>,
    pub cap: Option<usize>,
    pub drop: Option<DropPolicy>,
}

struct Lane {
    session_id: String,
    global_sem: Arc<Semaphore>,
    session_sem: Arc<Semaphore>,
    pending: Mutex<Vec<QueuedMessage>>,
    collect_waiters: Mutex<Vec<oneshot::Sender<String>>>,
    /// Incremented on every collect enqueue; a debounce task only fires if
    /// its generation is still current (later arrivals supersede it).
    debounce_gen: AtomicU64,
    steer_slot: Mutex<Option<String>>,
    current_task: Mutex<Option<tokio::task::AbortHandle>>,
    last_active: Mutex<Instant>,
    options: Mutex<LaneOptions>,
}

impl Lane {
    fn new(session_id: String, global_sem: Arc<Semaphore>) -> Self {
        Self {
            session_id,
            global_sem,
            session_sem: Arc::new(Semaphore::new(1)),
            pending: Mutex::new(Vec::new()),
            collect_waiters: Mutex::new(Vec::new()),
            debounce_gen: AtomicU64::new(0),
            steer_slot: Mutex::new(None),
            current_task: Mutex::new(None),
            last_active: Mutex::new(Instant::now()),
            options: Mutex::new(LaneOptions::default()),
        }
    }

    fn busy(&self) -> bool {
        self.session_sem.available_permits() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Effective {
    mode: QueueMode,
    debounce: Duration,
    cap: usize,
    drop: DropPolicy,
}

pub struct MessageQueue {
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
    main_sem: Arc<Semaphore>,
    subagent_sem: Arc<Semaphore>,
    config: QueueConfig,
    on_interrupt: Mutex<Option<InterruptHook>>,
    cleanup_ts: Mutex<Instant>,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            main_sem: Arc::new(Semaphore::new(config.max_concurrent.main)),
            subagent_sem: Arc::new(Semaphore::new(config.max_concurrent.subagent)),
            config,
            lanes: Mutex::new(HashMap::new()),
            on_interrupt: Mutex::new(None),
            cleanup_ts: Mutex::new(Instant::now()),
        }
    }

    /// Install the interrupt propagation hook (set once at startup).
    pub fn set_interrupt_hook(&self, hook: InterruptHook) {
        *self.on_interrupt.lock().expect("queue lock") = Some(hook);
    }

    fn lane(&self, session_id: &str) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().expect("queue lock");
        lanes
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let sem = if session_id.contains("subagent") {
                    Arc::clone(&self.subagent_sem)
                } else {
                    Arc::clone(&self.main_sem)
                };
                Arc::new(Lane::new(session_id.to_string(), sem))
            })
            .clone()
    }

    fn effective(&self, lane: &Lane, channel: Option<&str>) -> Effective {
        let opts = lane.options.lock().expect("lane lock").clone();
        let mode = opts.mode.unwrap_or_else(|| {
            channel
                .and_then(|c| self.config.by_channel.get(c).copied())
                .unwrap_or(self.config.mode)
        });
        Effective {
            mode,
            debounce: Duration::from_millis(opts.debounce_ms.unwrap_or(self.config.debounce_ms)),
            cap: opts.cap.unwrap_or(self.config.cap),
            drop: opts.drop.unwrap_or(self.config.drop),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.lanes.lock().expect("queue lock").len()
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.lanes
            .lock()
            .expect("queue lock")
            .get(session_id)
            .map(|l| l.pending.lock().expect("lane lock").len())
            .unwrap_or(0)
    }

    /// Take a steered message, if one was injected while this session's
    /// processor was running. Called by the agent loop at iteration
    /// boundaries.
    pub fn consume_steer(&self, session_id: &str) -> Option<String> {
        let lanes = self.lanes.lock().expect("queue lock");
        let taken = lanes
            .get(session_id)?
            .steer_slot
            .lock()
            .expect("lane lock")
            .take();
        taken
    }

    /// Place a message in a busy lane's steer slot without going through a
    /// full `process` call. Returns `false` when the lane is idle or absent
    /// (steering only makes sense into a running turn).
    pub fn inject_steer(&self, session_id: &str, message: &str) -> bool {
        let lanes = self.lanes.lock().expect("queue lock");
        match lanes.get(session_id) {
            Some(lane) if lane.busy() => {
                *lane.steer_slot.lock().expect("lane lock") = Some(message.to_string());
                true
            }
            _ => false,
        }
    }

    /// True when a processor call is currently running for this session.
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.lanes
            .lock()
            .expect("queue lock")
            .get(session_id)
            .map(|l| l.busy())
            .unwrap_or(false)
    }

    /// Main entry: route one inbound message through the session's lane
    /// according to the effective delivery mode, returning the reply.
    pub async fn process(
        &self,
        session_id: &str,
        message: &str,
        processor: Processor,
        channel: Option<&str>,
    ) -> String {
        let lane = self.lane(session_id);
        *lane.last_active.lock().expect("lane lock") = Instant::now();
        self.cleanup_idle();

        let eff = self.effective(&lane, channel);
        match eff.mode {
            QueueMode::Collect => self.handle_collect(lane, message, eff, processor).await,
            QueueMode::Followup => self.handle_followup(lane, message, eff, processor).await,
            QueueMode::Steer => {
                self.handle_steer(lane, message, eff, processor, false).await
            }
            QueueMode::SteerBacklog => {
                self.handle_steer(lane, message, eff, processor, true).await
            }
            QueueMode::Interrupt => self.handle_interrupt(lane, message, processor).await,
        }
    }

    // ─── Mode handlers ────────────────────────────────────────────────────────

    /// Collect: debounce, merge the pending batch into one newline-joined
    /// turn, process once. Every caller that batched into the same debounce
    /// receives the same result.
    async fn handle_collect(
        &self,
        lane: Arc<Lane>,
        message: &str,
        eff: Effective,
        processor: Processor,
    ) -> String {
        {
            let mut pending = lane.pending.lock().expect("lane lock");
            pending.push(QueuedMessage::new(message.to_string()));
            apply_overflow(&mut pending, eff.cap, eff.drop);
        }
        let (tx, rx) = oneshot::channel();
        lane.collect_waiters.lock().expect("lane lock").push(tx);

        let generation = lane.debounce_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let task_lane = Arc::clone(&lane);
        tokio::spawn(async move {
            tokio::time::sleep(eff.debounce).await;
            if task_lane.debounce_gen.load(Ordering::SeqCst) != generation {
                return; // superseded by a newer arrival
            }
            let _session = task_lane
                .session_sem
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let _global = task_lane
                .global_sem
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");

            let waiters: Vec<oneshot::Sender<String>> = task_lane
                .collect_waiters
                .lock()
                .expect("lane lock")
                .drain(..)
                .collect();
            let batch: Vec<QueuedMessage> = task_lane
                .pending
                .lock()
                .expect("lane lock")
                .drain(..)
                .collect();
            if batch.is_empty() {
                for w in waiters {
                    let _ = w.send(String::new());
                }
                return;
            }
            info!(
                session = %task_lane.session_id,
                merged = batch.len(),
                "collect: processing batch"
            );
            let merged = merge_messages(&batch);
            let result = run_tracked(&task_lane, processor, merged).await;
            for w in waiters {
                let _ = w.send(result.clone());
            }
        });

        rx.await.unwrap_or_else(|_| "[cancelled]".to_string())
    }

    /// Followup: wait for the current execution to finish, then process the
    /// drained backlog as the next turn.
    async fn handle_followup(
        &self,
        lane: Arc<Lane>,
        message: &str,
        eff: Effective,
        processor: Processor,
    ) -> String {
        {
            let mut pending = lane.pending.lock().expect("lane lock");
            pending.push(QueuedMessage::new(message.to_string()));
            apply_overflow(&mut pending, eff.cap, eff.drop);
        }
        let _session = lane
            .session_sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        let _global = lane
            .global_sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");

        let batch: Vec<QueuedMessage> =
            lane.pending.lock().expect("lane lock").drain(..).collect();
        if batch.is_empty() {
            return String::new();
        }
        let merged = merge_messages(&batch);
        run_tracked(&lane, processor, merged).await
    }

    /// Steer: inject into the running agent at its next iteration boundary.
    /// With `backlog`, the message is also queued for re-processing after
    /// the current turn. Idle lanes fall back to collect.
    async fn handle_steer(
        &self,
        lane: Arc<Lane>,
        message: &str,
        eff: Effective,
        processor: Processor,
        backlog: bool,
    ) -> String {
        if lane.busy() {
            *lane.steer_slot.lock().expect("lane lock") = Some(message.to_string());
            if backlog {
                let mut pending = lane.pending.lock().expect("lane lock");
                pending.push(QueuedMessage::new(message.to_string()));
                apply_overflow(&mut pending, eff.cap, eff.drop);
            }
            info!(session = %lane.session_id, "steer: injected into running turn");
            return "[steered]".to_string();
        }
        self.handle_collect(lane, message, eff, processor).await
    }

    /// Interrupt: cancel the in-flight task, drop the backlog, and start
    /// fresh with only this message.
    async fn handle_interrupt(
        &self,
        lane: Arc<Lane>,
        message: &str,
        processor: Processor,
    ) -> String {
        if let Some(handle) = lane.current_task.lock().expect("lane lock").take() {
            handle.abort();
            info!(session = %lane.session_id, "interrupt: cancelled current task");
        }
        if let Some(hook) = self.on_interrupt.lock().expect("queue lock").clone() {
            hook(&lane.session_id);
        }
        lane.pending.lock().expect("lane lock").clear();
        // Invalidate any outstanding debounce task.
        lane.debounce_gen.fetch_add(1, Ordering::SeqCst);

        let _session = lane
            .session_sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        let _global = lane
            .global_sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        run_tracked(&lane, processor, message.to_string()).await
    }

    // ─── /queue command ───────────────────────────────────────────────────────

    /// `/queue <mode> | debounce:<dur> | cap:<n> | drop:<pol> | reset`.
    /// Empty args shows the current settings.
    pub fn handle_queue_command(&self, session_id: &str, args: &str) -> String {
        let lane = self.lane(session_id);
        let args = args.trim();
        if args.is_empty() {
            return self.status_text(&lane);
        }
        if args == "reset" {
            *lane.options.lock().expect("lane lock") = LaneOptions::default();
            return "✅ Queue settings reset to defaults.".to_string();
        }

        let mut changes = Vec::new();
        let mut options = lane.options.lock().expect("lane lock");
        for token in args.split_whitespace() {
            if let Some(mode) = QueueMode::parse(token) {
                options.mode = Some(mode);
                changes.push(format!("mode={}", mode.as_str()));
                continue;
            }
            if let Some((key, value)) = token.split_once(':') {
                match key.to_ascii_lowercase().as_str() {
                    "debounce" => {
                        if let Some(ms) = parse_duration_ms(value) {
                            options.debounce_ms = Some(ms);
                            changes.push(format!("debounce={ms}ms"));
                        }
                    }
                    "cap" => {
                        if let Ok(cap) = value.parse::<usize>() {
                            options.cap = Some(cap);
                            changes.push(format!("cap={cap}"));
                        }
                    }
                    "drop" => {
                        if let Some(policy) = DropPolicy::parse(value) {
                            options.drop = Some(policy);
                            changes.push(format!("drop={}", policy.as_str()));
                        }
                    }
                    _ => {}
                }
            }
        }
        if changes.is_empty() {
            return format!(
                "❌ Unknown queue command: `{args}`\n\
                 Usage: /queue [collect|steer|followup|steer-backlog|interrupt] \
                 [debounce:Xs] [cap:N] [drop:old|new|summarize] [reset]"
            );
        }
        format!("✅ Queue updated: {}", changes.join(", "))
    }

    fn status_text(&self, lane: &Lane) -> String {
        let eff = self.effective(lane, None);
        format!(
            "📋 Queue Status\n  mode: {}\n  debounce: {}ms\n  cap: {}\n  drop: {}\n  pending: {}\n  sessions: {}",
            eff.mode.as_str(),
            eff.debounce.as_millis(),
            eff.cap,
            eff.drop.as_str(),
            lane.pending.lock().expect("lane lock").len(),
            self.active_sessions(),
        )
    }

    /// Drop lanes idle for over an hour; runs at most every ten minutes.
    fn cleanup_idle(&self) {
        {
            let mut ts = self.cleanup_ts.lock().expect("queue lock");
            if ts.elapsed() < Duration::from_secs(CLEANUP_EVERY_SECS) {
                return;
            }
            *ts = Instant::now();
        }
        let mut lanes = self.lanes.lock().expect("queue lock");
        let before = lanes.len();
        lanes.retain(|_, lane| {
            lane.busy()
                || lane.last_active.lock().expect("lane lock").elapsed()
                    < Duration::from_secs(LANE_IDLE_SECS)
        });
        let removed = before - lanes.len();
        if removed > 0 {
            info!(removed, "cleaned up idle lanes");
        }
    }
}

/// Run the processor as a tracked task so interrupt mode can abort it.
async fn run_tracked(lane: &Lane, processor: Processor, merged: String) -> String {
    let task = tokio::spawn((processor)(lane.session_id.clone(), merged));
    // The handle stays registered after completion: aborting a finished
    // task is a no-op, and each new run replaces the slot.
    *lane.current_task.lock().expect("lane lock") = Some(task.abort_handle());
    match task.await {
        Ok(r) => r,
        Err(e) if e.is_cancelled() => "[cancelled]".to_string(),
        Err(e) => {
            warn!(session = %lane.session_id, "processor task failed: {e}");
            "❌ Internal error while processing the message".to_string()
        }
    }
}

fn merge_messages(batch: &[QueuedMessage]) -> String {
    if batch.len() == 1 {
        return batch[0].text.clone();
    }
    batch
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Enforce the cap. Returns the summary text when the summarize policy
/// produced one.
pub fn apply_overflow(
    pending: &mut Vec<QueuedMessage>,
    cap: usize,
    policy: DropPolicy,
) -> Option<String> {
    if pending.len() <= cap || cap == 0 {
        return None;
    }
    let overflow = pending.len() - cap;
    match policy {
        DropPolicy::New => {
            pending.truncate(cap);
            None
        }
        DropPolicy::Old => {
            pending.drain(..overflow);
            None
        }
        DropPolicy::Summarize => {
            let dropped: Vec<QueuedMessage> = pending.drain(..overflow).collect();
            let bullets = dropped
                .iter()
                .map(|m| format!("- {}", m.text.chars().take(80).collect::<String>()))
                .collect::<Vec<_>>()
                .join("\n");
            let summary = format!("[{} earlier messages summarized]\n{bullets}", dropped.len());
            pending.insert(
                0,
                QueuedMessage {
                    text: summary.clone(),
                    queued_at: dropped[0].queued_at,
                    image_ref: None,
                },
            );
            Some(summary)
        }
    }
}

fn parse_duration_ms(s: &str) -> Option<u64> {
    let s = s.trim().to_ascii_lowercase();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<f64>().ok().map(|v| v as u64);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<f64>().ok().map(|v| (v * 1000.0) as u64);
    }
    s.parse::<f64>().ok().map(|v| (v * 1000.0) as u64)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(mode: QueueMode, debounce_ms: u64) -> QueueConfig {
        QueueConfig {
            mode,
            debounce_ms,
            ..QueueConfig::default()
        }
    }

    fn counting_processor(counter: Arc<AtomicUsize>, log: Arc<Mutex<Vec<String>>>) -> Processor {
        Arc::new(move |_sid, msg| {
            let counter = Arc::clone(&counter);
            let log = Arc::clone(&log);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                log.lock().unwrap().push(msg.clone());
                format!("reply:{msg}")
            })
        })
    }

    #[tokio::test]
    async fn collect_merges_burst_into_one_call() {
        let q = Arc::new(MessageQueue::new(config(QueueMode::Collect, 100)));
        let calls = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let processor = counting_processor(Arc::clone(&calls), Arc::clone(&log));

        let mut handles = Vec::new();
        for text in ["one", "two", "three"] {
            let q = Arc::clone(&q);
            let p = Arc::clone(&processor);
            handles.push(tokio::spawn(async move {
                q.process("s1", text, p, None).await
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let results: Vec<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one processor call");
        let seen = log.lock().unwrap();
        assert_eq!(seen[0], "one\ntwo\nthree");
        // Every batched caller receives the same result.
        for r in &results {
            assert_eq!(r, "reply:one\ntwo\nthree");
        }
    }

    #[tokio::test]
    async fn collect_single_message_is_unmerged() {
        let q = MessageQueue::new(config(QueueMode::Collect, 20));
        let calls = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = q
            .process("s1", "solo", counting_processor(calls, Arc::clone(&log)), None)
            .await;
        assert_eq!(result, "reply:solo");
    }

    #[tokio::test]
    async fn steer_injects_when_busy() {
        let q = Arc::new(MessageQueue::new(config(QueueMode::Steer, 10)));
        let release = Arc::new(tokio::sync::Notify::new());

        // Long-running first turn that waits until released.
        let gate = Arc::clone(&release);
        let slow: Processor = Arc::new(move |_sid, msg| {
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                gate.notified().await;
                format!("done:{msg}")
            })
        });
        let q2 = Arc::clone(&q);
        let slow2 = Arc::clone(&slow);
        let first = tokio::spawn(async move { q2.process("s1", "first", slow2, None).await });

        // Wait until the lane is actually busy.
        for _ in 0..100 {
            if q.is_busy("s1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(q.is_busy("s1"));

        let steered = q.process("s1", "change course", slow, None).await;
        assert_eq!(steered, "[steered]");
        assert_eq!(q.consume_steer("s1").as_deref(), Some("change course"));
        // The slot is consumed once.
        assert!(q.consume_steer("s1").is_none());

        release.notify_waiters();
        assert_eq!(first.await.unwrap(), "done:first");
    }

    #[tokio::test]
    async fn steer_backlog_also_queues_for_reprocessing() {
        let q = Arc::new(MessageQueue::new(config(QueueMode::SteerBacklog, 10)));
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = Arc::clone(&release);
        let slow: Processor = Arc::new(move |_sid, msg| {
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                gate.notified().await;
                format!("done:{msg}")
            })
        });
        let q2 = Arc::clone(&q);
        let slow2 = Arc::clone(&slow);
        let first = tokio::spawn(async move { q2.process("s1", "first", slow2, None).await });
        for _ in 0..100 {
            if q.is_busy("s1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let steered = q.process("s1", "later too", slow, None).await;
        assert_eq!(steered, "[steered]");
        assert_eq!(q.pending_count("s1"), 1, "backlogged for after the turn");

        release.notify_waiters();
        first.await.unwrap();
    }

    #[tokio::test]
    async fn interrupt_cancels_running_task() {
        let q = Arc::new(MessageQueue::new(config(QueueMode::Interrupt, 10)));
        let finished_first = Arc::new(AtomicUsize::new(0));

        let ff = Arc::clone(&finished_first);
        let slow: Processor = Arc::new(move |_sid, _msg| {
            let ff = Arc::clone(&ff);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                ff.fetch_add(1, Ordering::SeqCst);
                "first done".to_string()
            })
        });

        let q2 = Arc::clone(&q);
        let first = tokio::spawn(async move { q2.process("s1", "first", slow, None).await });
        for _ in 0..200 {
            if q.is_busy("s1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(q.is_busy("s1"));

        let fast: Processor =
            Arc::new(|_sid, msg| Box::pin(async move { format!("fresh:{msg}") }));
        let second = q.process("s1", "second", fast, None).await;

        assert_eq!(second, "fresh:second");
        assert_eq!(first.await.unwrap(), "[cancelled]");
        assert_eq!(finished_first.load(Ordering::SeqCst), 0, "first never completed");
    }

    #[tokio::test]
    async fn interrupt_hook_fires_with_session_id() {
        let q = Arc::new(MessageQueue::new(config(QueueMode::Interrupt, 10)));
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen2 = Arc::clone(&seen);
        q.set_interrupt_hook(Arc::new(move |sid| {
            seen2.lock().unwrap().push(sid.to_string());
        }));
        let fast: Processor = Arc::new(|_s, m| Box::pin(async move { m }));
        q.process("s9", "go", fast, None).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["s9".to_string()]);
    }

    #[tokio::test]
    async fn channel_override_picks_mode() {
        let mut cfg = config(QueueMode::Collect, 10);
        cfg.by_channel.insert("telegram".into(), QueueMode::Interrupt);
        let q = MessageQueue::new(cfg);
        let fast: Processor = Arc::new(|_s, m| Box::pin(async move { format!("r:{m}") }));
        // Interrupt mode processes immediately without debounce merging.
        let out = q.process("s1", "hi", fast, Some("telegram")).await;
        assert_eq!(out, "r:hi");
    }

    // ── Overflow policies ─────────────────────────────────────────────────────

    fn pending_of(n: usize) -> Vec<QueuedMessage> {
        (0..n).map(|i| QueuedMessage::new(format!("m{i}"))).collect()
    }

    #[test]
    fn overflow_old_drops_oldest() {
        let mut p = pending_of(25);
        assert!(apply_overflow(&mut p, 20, DropPolicy::Old).is_none());
        assert_eq!(p.len(), 20);
        assert_eq!(p[0].text, "m5");
    }

    #[test]
    fn overflow_new_rejects_newest() {
        let mut p = pending_of(25);
        apply_overflow(&mut p, 20, DropPolicy::New);
        assert_eq!(p.len(), 20);
        assert_eq!(p[0].text, "m0");
        assert_eq!(p[19].text, "m19");
    }

    #[test]
    fn overflow_summarize_replaces_prefix() {
        let mut p = pending_of(25);
        let summary = apply_overflow(&mut p, 20, DropPolicy::Summarize).unwrap();
        assert!(summary.starts_with("[5 earlier messages summarized]"));
        assert!(summary.contains("- m0"));
        // 20 kept + 1 synthetic summary at the front.
        assert_eq!(p.len(), 21);
        assert!(p[0].text.starts_with("[5 earlier"));
        assert_eq!(p[1].text, "m5");
    }

    #[test]
    fn overflow_below_cap_is_noop() {
        let mut p = pending_of(3);
        assert!(apply_overflow(&mut p, 20, DropPolicy::Summarize).is_none());
        assert_eq!(p.len(), 3);
    }

    // ── /queue command ────────────────────────────────────────────────────────

    #[test]
    fn queue_command_sets_mode_and_options() {
        let q = MessageQueue::new(QueueConfig::default());
        let out = q.handle_queue_command("s1", "steer debounce:2s cap:25 drop:old");
        assert!(out.contains("mode=steer"));
        assert!(out.contains("debounce=2000ms"));
        assert!(out.contains("cap=25"));
        assert!(out.contains("drop=old"));
    }

    #[test]
    fn queue_command_reset_restores_defaults() {
        let q = MessageQueue::new(QueueConfig::default());
        q.handle_queue_command("s1", "interrupt cap:5");
        let out = q.handle_queue_command("s1", "reset");
        assert!(out.contains("reset"));
        let status = q.handle_queue_command("s1", "");
        assert!(status.contains("mode: collect"));
        assert!(status.contains("cap: 20"));
    }

    #[test]
    fn queue_command_unknown_is_rejected() {
        let q = MessageQueue::new(QueueConfig::default());
        let out = q.handle_queue_command("s1", "warp-speed");
        assert!(out.starts_with("❌"));
    }

    #[test]
    fn duration_parsing_variants() {
        assert_eq!(parse_duration_ms("500ms"), Some(500));
        assert_eq!(parse_duration_ms("2s"), Some(2000));
        assert_eq!(parse_duration_ms("1.5s"), Some(1500));
        assert_eq!(parse_duration_ms("3"), Some(3000));
        assert_eq!(parse_duration_ms("abc"), None);
    }
}
