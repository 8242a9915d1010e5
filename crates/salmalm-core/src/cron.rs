// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Scheduled prompts ("LLM cron"): named jobs with an interval or
//! time-of-day schedule, persisted as JSON under the home directory and
//! executed through the normal agent pipeline on `cron-*` sessions.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::queue::{MessageQueue, Processor};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    /// Every N minutes.
    Every { minutes: u64 },
    /// Once a day at "HH:MM" (UTC).
    At { time: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

impl CronJob {
    fn due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.schedule {
            Schedule::Every { minutes } => match self.last_run {
                None => true,
                Some(last) => now - last >= chrono::Duration::minutes(*minutes as i64),
            },
            Schedule::At { time } => {
                let Some((h, m)) = parse_hhmm(time) else {
                    return false;
                };
                let already_today = self
                    .last_run
                    .map(|last| last.date_naive() == now.date_naive())
                    .unwrap_or(false);
                !already_today && (now.hour(), now.minute()) >= (h, m)
            }
        }
    }
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
}

pub struct CronService {
    jobs: Mutex<Vec<CronJob>>,
    path: PathBuf,
}

impl CronService {
    pub fn load(path: PathBuf) -> Self {
        let jobs = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self { jobs: Mutex::new(jobs), path }
    }

    fn save(&self, jobs: &[CronJob]) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(jobs) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    warn!("cron save failed: {e}");
                }
            }
            Err(e) => warn!("cron serialize failed: {e}"),
        }
    }

    pub fn list(&self) -> Vec<CronJob> {
        self.jobs.lock().expect("cron lock").clone()
    }

    pub fn add(
        &self,
        name: &str,
        schedule: Schedule,
        prompt: &str,
        model: Option<String>,
    ) -> CronJob {
        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            name: name.to_string(),
            schedule,
            prompt: prompt.to_string(),
            model,
            enabled: true,
            run_count: 0,
            last_run: None,
        };
        let mut jobs = self.jobs.lock().expect("cron lock");
        jobs.push(job.clone());
        self.save(&jobs);
        info!(job = %job.id, name = %job.name, "cron job added");
        job
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().expect("cron lock");
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() != before;
        if removed {
            self.save(&jobs);
        }
        removed
    }

    /// Toggle enablement; returns the new state, or `None` for unknown ids.
    pub fn toggle(&self, id: &str) -> Option<bool> {
        let mut jobs = self.jobs.lock().expect("cron lock");
        let job = jobs.iter_mut().find(|j| j.id == id)?;
        job.enabled = !job.enabled;
        let enabled = job.enabled;
        self.save(&jobs);
        Some(enabled)
    }

    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().expect("cron lock").iter().find(|j| j.id == id).cloned()
    }

    fn mark_ran(&self, id: &str) {
        let mut jobs = self.jobs.lock().expect("cron lock");
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.run_count += 1;
            job.last_run = Some(Utc::now());
        }
        self.save(&jobs);
    }

    /// Run one job immediately through the queue; used by `POST /cron/run`
    /// and the scheduler tick.
    pub async fn run_job(&self, id: &str, queue: &MessageQueue, processor: Processor) -> String {
        let Some(job) = self.get(id) else {
            return format!("❌ Unknown cron job: {id}");
        };
        self.mark_ran(id);
        let session_id = format!("cron-{id}");
        info!(job = id, name = %job.name, "running cron job");
        queue
            .process(&session_id, &job.prompt, processor, Some("cron"))
            .await
    }

    /// Scheduler loop: ticks twice a minute, running every due job. Spawn
    /// once at startup; runs until the process exits.
    pub async fn run_loop(
        self: Arc<Self>,
        queue: Arc<MessageQueue>,
        make_processor: impl Fn() -> Processor + Send + Sync + 'static,
    ) {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let now = Utc::now();
            let due: Vec<String> = self
                .jobs
                .lock()
                .expect("cron lock")
                .iter()
                .filter(|j| j.due(now))
                .map(|j| j.id.clone())
                .collect();
            for id in due {
                let result = self.run_job(&id, &queue, make_processor()).await;
                if result.starts_with('❌') {
                    warn!(job = %id, "cron run failed: {result}");
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, CronService) {
        let dir = tempfile::tempdir().unwrap();
        let svc = CronService::load(dir.path().join("cron.json"));
        (dir, svc)
    }

    #[test]
    fn add_list_remove_round_trip() {
        let (_d, svc) = service();
        let job = svc.add("morning brief", Schedule::At { time: "08:30".into() }, "summarize news", None);
        assert_eq!(svc.list().len(), 1);
        assert!(svc.remove(&job.id));
        assert!(svc.list().is_empty());
        assert!(!svc.remove("nope"));
    }

    #[test]
    fn jobs_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.json");
        {
            let svc = CronService::load(path.clone());
            svc.add("j", Schedule::Every { minutes: 5 }, "ping", Some("m".into()));
        }
        let svc = CronService::load(path);
        let jobs = svc.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "j");
        assert_eq!(jobs[0].schedule, Schedule::Every { minutes: 5 });
    }

    #[test]
    fn toggle_flips_enabled() {
        let (_d, svc) = service();
        let job = svc.add("t", Schedule::Every { minutes: 1 }, "x", None);
        assert_eq!(svc.toggle(&job.id), Some(false));
        assert_eq!(svc.toggle(&job.id), Some(true));
        assert_eq!(svc.toggle("missing"), None);
    }

    #[test]
    fn every_schedule_due_after_interval() {
        let mut job = CronJob {
            id: "x".into(),
            name: "n".into(),
            schedule: Schedule::Every { minutes: 10 },
            prompt: "p".into(),
            model: None,
            enabled: true,
            run_count: 0,
            last_run: None,
        };
        let now = Utc::now();
        assert!(job.due(now), "never-run jobs are due");
        job.last_run = Some(now - chrono::Duration::minutes(5));
        assert!(!job.due(now));
        job.last_run = Some(now - chrono::Duration::minutes(11));
        assert!(job.due(now));
        job.enabled = false;
        assert!(!job.due(now));
    }

    #[test]
    fn at_schedule_runs_once_per_day() {
        let now = Utc::now();
        let earlier = format!("{:02}:{:02}", now.hour(), now.minute());
        let mut job = CronJob {
            id: "x".into(),
            name: "n".into(),
            schedule: Schedule::At { time: earlier },
            prompt: "p".into(),
            model: None,
            enabled: true,
            run_count: 0,
            last_run: None,
        };
        assert!(job.due(now));
        job.last_run = Some(now);
        assert!(!job.due(now), "already ran today");
    }

    #[test]
    fn bad_time_string_is_never_due() {
        assert_eq!(parse_hhmm("25:00"), None);
        assert_eq!(parse_hhmm("aa:bb"), None);
        assert_eq!(parse_hhmm("0830"), None);
        assert_eq!(parse_hhmm("08:30"), Some((8, 30)));
    }
}
