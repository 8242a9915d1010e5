// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-model token accounting with a process-wide running total and a hard
//! USD cost cap. Totals use atomics (cost in micro-USD) so readers never
//! take a lock; the append-only record list backs the daily/monthly rollups.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::catalog;

#[derive(Debug, thiserror::Error)]
#[error("Cost cap exceeded: ${spent:.4} spent of ${cap:.2} cap. Raise the cap to continue.")]
pub struct CostCapExceeded {
    pub spent: f64,
    pub cap: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub intent: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
    pub calls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodUsage {
    /// "2026-08-01" for daily rollups, "2026-08" for monthly.
    pub period: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub calls: u64,
}

pub struct UsageMeter {
    records: Mutex<Vec<UsageRecord>>,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cost_micros: AtomicU64,
    calls: AtomicU64,
    /// Hard ceiling in micro-USD; 0 disables the cap.
    cap_micros: AtomicU64,
}

impl UsageMeter {
    pub fn new(cost_cap_usd: f64) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            cost_micros: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            cap_micros: AtomicU64::new(to_micros(cost_cap_usd)),
        }
    }

    /// Append a record for a successful provider call; cost comes from the
    /// rate catalog.
    pub fn record(
        &self,
        session_id: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        intent: &str,
    ) {
        let cost_usd = catalog::cost_usd(model, input_tokens, output_tokens);
        self.input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(output_tokens, Ordering::Relaxed);
        self.cost_micros.fetch_add(to_micros(cost_usd), Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.records.lock().expect("usage lock").push(UsageRecord {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
            intent: intent.to_string(),
        });
    }

    /// Fails once the running total reaches the cap. Callers must check
    /// before every provider call, fallbacks included.
    pub fn check_cost_cap(&self) -> Result<(), CostCapExceeded> {
        let cap = self.cap_micros.load(Ordering::Relaxed);
        if cap == 0 {
            return Ok(());
        }
        let spent = self.cost_micros.load(Ordering::Relaxed);
        if spent >= cap {
            return Err(CostCapExceeded {
                spent: from_micros(spent),
                cap: from_micros(cap),
            });
        }
        Ok(())
    }

    /// Operator override; takes effect on the next check.
    pub fn set_cost_cap(&self, cap_usd: f64) {
        self.cap_micros.store(to_micros(cap_usd), Ordering::Relaxed);
    }

    pub fn totals(&self) -> UsageTotals {
        UsageTotals {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            total_cost_usd: from_micros(self.cost_micros.load(Ordering::Relaxed)),
            calls: self.calls.load(Ordering::Relaxed),
        }
    }

    pub fn daily_report(&self, days: i64) -> Vec<PeriodUsage> {
        self.rollup(Duration::days(days), 10)
    }

    pub fn monthly_report(&self, months: i64) -> Vec<PeriodUsage> {
        self.rollup(Duration::days(months * 30), 7)
    }

    /// Total cost per model over the whole process lifetime.
    pub fn model_breakdown(&self) -> Vec<(String, f64)> {
        let records = self.records.lock().expect("usage lock");
        let mut by_model: std::collections::BTreeMap<String, f64> = Default::default();
        for r in records.iter() {
            *by_model.entry(r.model.clone()).or_default() += r.cost_usd;
        }
        by_model.into_iter().collect()
    }

    fn rollup(&self, window: Duration, period_len: usize) -> Vec<PeriodUsage> {
        let cutoff = Utc::now() - window;
        let records = self.records.lock().expect("usage lock");
        let mut grouped: std::collections::BTreeMap<(String, String), PeriodUsage> =
            Default::default();
        for r in records.iter().filter(|r| r.timestamp >= cutoff) {
            let period: String = r
                .timestamp
                .format("%Y-%m-%d")
                .to_string()
                .chars()
                .take(period_len)
                .collect();
            let entry = grouped
                .entry((period.clone(), r.model.clone()))
                .or_insert_with(|| PeriodUsage {
                    period,
                    model: r.model.clone(),
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                    calls: 0,
                });
            entry.input_tokens += r.input_tokens;
            entry.output_tokens += r.output_tokens;
            entry.cost_usd += r.cost_usd;
            entry.calls += 1;
        }
        let mut out: Vec<PeriodUsage> = grouped.into_values().collect();
        out.sort_by(|a, b| b.period.cmp(&a.period).then(a.model.cmp(&b.model)));
        out
    }
}

fn to_micros(usd: f64) -> u64 {
    (usd * 1_000_000.0).round().max(0.0) as u64
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_updates_totals() {
        let meter = UsageMeter::new(0.0);
        meter.record("s1", "claude-sonnet-4-5", 1000, 500, "chat");
        let t = meter.totals();
        assert_eq!(t.input_tokens, 1000);
        assert_eq!(t.output_tokens, 500);
        assert_eq!(t.calls, 1);
        assert!(t.total_cost_usd > 0.0);
    }

    #[test]
    fn zero_cap_never_trips() {
        let meter = UsageMeter::new(0.0);
        meter.record("s", "claude-opus-4-1", 10_000_000, 10_000_000, "chat");
        assert!(meter.check_cost_cap().is_ok());
    }

    #[test]
    fn call_below_cap_passes_call_at_cap_fails() {
        // Cap boundary semantics: the n-th call that sits exactly at the cap
        // succeeds; the (n+1)-th that would cross it is refused.
        let meter = UsageMeter::new(0.015);
        // 1M input tokens of sonnet = exactly $3/1M * 1M... use haiku output:
        // 1000 output tokens of sonnet = $0.015 exactly.
        meter.record("s", "claude-sonnet-4-5", 0, 999, "chat");
        assert!(meter.check_cost_cap().is_ok(), "below cap must pass");
        meter.record("s", "claude-sonnet-4-5", 0, 1, "chat");
        // Spent == cap now: the next call is refused.
        assert!(meter.check_cost_cap().is_err(), "at cap must refuse");
    }

    #[test]
    fn raising_cap_unblocks() {
        let meter = UsageMeter::new(0.001);
        meter.record("s", "claude-opus-4-1", 100_000, 0, "chat");
        assert!(meter.check_cost_cap().is_err());
        meter.set_cost_cap(100.0);
        assert!(meter.check_cost_cap().is_ok());
    }

    #[test]
    fn daily_report_groups_by_model() {
        let meter = UsageMeter::new(0.0);
        meter.record("s1", "claude-sonnet-4-5", 100, 10, "chat");
        meter.record("s2", "claude-sonnet-4-5", 200, 20, "code");
        meter.record("s1", "gpt-4o", 50, 5, "chat");
        let report = meter.daily_report(7);
        assert_eq!(report.len(), 2);
        let sonnet = report.iter().find(|r| r.model.contains("sonnet")).unwrap();
        assert_eq!(sonnet.calls, 2);
        assert_eq!(sonnet.input_tokens, 300);
    }

    #[test]
    fn monthly_period_is_seven_chars() {
        let meter = UsageMeter::new(0.0);
        meter.record("s", "gpt-4o", 1, 1, "chat");
        let report = meter.monthly_report(1);
        assert_eq!(report[0].period.len(), 7); // "YYYY-MM"
    }

    #[test]
    fn model_breakdown_sums_cost() {
        let meter = UsageMeter::new(0.0);
        meter.record("s", "gpt-4o", 1_000_000, 0, "chat");
        meter.record("s", "gpt-4o", 1_000_000, 0, "chat");
        let breakdown = meter.model_breakdown();
        assert_eq!(breakdown.len(), 1);
        assert!((breakdown[0].1 - 5.0).abs() < 1e-9);
    }

    #[test]
    fn error_message_is_user_readable() {
        let e = CostCapExceeded { spent: 10.5, cap: 10.0 };
        let msg = e.to_string();
        assert!(msg.contains("$10.5"));
        assert!(msg.contains("$10.00"));
    }
}
