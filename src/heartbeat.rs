//! Heartbeat accumulator.
//!
//! Sums per-cycle counters over a rolling window and emits one compact
//! summary when the window elapses, then resets.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub scanned: usize,
    pub alerted: usize,
    pub deferred: usize,
    pub errors: usize,
    pub by_reason: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub cycles: u64,
    pub scanned: u64,
    pub alerted: u64,
    pub deferred: u64,
    pub errors: u64,
    pub by_reason: BTreeMap<String, u64>,
}

impl HeartbeatSummary {
    pub fn to_text(&self) -> String {
        let top_reasons = self
            .by_reason
            .iter()
            .map(|(reason, count)| format!("{reason}:{count}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "heartbeat: {} cycles, {} scanned, {} alerted, {} deferred, {} errors [{}]",
            self.cycles, self.scanned, self.alerted, self.deferred, self.errors, top_reasons
        )
    }
}

pub struct HeartbeatAccumulator {
    window_start: DateTime<Utc>,
    cycles: u64,
    scanned: u64,
    alerted: u64,
    deferred: u64,
    errors: u64,
    by_reason: BTreeMap<String, u64>,
}

impl HeartbeatAccumulator {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            cycles: 0,
            scanned: 0,
            alerted: 0,
            deferred: 0,
            errors: 0,
            by_reason: BTreeMap::new(),
        }
    }

    pub fn add_cycle(&mut self, stats: &CycleStats) {
        self.cycles += 1;
        self.scanned += stats.scanned as u64;
        self.alerted += stats.alerted as u64;
        self.deferred += stats.deferred as u64;
        self.errors += stats.errors as u64;
        for (reason, count) in &stats.by_reason {
            *self.by_reason.entry(reason.clone()).or_insert(0) += count;
        }
    }

    /// Emit and reset once the window has elapsed.
    pub fn maybe_emit(&mut self, now: DateTime<Utc>, interval_min: u32) -> Option<HeartbeatSummary> {
        let elapsed = now - self.window_start;
        if elapsed < chrono::Duration::minutes(i64::from(interval_min)) {
            return None;
        }
        let summary = HeartbeatSummary {
            window_start: self.window_start,
            window_end: now,
            cycles: self.cycles,
            scanned: self.scanned,
            alerted: self.alerted,
            deferred: self.deferred,
            errors: self.errors,
            by_reason: std::mem::take(&mut self.by_reason),
        };
        self.window_start = now;
        self.cycles = 0;
        self.scanned = 0;
        self.alerted = 0;
        self.deferred = 0;
        self.errors = 0;
        info!(
            cycles = summary.cycles,
            scanned = summary.scanned,
            alerted = summary.alerted,
            errors = summary.errors,
            "Heartbeat window closed"
        );
        Some(summary)
    }
}
