//! Process-wide call statistics.
//!
//! Updated once when a call starts and once when it ends, never per frame.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Costs are accumulated in millionths of a currency unit so they fit an atomic.
const COST_SCALE: f64 = 1_000_000.0;

/// One finished call, as reported in `callsOverTime`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub cost: f64,
    pub turns: usize,
}

/// Immutable view of the counters at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub active_calls: u64,
    pub total_calls: u64,
    pub total_duration_secs: f64,
    pub total_cost: f64,
    pub calls_over_time: Vec<CallRecord>,
}

#[derive(Debug)]
pub struct StatsAggregator {
    active: AtomicU64,
    total: AtomicU64,
    duration_ms: AtomicU64,
    cost_micros: AtomicU64,
    history: Mutex<VecDeque<CallRecord>>,
    cost_per_minute: f64,
    history_limit: usize,
}

impl StatsAggregator {
    pub fn new(cost_per_minute: f64, history_limit: usize) -> Self {
        Self {
            active: AtomicU64::new(0),
            total: AtomicU64::new(0),
            duration_ms: AtomicU64::new(0),
            cost_micros: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
            cost_per_minute: cost_per_minute.max(0.0),
            history_limit,
        }
    }

    pub fn call_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished call and returns its history record.
    pub fn call_ended(&self, call_id: &str, duration: Duration, turns: usize) -> CallRecord {
        // Never underflow if an end is reported without a matching start.
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        let cost = duration.as_secs_f64() / 60.0 * self.cost_per_minute;
        self.duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.cost_micros
            .fetch_add((cost * COST_SCALE).round() as u64, Ordering::Relaxed);

        let record = CallRecord {
            call_id: call_id.to_string(),
            ended_at: Utc::now(),
            duration_secs: duration.as_secs_f64(),
            cost,
            turns,
        };
        if self.history_limit > 0 {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= self.history_limit {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        record
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let calls_over_time = self
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        StatsSnapshot {
            active_calls: self.active.load(Ordering::Relaxed),
            total_calls: self.total.load(Ordering::Relaxed),
            total_duration_secs: self.duration_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            total_cost: self.cost_micros.load(Ordering::Relaxed) as f64 / COST_SCALE,
            calls_over_time,
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(0.0, 100)
    }
}
