//! Per-worker accounting and cross-worker aggregation
//!
//! An [`Account`] belongs to exactly one transfer worker and produces the
//! periodic reports; an [`Aggregate`] collects the lifetime totals of every
//! worker playing one role (reader or writer) during a client or server run.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Megabits per second for `bytes` moved in `elapsed`.
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 * 8.0) / secs / 1_000_000.0
    } else {
        0.0
    }
}

/// Read or write calls per second.
pub fn calls_per_sec(calls: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { calls as f64 / secs } else { 0.0 }
}

/// Byte and call deltas over a time span, with the derived rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rate {
    pub bytes: u64,
    pub calls: u64,
    pub elapsed: Duration,
    pub mbps: f64,
    pub cps: f64,
}

impl Rate {
    pub fn over(bytes: u64, calls: u64, elapsed: Duration) -> Self {
        Self {
            bytes,
            calls,
            elapsed,
            mbps: mbps(bytes, elapsed),
            cps: calls_per_sec(calls, elapsed),
        }
    }
}

/// Running counters of one worker.
#[derive(Debug, Clone)]
pub struct Account {
    pub bytes: u64,
    pub calls: u64,
    prev_time: Instant,
    prev_bytes: u64,
    prev_calls: u64,
}

impl Account {
    pub fn new(start: Instant) -> Self {
        Self {
            bytes: 0,
            calls: 0,
            prev_time: start,
            prev_bytes: 0,
            prev_calls: 0,
        }
    }

    /// Count one completed call that moved `bytes`.
    pub fn record(&mut self, bytes: usize) {
        self.calls += 1;
        self.bytes += bytes as u64;
    }

    /// Throughput since the previous report tick.
    pub fn instant_mbps(&self, now: Instant) -> f64 {
        mbps(
            self.bytes - self.prev_bytes,
            now.saturating_duration_since(self.prev_time),
        )
    }

    /// Close the current report period if `interval` has elapsed since the
    /// previous tick (or unconditionally when `force` is set).
    pub fn tick(&mut self, now: Instant, interval: Duration, force: bool) -> Option<Rate> {
        let elapsed = now.saturating_duration_since(self.prev_time);
        if elapsed <= interval && !force {
            return None;
        }

        let rate = Rate::over(
            self.bytes - self.prev_bytes,
            self.calls - self.prev_calls,
            elapsed,
        );
        self.prev_time = now;
        self.prev_bytes = self.bytes;
        self.prev_calls = self.calls;
        Some(rate)
    }

    /// Record a call and tick in one step.
    pub fn update(&mut self, bytes: usize, now: Instant, interval: Duration) -> Option<Rate> {
        self.record(bytes);
        self.tick(now, interval, false)
    }

    /// Lifetime rate from `start` until `now`.
    pub fn average(&self, start: Instant, now: Instant) -> Rate {
        Rate::over(self.bytes, self.calls, now.saturating_duration_since(start))
    }
}

/// One point of a rate chart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub timestamp: DateTime<Utc>,
    pub mbps: f64,
}

/// Instantaneous rates sampled at report ticks, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateSeries {
    samples: Vec<RateSample>,
}

impl RateSeries {
    pub fn push(&mut self, timestamp: DateTime<Utc>, mbps: f64) {
        self.samples.push(RateSample { timestamp, mbps });
    }

    pub fn samples(&self) -> &[RateSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Rate charts of one client session, inbound then outbound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub input: RateSeries,
    pub output: RateSeries,
}

/// Snapshot of an [`Aggregate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AggregateTotals {
    pub mbps: f64,
    pub cps: f64,
    pub bytes: u64,
    pub workers: u32,
}

/// Lifetime totals shared by all workers of one role.
///
/// Workers add to it once, when they exit; orchestrators read it after
/// every worker has been joined.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    totals: Arc<Mutex<AggregateTotals>>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, average: &Rate) {
        let mut totals = self.totals.lock();
        totals.mbps += average.mbps;
        totals.cps += average.cps;
        totals.bytes += average.bytes;
        totals.workers += 1;
    }

    pub fn snapshot(&self) -> AggregateTotals {
        *self.totals.lock()
    }
}

/// The reader and writer aggregates of one process run.
#[derive(Debug, Clone, Default)]
pub struct Aggregates {
    pub reader: Aggregate,
    pub writer: Aggregate,
}

impl Aggregates {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn mbps_to_human(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}
