//! Per-key admission telemetry.
//!
//! The collector keeps request and denial counts plus a bounded window of
//! recent latencies for every key. Entries are reset in place once they go
//! stale, so the numbers describe the recent past rather than the process
//! lifetime.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Latency samples kept per key.
pub const LATENCY_WINDOW: usize = 100;

pub const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Snapshot of one key's statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryStats {
    pub total_requests: u64,
    pub limited_requests: u64,
    pub limit_rate: f64,
    pub avg_response_time_ms: f64,
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
    /// Unix seconds of the last record or reset.
    pub last_update: u64,
}

#[derive(Debug)]
struct KeyTelemetry {
    total_requests: u64,
    limited_requests: u64,
    latencies: VecDeque<Duration>,
    last_update: Instant,
    last_update_unix: u64,
}

impl KeyTelemetry {
    fn new(now: Instant) -> Self {
        Self {
            total_requests: 0,
            limited_requests: 0,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            last_update: now,
            last_update_unix: unix_now(),
        }
    }

    fn limit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.limited_requests as f64 / self.total_requests as f64
        }
    }

    fn avg_response_time_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let total: Duration = self.latencies.iter().sum();
        total.as_nanos() as f64 / self.latencies.len() as f64 / 1_000_000.0
    }

    fn reset(&mut self, now: Instant) {
        self.total_requests = 0;
        self.limited_requests = 0;
        self.latencies.clear();
        self.last_update = now;
        self.last_update_unix = unix_now();
    }

    fn snapshot(&self, time_window: Duration) -> TelemetryStats {
        TelemetryStats {
            total_requests: self.total_requests,
            limited_requests: self.limited_requests,
            limit_rate: self.limit_rate(),
            avg_response_time_ms: self.avg_response_time_ms(),
            time_window,
            last_update: self.last_update_unix,
        }
    }
}

/// Totals across every key of a collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySummary {
    pub total_requests: u64,
    pub total_limited: u64,
    pub overall_limit_rate: f64,
    /// Mean of the per-key averages, ignoring keys without latency data.
    pub avg_response_time_ms: f64,
    pub active_keys: usize,
    /// Sum of the non-zero per-key averages and how many keys contributed,
    /// so summaries of several collectors can be combined exactly.
    #[serde(skip)]
    pub latency_sum_ms: f64,
    #[serde(skip)]
    pub latency_keys: usize,
}

impl TelemetrySummary {
    /// Fold `other` into `self`, recomputing the derived rates.
    pub fn merge(&mut self, other: &TelemetrySummary) {
        self.total_requests += other.total_requests;
        self.total_limited += other.total_limited;
        self.active_keys += other.active_keys;
        self.latency_sum_ms += other.latency_sum_ms;
        self.latency_keys += other.latency_keys;
        self.finish();
    }

    fn finish(&mut self) {
        self.overall_limit_rate = if self.total_requests > 0 {
            self.total_limited as f64 / self.total_requests as f64
        } else {
            0.0
        };
        self.avg_response_time_ms = if self.latency_keys > 0 {
            self.latency_sum_ms / self.latency_keys as f64
        } else {
            0.0
        };
    }
}

#[derive(Debug)]
pub struct TelemetryCollector {
    keys: RwLock<HashMap<String, KeyTelemetry>>,
    time_window: Duration,
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_WINDOW)
    }
}

impl TelemetryCollector {
    pub fn new(time_window: Duration) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            time_window,
        }
    }

    pub fn time_window(&self) -> Duration {
        self.time_window
    }

    pub fn record(&self, key: &str, limited: bool, latency: Duration) {
        self.record_at(key, limited, latency, Instant::now());
    }

    pub fn record_at(&self, key: &str, limited: bool, latency: Duration, now: Instant) {
        let mut keys = self.keys.write();
        let entry = keys
            .entry(key.to_string())
            .or_insert_with(|| KeyTelemetry::new(now));

        entry.total_requests += 1;
        if limited {
            entry.limited_requests += 1;
        }

        entry.latencies.push_back(latency);
        while entry.latencies.len() > LATENCY_WINDOW {
            entry.latencies.pop_front();
        }

        entry.last_update = now;
        entry.last_update_unix = unix_now();
    }

    /// Copy of the statistics for `key`, if it has ever been recorded.
    pub fn stats(&self, key: &str) -> Option<TelemetryStats> {
        let keys = self.keys.read();
        keys.get(key).map(|entry| entry.snapshot(self.time_window))
    }

    pub fn all_stats(&self) -> BTreeMap<String, TelemetryStats> {
        let keys = self.keys.read();
        keys.iter()
            .map(|(key, entry)| (key.clone(), entry.snapshot(self.time_window)))
            .collect()
    }

    /// Keys ordered by descending limited count, ties broken by key.
    pub fn top_limited(&self, n: usize) -> Vec<String> {
        self.top_limited_with_counts(n)
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    pub fn top_limited_with_counts(&self, n: usize) -> Vec<(String, u64)> {
        let keys = self.keys.read();
        let mut ranked: Vec<(String, u64)> = keys
            .iter()
            .map(|(key, entry)| (key.clone(), entry.limited_requests))
            .collect();
        drop(keys);

        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    pub fn summary(&self) -> TelemetrySummary {
        let keys = self.keys.read();
        let mut summary = TelemetrySummary {
            active_keys: keys.len(),
            ..TelemetrySummary::default()
        };

        for entry in keys.values() {
            summary.total_requests += entry.total_requests;
            summary.total_limited += entry.limited_requests;
            let avg = entry.avg_response_time_ms();
            if avg > 0.0 {
                summary.latency_sum_ms += avg;
                summary.latency_keys += 1;
            }
        }

        summary.finish();
        summary
    }

    /// Reset every entry not updated within the time window.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut keys = self.keys.write();
        let mut reset = 0;
        for entry in keys.values_mut() {
            if now.saturating_duration_since(entry.last_update) > self.time_window {
                entry.reset(now);
                reset += 1;
            }
        }

        if reset > 0 {
            debug!(reset, total = keys.len(), "reset stale telemetry");
        }
        reset
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
