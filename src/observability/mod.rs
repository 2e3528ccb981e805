//! Observability: per-operation call metrics
//!
//! What this module provides
//! - `MetricsCollector`: call counts, success/error split, latency aggregates,
//!   cache hit/miss and API-call counters
//! - `MetricsSnapshot`: serializable point-in-time view for a status endpoint
//! - `TimedScope` plus `timed`/`timed_async` helpers (see [`timing`])
//! - `MetricsLayer<S>`: the same timing as tower middleware (see [`layer`])
//!
//! Implementation strategy
//! - One `std::sync::Mutex` guards all counters so a snapshot or reset is
//!   never torn; it is never held across I/O or an `.await`
//! - Latency history is a bounded FIFO window per operation; percentiles are
//!   nearest-rank over what the window still holds, so they approximate the
//!   most recent samples rather than all-time values
//! - Every recording call is total: a disabled collector ignores input and a
//!   poisoned lock is recovered, so instrumentation can never fail a request
//!
//! Testing strategy
//! - Unit tests drive the collector directly; `tests/metrics_props.rs` checks
//!   the aggregation invariants with proptest

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::MetricsConfig;

pub mod layer;
pub mod timing;

pub use layer::{Metrics, MetricsLayer};
pub use timing::TimedScope;

/// Fixed-capacity FIFO of recent latencies; the oldest sample is dropped first.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, latency: Duration) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Duration> {
        self.samples.iter()
    }

    /// Nearest-rank percentile, `pct` in `1..=100`.
    pub fn percentile(&self, pct: u32) -> Option<Duration> {
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        nearest_rank(&sorted, pct)
    }
}

fn nearest_rank(sorted: &[Duration], pct: u32) -> Option<Duration> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let pct = pct.clamp(1, 100) as usize;
    let rank = (n * pct + 99) / 100;
    sorted.get(rank.clamp(1, n) - 1).copied()
}

#[derive(Debug, Clone)]
struct ToolMetrics {
    calls: u64,
    successes: u64,
    errors: u64,
    total: Duration,
    min: Duration,
    max: Duration,
    history: LatencyWindow,
}

impl ToolMetrics {
    fn new(capacity: usize) -> Self {
        Self {
            calls: 0,
            successes: 0,
            errors: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            history: LatencyWindow::new(capacity),
        }
    }

    fn record(&mut self, latency: Duration, success: bool) {
        self.calls += 1;
        if success {
            self.successes += 1;
        } else {
            self.errors += 1;
        }
        self.total = self.total.saturating_add(latency);
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);
        self.history.push(latency);
    }

    fn snapshot(&self) -> ToolSnapshot {
        let mut sorted: Vec<Duration> = self.history.iter().copied().collect();
        sorted.sort_unstable();
        let (avg_ms, min_ms) = if self.calls == 0 {
            (0.0, 0.0)
        } else {
            (millis(self.total) / self.calls as f64, millis(self.min))
        };
        ToolSnapshot {
            calls: self.calls,
            successes: self.successes,
            errors: self.errors,
            success_rate: ratio(self.successes, self.calls),
            latency: LatencySummary {
                avg_ms,
                min_ms,
                max_ms: millis(self.max),
                p95_ms: nearest_rank(&sorted, 95).map(millis).unwrap_or(0.0),
                p99_ms: nearest_rank(&sorted, 99).map(millis).unwrap_or(0.0),
                samples: sorted.len(),
            },
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[derive(Debug)]
struct State {
    started: Instant,
    tools: HashMap<String, ToolMetrics>,
    cache_hits: u64,
    cache_misses: u64,
    api_calls: u64,
}

impl State {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            tools: HashMap::new(),
            cache_hits: 0,
            cache_misses: 0,
            api_calls: 0,
        }
    }
}

/// Thread-safe metrics sink shared by every request path.
#[derive(Debug)]
pub struct MetricsCollector {
    enabled: bool,
    history_capacity: usize,
    state: Mutex<State>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_config(&MetricsConfig::default())
    }
}

impl MetricsCollector {
    pub fn with_config(config: &MetricsConfig) -> Self {
        Self {
            enabled: config.enabled,
            history_capacity: config.max_latency_samples,
            state: Mutex::new(State::new()),
        }
    }

    /// Enabled unless `MDGATE_METRICS_ENABLED` says otherwise; read once here.
    pub fn from_env() -> Self {
        Self::with_config(&MetricsConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_call(&self, operation: &str, latency: Duration, success: bool) {
        if !self.enabled {
            return;
        }
        let capacity = self.history_capacity;
        let mut state = self.lock();
        match state.tools.get_mut(operation) {
            Some(tool) => tool.record(latency, success),
            None => {
                let mut tool = ToolMetrics::new(capacity);
                tool.record(latency, success);
                state.tools.insert(operation.to_string(), tool);
            }
        }
    }

    pub fn record_cache_hit(&self) {
        if self.enabled {
            self.lock().cache_hits += 1;
        }
    }

    pub fn record_cache_miss(&self) {
        if self.enabled {
            self.lock().cache_misses += 1;
        }
    }

    /// Counts one logical remote call, however many attempts it took.
    pub fn record_api_call(&self) {
        if self.enabled {
            self.lock().api_calls += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        MetricsSnapshot {
            enabled: self.enabled,
            uptime_seconds: state.started.elapsed().as_secs_f64(),
            total_api_calls: state.api_calls,
            cache: CacheSnapshot {
                hits: state.cache_hits,
                misses: state.cache_misses,
                hit_rate: ratio(state.cache_hits, state.cache_hits + state.cache_misses),
            },
            tools: state
                .tools
                .iter()
                .map(|(name, tool)| (name.clone(), tool.snapshot()))
                .collect(),
        }
    }

    /// Clears every counter and restarts the uptime clock.
    pub fn reset(&self) {
        *self.lock() = State::new();
        debug!("metrics reset");
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub enabled: bool,
    pub uptime_seconds: f64,
    pub total_api_calls: u64,
    pub cache: CacheSnapshot,
    pub tools: BTreeMap<String, ToolSnapshot>,
}

impl MetricsSnapshot {
    pub fn tool(&self, operation: &str) -> Option<&ToolSnapshot> {
        self.tools.get(operation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before any lookup
    pub hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub errors: u64,
    pub success_rate: f64,
    pub latency: LatencySummary,
}

/// Latencies in milliseconds. Percentiles cover only the retained window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub samples: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_counts_and_rates() {
        let metrics = MetricsCollector::default();
        metrics.record_call("get_quote", ms(10), true);
        metrics.record_call("get_quote", ms(30), false);
        metrics.record_call("get_quote", ms(20), true);
        metrics.record_call("list_datasets", ms(5), true);

        let snap = metrics.snapshot();
        let quote = snap.tool("get_quote").unwrap();
        assert_eq!(quote.calls, 3);
        assert_eq!(quote.successes, 2);
        assert_eq!(quote.errors, 1);
        assert!((quote.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((quote.latency.avg_ms - 20.0).abs() < 1e-6);
        assert!((quote.latency.min_ms - 10.0).abs() < 1e-6);
        assert!((quote.latency.max_ms - 30.0).abs() < 1e-6);
        assert_eq!(snap.tools.len(), 2);
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let metrics = MetricsCollector::default();
        for i in 1..=100 {
            metrics.record_call("op", ms(i), true);
        }
        let latency = metrics.snapshot().tools["op"].latency.clone();
        assert!((latency.p95_ms - 95.0).abs() < 1e-6);
        assert!((latency.p99_ms - 99.0).abs() < 1e-6);
        assert_eq!(latency.samples, 100);
    }

    #[test]
    fn test_single_sample_percentiles() {
        let metrics = MetricsCollector::default();
        metrics.record_call("op", ms(42), true);
        let latency = metrics.snapshot().tools["op"].latency.clone();
        assert!((latency.p95_ms - 42.0).abs() < 1e-6);
        assert!((latency.p99_ms - 42.0).abs() < 1e-6);
    }

    #[test]
    fn test_history_is_bounded() {
        let metrics = MetricsCollector::with_config(&MetricsConfig {
            enabled: true,
            max_latency_samples: 10,
        });
        for i in 1..=25 {
            metrics.record_call("op", ms(i), true);
        }
        let tool = metrics.snapshot().tools["op"].clone();
        assert_eq!(tool.calls, 25);
        assert_eq!(tool.latency.samples, 10);
        // all-time aggregates still see the evicted samples
        assert!((tool.latency.min_ms - 1.0).abs() < 1e-6);
        assert!((tool.latency.max_ms - 25.0).abs() < 1e-6);
        assert!((tool.latency.avg_ms - 13.0).abs() < 1e-6);
        // percentiles only see 16..=25
        assert!((tool.latency.p95_ms - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_drops_oldest() {
        let mut window = LatencyWindow::new(3);
        for i in 1..=5 {
            window.push(ms(i));
        }
        let kept: Vec<_> = window.iter().copied().collect();
        assert_eq!(kept, vec![ms(3), ms(4), ms(5)]);
        assert_eq!(window.percentile(50), Some(ms(4)));
        assert_eq!(LatencyWindow::new(3).percentile(95), None);
    }

    #[test]
    fn test_cache_counters() {
        let metrics = MetricsCollector::default();
        assert_eq!(metrics.snapshot().cache.hit_rate, 0.0);

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_api_call();

        let snap = metrics.snapshot();
        assert_eq!(snap.cache.hits, 3);
        assert_eq!(snap.cache.misses, 1);
        assert!((snap.cache.hit_rate - 0.75).abs() < 1e-9);
        assert_eq!(snap.total_api_calls, 1);
    }

    #[test]
    fn test_disabled_collector_ignores_input() {
        let metrics = MetricsCollector::with_config(&MetricsConfig {
            enabled: false,
            ..Default::default()
        });
        metrics.record_call("op", ms(1), true);
        metrics.record_cache_hit();
        metrics.record_api_call();

        let snap = metrics.snapshot();
        assert!(!snap.enabled);
        assert!(snap.tools.is_empty());
        assert_eq!(snap.cache.hits, 0);
        assert_eq!(snap.total_api_calls, 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let metrics = MetricsCollector::default();
        metrics.record_call("op", ms(1), false);
        metrics.record_cache_miss();
        metrics.reset();

        let snap = metrics.snapshot();
        assert!(snap.tools.is_empty());
        assert_eq!(snap.cache.misses, 0);
        assert!(snap.uptime_seconds < 5.0);
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(MetricsCollector::default());
        let workers: Vec<_> = (0..8)
            .map(|w| {
                let metrics = metrics.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        metrics.record_call("op", ms(i % 7), (i + w) % 3 != 0);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let tool = metrics.snapshot().tools["op"].clone();
        assert_eq!(tool.calls, 2000);
        assert_eq!(tool.successes + tool.errors, 2000);
        assert_eq!(tool.latency.samples, 1000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsCollector::default();
        metrics.record_call("op", ms(2), true);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["tools"]["op"]["calls"], 1);
        assert!(json["cache"]["hit_rate"].is_number());
    }
}
