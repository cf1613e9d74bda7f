//! Counters and rate tracking.
//!
//! Components report through an injected [`MetricsSink`] so the crawl core
//! never owns a global registry.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Receiver for counter increments and gauge samples.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, by: u64);

    fn record(&self, _name: &str, _value: f64) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _by: u64) {}
}

/// In-memory counters, used for the run summary and in tests.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
    gauges: Mutex<BTreeMap<String, f64>>,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.lock().ok().and_then(|g| g.get(name).copied())
    }

    /// Copy of all counters, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl MetricsSink for CounterMetrics {
    fn increment(&self, name: &str, by: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += by;
        }
    }

    fn record(&self, name: &str, value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(name.to_string(), value);
        }
    }
}

/// Rolling request rate over the last minute.
#[derive(Debug)]
pub struct RateMeter {
    window: Duration,
    started: Instant,
    ticks: Mutex<VecDeque<Instant>>,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            ticks: Mutex::new(VecDeque::new()),
        }
    }

    /// Count one request and return `(requests/sec, requests/min)`.
    pub fn tick(&self) -> (f64, f64) {
        let now = Instant::now();
        let Ok(mut ticks) = self.ticks.lock() else {
            return (0.0, 0.0);
        };
        ticks.push_back(now);
        while let Some(front) = ticks.front() {
            if now.duration_since(*front) > self.window {
                ticks.pop_front();
            } else {
                break;
            }
        }

        // Before a full window has passed, divide by the time actually elapsed.
        let span = now
            .duration_since(self.started)
            .min(self.window)
            .as_secs_f64()
            .max(1.0);
        let per_sec = ticks.len() as f64 / span;
        (per_sec, per_sec * 60.0)
    }
}
