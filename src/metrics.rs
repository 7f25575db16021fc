//! Metrics recorder: counters, gauges, bounded histograms.
//!
//! Counters and gauges live in lock-free maps; histogram ring buffers share a
//! single lock. Every component accepts an explicit `Arc<Metrics>`; the free
//! functions [`incr`], [`gauge`] and [`observe`] hit a process-wide default
//! recorder for convenience.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::now_ms;

/// Samples retained per histogram (ring buffer).
const HISTOGRAM_CAPACITY: usize = 1000;

/// Summary of one histogram's recent samples.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time snapshot of everything the recorder holds.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub counters: Vec<(String, u64)>,
    pub gauges: Vec<(String, f64)>,
    pub histograms: Vec<(String, HistogramSummary)>,
}

pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
    // Gauges store f64 bit patterns so updates stay lock-free.
    gauges: DashMap<String, AtomicU64>,
    histograms: Mutex<AHashMap<String, VecDeque<f64>>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: Mutex::new(AHashMap::new()),
        }
    }

    /// Add `val` to a counter, creating it at zero on first use.
    pub fn incr(&self, name: &str, val: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(val, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(val, Ordering::Relaxed);
    }

    /// Set a gauge to the current value.
    pub fn gauge(&self, name: &str, val: f64) {
        if let Some(gauge) = self.gauges.get(name) {
            gauge.store(val.to_bits(), Ordering::Relaxed);
            return;
        }
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(val.to_bits(), Ordering::Relaxed);
    }

    /// Record a sample into a histogram, keeping the most recent
    /// `HISTOGRAM_CAPACITY` samples.
    pub fn observe(&self, name: &str, val: f64) {
        let mut hists = self.histograms.lock();
        let ring = hists.entry(name.to_string()).or_default();
        if ring.len() >= HISTOGRAM_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(val);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .get(name)
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
    }

    /// Snapshot everything, computing histogram summaries.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::default();

        for entry in self.counters.iter() {
            snap.counters
                .push((entry.key().clone(), entry.value().load(Ordering::Relaxed)));
        }
        for entry in self.gauges.iter() {
            snap.gauges.push((
                entry.key().clone(),
                f64::from_bits(entry.value().load(Ordering::Relaxed)),
            ));
        }

        let hists = self.histograms.lock();
        for (name, ring) in hists.iter() {
            if let Some(summary) = summarize(ring) {
                snap.histograms.push((name.clone(), summary));
            }
        }

        snap.counters.sort_by(|a, b| a.0.cmp(&b.0));
        snap.gauges.sort_by(|a, b| a.0.cmp(&b.0));
        snap.histograms.sort_by(|a, b| a.0.cmp(&b.0));
        snap
    }

    /// Render the snapshot in the Prometheus text exposition format.
    /// Histograms are exposed as summaries with quantile labels.
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();

        for (name, value) in &snap.counters {
            let name = sanitize(name);
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        for (name, value) in &snap.gauges {
            let name = sanitize(name);
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
        for (name, summary) in &snap.histograms {
            let name = sanitize(name);
            out.push_str(&format!("# TYPE {name} summary\n"));
            out.push_str(&format!("{name}{{quantile=\"0.5\"}} {}\n", summary.p50));
            out.push_str(&format!("{name}{{quantile=\"0.95\"}} {}\n", summary.p95));
            out.push_str(&format!("{name}{{quantile=\"0.99\"}} {}\n", summary.p99));
            out.push_str(&format!(
                "{name}_sum {}\n",
                summary.mean * summary.count as f64
            ));
            out.push_str(&format!("{name}_count {}\n", summary.count));
        }
        out
    }

    pub fn reset(&self) {
        self.counters.clear();
        self.gauges.clear();
        self.histograms.lock().clear();
    }
}

fn summarize(ring: &VecDeque<f64>) -> Option<HistogramSummary> {
    if ring.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = ring.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
    Some(HistogramSummary {
        count: n,
        mean: sorted.iter().sum::<f64>() / n as f64,
        p50: at(0.5),
        p95: at(0.95),
        p99: at(0.99),
    })
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

// ============== Default Recorder ==============

static DEFAULT: Lazy<Arc<Metrics>> = Lazy::new(|| Arc::new(Metrics::new()));

/// The process-wide default recorder.
pub fn default_metrics() -> Arc<Metrics> {
    Arc::clone(&DEFAULT)
}

/// Bump a counter on the default recorder.
pub fn incr(name: &str) {
    DEFAULT.incr(name, 1);
}

/// Set a gauge on the default recorder.
pub fn gauge(name: &str, val: f64) {
    DEFAULT.gauge(name, val);
}

/// Record a histogram sample on the default recorder.
pub fn observe(name: &str, val: f64) {
    DEFAULT.observe(name, val);
}

/// Measures elapsed wall time and records it (in milliseconds) into a
/// histogram when dropped.
pub struct Timer {
    metrics: Arc<Metrics>,
    name: String,
    start: Instant,
}

impl Timer {
    pub fn new(metrics: Arc<Metrics>, name: impl Into<String>) -> Self {
        Self {
            metrics,
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Timer against the default recorder.
    pub fn default_scoped(name: impl Into<String>) -> Self {
        Self::new(default_metrics(), name)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.observe(&self.name, elapsed_ms);
    }
}

/// Spawn a background task that logs a metrics summary every `interval`.
/// Returns the task handle; abort it to stop reporting.
pub fn spawn_reporter(
    metrics: Arc<Metrics>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            let snap = metrics.snapshot();
            tracing::info!(
                counters = snap.counters.len(),
                gauges = snap.gauges.len(),
                histograms = snap.histograms.len(),
                ts_ms = now_ms(),
                "metrics summary"
            );
            for (name, value) in &snap.counters {
                tracing::debug!(counter = %name, value, "counter");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let m = Metrics::new();
        m.incr("requests", 1);
        m.incr("requests", 2);
        m.gauge("workers", 4.0);

        assert_eq!(m.counter_value("requests"), 3);
        assert_eq!(m.gauge_value("workers"), Some(4.0));
        assert_eq!(m.counter_value("missing"), 0);
        assert!(m.gauge_value("missing").is_none());
    }

    #[test]
    fn test_histogram_summary() {
        let m = Metrics::new();
        for i in 1..=100 {
            m.observe("latency", i as f64);
        }
        let snap = m.snapshot();
        let (_, summary) = &snap.histograms[0];
        assert_eq!(summary.count, 100);
        assert!((summary.mean - 50.5).abs() < 1e-9);
        assert_eq!(summary.p50, 51.0);
        assert_eq!(summary.p95, 96.0);
        assert_eq!(summary.p99, 100.0);
    }

    #[test]
    fn test_histogram_ring_buffer_caps_at_1000() {
        let m = Metrics::new();
        for i in 0..2500 {
            m.observe("hot", i as f64);
        }
        let snap = m.snapshot();
        let (_, summary) = &snap.histograms[0];
        assert_eq!(summary.count, 1000);
        // Only the most recent 1000 samples (1500..2500) survive.
        assert_eq!(summary.p50, 2000.0);
        assert!((summary.mean - 1999.5).abs() < 1e-9);
    }

    #[test]
    fn test_prometheus_rendering() {
        let m = Metrics::new();
        m.incr("limiter.api.accepted", 7);
        m.gauge("pool.workers", 3.0);
        m.observe("queue.fifo.worker", 12.5);

        let text = m.render_prometheus();
        assert!(text.contains("# TYPE limiter_api_accepted counter"));
        assert!(text.contains("limiter_api_accepted 7"));
        assert!(text.contains("# TYPE pool_workers gauge"));
        assert!(text.contains("queue_fifo_worker{quantile=\"0.5\"} 12.5"));
        assert!(text.contains("queue_fifo_worker_count 1"));
    }
}
