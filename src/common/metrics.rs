//! Coordination metrics
//!
//! Prometheus-compatible counters, gauges and a latency histogram for the
//! stamping path, health probes and folio sequencing. One registry per
//! `Coordinator`; components share it through an `Arc`.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for stamping latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 10] = [
    50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 3000.0, 5000.0, 8000.0, 10000.0,
];

#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value (milliseconds)
    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, last entry is +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((le, cumulative));
        }
        out
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Stamping outcomes for one branch
#[derive(Debug, Default)]
pub struct BranchMetrics {
    pub stamps_committed: Counter,
    pub stamp_failures: Counter,
    pub latency: Histogram,
}

#[derive(Debug)]
pub struct CoordinatorMetrics {
    branches: Mutex<BTreeMap<String, Arc<BranchMetrics>>>,

    pub requests_committed: Counter,
    pub requests_failed: Counter,
    pub requests_deduplicated: Counter,
    pub failovers: Counter,

    pub folios_reserved: Counter,
    pub folios_released: Counter,
    pub threshold_rejections: Counter,

    pub probe_successes: Counter,
    pub probe_failures: Counter,
    pub available_branches: Gauge,

    start_time: Instant,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self {
            branches: Mutex::new(BTreeMap::new()),
            requests_committed: Counter::new(),
            requests_failed: Counter::new(),
            requests_deduplicated: Counter::new(),
            failovers: Counter::new(),
            folios_reserved: Counter::new(),
            folios_released: Counter::new(),
            threshold_rejections: Counter::new(),
            probe_successes: Counter::new(),
            probe_failures: Counter::new(),
            available_branches: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for a branch
    pub fn branch(&self, code: &str) -> Arc<BranchMetrics> {
        let mut branches = self.branches.lock().unwrap_or_else(PoisonError::into_inner);
        branches
            .entry(code.to_string())
            .or_insert_with(|| Arc::new(BranchMetrics::default()))
            .clone()
    }

    /// Record one PAC call against a branch
    pub fn record_stamp(&self, code: &str, elapsed: Duration, success: bool) {
        let branch = self.branch(code);
        branch.latency.observe(elapsed.as_secs_f64() * 1000.0);
        if success {
            branch.stamps_committed.inc();
        } else {
            branch.stamp_failures.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let globals: [(&str, &str, &str, u64); 11] = [
            ("cfdi_requests_committed_total", "counter", "Requests that reached a committed stamp", self.requests_committed.get()),
            ("cfdi_requests_failed_total", "counter", "Requests that ended failed or cancelled", self.requests_failed.get()),
            ("cfdi_requests_deduplicated_total", "counter", "Resubmissions answered from the dedup cache", self.requests_deduplicated.get()),
            ("cfdi_failovers_total", "counter", "Attempts moved to another branch", self.failovers.get()),
            ("cfdi_folios_reserved_total", "counter", "Folio numbers reserved", self.folios_reserved.get()),
            ("cfdi_folios_released_total", "counter", "Folio numbers burned without a stamp", self.folios_released.get()),
            ("cfdi_threshold_rejections_total", "counter", "Reservations refused for exhausted series", self.threshold_rejections.get()),
            ("cfdi_probe_successes_total", "counter", "Successful health probes", self.probe_successes.get()),
            ("cfdi_probe_failures_total", "counter", "Failed or timed out health probes", self.probe_failures.get()),
            ("cfdi_available_branches", "gauge", "Branches currently marked available", self.available_branches.get()),
            ("cfdi_uptime_seconds", "gauge", "Engine uptime in seconds", self.uptime_seconds()),
        ];
        for (name, kind, help, value) in globals {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
        }

        let branches = self.branches.lock().unwrap_or_else(PoisonError::into_inner);

        out.push_str("# HELP cfdi_branch_stamps_total PAC calls per branch and outcome\n");
        out.push_str("# TYPE cfdi_branch_stamps_total counter\n");
        for (code, m) in branches.iter() {
            let _ = writeln!(
                out,
                "cfdi_branch_stamps_total{{branch=\"{}\",outcome=\"committed\"}} {}",
                code,
                m.stamps_committed.get()
            );
            let _ = writeln!(
                out,
                "cfdi_branch_stamps_total{{branch=\"{}\",outcome=\"failed\"}} {}",
                code,
                m.stamp_failures.get()
            );
        }

        out.push_str("# HELP cfdi_stamp_duration_ms PAC call duration in milliseconds\n");
        out.push_str("# TYPE cfdi_stamp_duration_ms histogram\n");
        for (code, m) in branches.iter() {
            for (le, count) in m.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "cfdi_stamp_duration_ms_bucket{{branch=\"{}\",le=\"{}\"}} {}",
                    code, le, count
                );
            }
            let _ = writeln!(
                out,
                "cfdi_stamp_duration_ms_sum{{branch=\"{}\"}} {}",
                code,
                m.latency.sum()
            );
            let _ = writeln!(
                out,
                "cfdi_stamp_duration_ms_count{{branch=\"{}\"}} {}",
                code,
                m.latency.count()
            );
        }

        out
    }
}

impl Default for CoordinatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
