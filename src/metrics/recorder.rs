//! Per-request timing telemetry for the scheduler.
//!
//! The [`MetricsRecorder`] is an explicitly constructed instance handed to
//! the scheduler components, never reached through ambient state, so the
//! core stays testable in isolation. Recording is synchronous over short
//! mutex-guarded pushes: O(1), never spanning I/O, never awaiting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use super::prometheus::PrometheusMetrics;
use crate::scheduler::request::{OutcomeKind, Priority, RejectReason};

/// Default number of recent samples retained per tier and series.
/// Retention is a tunable, not a correctness property.
pub const DEFAULT_SAMPLE_WINDOW: usize = 1024;

/// Latency percentiles in milliseconds.
///
/// Estimator: linear interpolation at rank `q * (n - 1)` over the sorted
/// window, so `[10, 20, 30, 40]` yields a P50 of 25.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct TierCounters {
    received: AtomicU64,
    completed_ok: AtomicU64,
    upstream_errors: AtomicU64,
    timed_out: AtomicU64,
    rejected_queue_full: AtomicU64,
    rejected_shutdown: AtomicU64,
    cancelled: AtomicU64,
}

struct TierSamples {
    wait_ms: Mutex<VecDeque<f64>>,
    service_ms: Mutex<VecDeque<f64>>,
}

impl TierSamples {
    fn new() -> Self {
        Self {
            wait_ms: Mutex::new(VecDeque::new()),
            service_ms: Mutex::new(VecDeque::new()),
        }
    }
}

struct Tier {
    counters: TierCounters,
    samples: TierSamples,
}

#[derive(Clone, Copy)]
enum Series {
    Wait,
    Service,
}

impl Series {
    fn of<'a>(self, samples: &'a TierSamples) -> &'a Mutex<VecDeque<f64>> {
        match self {
            Series::Wait => &samples.wait_ms,
            Series::Service => &samples.service_ms,
        }
    }
}

/// Records queue wait time, service duration, and outcome per priority
/// tier, and answers percentile queries over a bounded recent window.
pub struct MetricsRecorder {
    window: usize,
    tiers: [Tier; 2],
    export: Option<Arc<PrometheusMetrics>>,
}

fn tier_index(priority: Priority) -> usize {
    priority as usize
}

fn lock_samples(samples: &Mutex<VecDeque<f64>>) -> MutexGuard<'_, VecDeque<f64>> {
    samples.lock().expect("metrics window poisoned")
}

impl MetricsRecorder {
    pub fn new(window: usize) -> Self {
        let tier = || Tier { counters: TierCounters::default(), samples: TierSamples::new() };
        Self { window, tiers: [tier(), tier()], export: None }
    }

    /// Mirror scheduler samples into Prometheus series as they arrive.
    pub fn with_exporter(mut self, export: Arc<PrometheusMetrics>) -> Self {
        self.export = Some(export);
        self
    }

    fn push_sample(&self, samples: &Mutex<VecDeque<f64>>, value_ms: f64) {
        let mut window = lock_samples(samples);
        if window.len() >= self.window {
            window.pop_front();
        }
        window.push_back(value_ms);
    }

    /// A request was admitted to the queue.
    pub fn record_received(&self, priority: Priority) {
        self.tiers[tier_index(priority)]
            .counters
            .received
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Enqueue-to-dispatch duration, recorded by the dispatching worker.
    pub fn record_wait(&self, priority: Priority, wait: Duration) {
        let ms = wait.as_secs_f64() * 1000.0;
        self.push_sample(&self.tiers[tier_index(priority)].samples.wait_ms, ms);

        if let Some(export) = &self.export {
            export
                .queue_wait_seconds
                .with_label_values(&[priority.as_str()])
                .observe(wait.as_secs_f64());
        }
    }

    /// Dispatch-to-completion duration with its outcome.
    pub fn record_service(&self, priority: Priority, service: Duration, outcome: OutcomeKind) {
        let ms = service.as_secs_f64() * 1000.0;
        self.push_sample(&self.tiers[tier_index(priority)].samples.service_ms, ms);

        let counters = &self.tiers[tier_index(priority)].counters;
        match outcome {
            OutcomeKind::Ok => counters.completed_ok.fetch_add(1, Ordering::Relaxed),
            OutcomeKind::UpstreamError => {
                counters.upstream_errors.fetch_add(1, Ordering::Relaxed)
            }
            OutcomeKind::TimedOut => {
                if let Some(export) = &self.export {
                    export.requests_timeout_total.inc();
                }
                counters.timed_out.fetch_add(1, Ordering::Relaxed)
            }
            OutcomeKind::Cancelled => counters.cancelled.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// A request was turned away without being serviced.
    pub fn record_rejected(&self, priority: Priority, reason: RejectReason) {
        let counters = &self.tiers[tier_index(priority)].counters;
        match reason {
            RejectReason::QueueFull => {
                counters.rejected_queue_full.fetch_add(1, Ordering::Relaxed)
            }
            RejectReason::ShuttingDown => {
                counters.rejected_shutdown.fetch_add(1, Ordering::Relaxed)
            }
        };

        if let Some(export) = &self.export {
            export.requests_rejected_total.inc();
        }
    }

    /// The caller disconnected before its request was dispatched.
    pub fn record_cancelled(&self, priority: Priority) {
        self.tiers[tier_index(priority)]
            .counters
            .cancelled
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Queue-wait percentiles for one tier, or combined when `None`.
    pub fn wait_percentiles(&self, priority: Option<Priority>) -> Percentiles {
        self.percentiles_of(priority, Series::Wait)
    }

    /// Service-duration percentiles for one tier, or combined when `None`.
    pub fn service_percentiles(&self, priority: Option<Priority>) -> Percentiles {
        self.percentiles_of(priority, Series::Service)
    }

    fn percentiles_of(&self, priority: Option<Priority>, series: Series) -> Percentiles {
        let mut values: Vec<f64> = match priority {
            Some(priority) => {
                lock_samples(series.of(&self.tiers[tier_index(priority)].samples))
                    .iter()
                    .copied()
                    .collect()
            }
            None => self
                .tiers
                .iter()
                .flat_map(|tier| {
                    lock_samples(series.of(&tier.samples))
                        .iter()
                        .copied()
                        .collect::<Vec<_>>()
                })
                .collect(),
        };

        values.sort_by(|a, b| a.total_cmp(b));
        Percentiles {
            p50: percentile(&values, 0.50),
            p75: percentile(&values, 0.75),
            p95: percentile(&values, 0.95),
            p99: percentile(&values, 0.99),
        }
    }

    /// Point-in-time view of all counters and percentiles.
    pub fn snapshot(&self) -> RecorderSnapshot {
        RecorderSnapshot {
            normal: self.tier_snapshot(Priority::Normal),
            high: self.tier_snapshot(Priority::High),
            combined_wait: self.wait_percentiles(None),
            combined_service: self.service_percentiles(None),
        }
    }

    fn tier_snapshot(&self, priority: Priority) -> TierSnapshot {
        let counters = &self.tiers[tier_index(priority)].counters;
        TierSnapshot {
            received: counters.received.load(Ordering::Relaxed),
            completed_ok: counters.completed_ok.load(Ordering::Relaxed),
            upstream_errors: counters.upstream_errors.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            rejected_queue_full: counters.rejected_queue_full.load(Ordering::Relaxed),
            rejected_shutdown: counters.rejected_shutdown.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            wait: self.wait_percentiles(Some(priority)),
            service: self.service_percentiles(Some(priority)),
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_WINDOW)
    }
}

/// Linear interpolation at rank `q * (n - 1)` over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = q * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
            }
        }
    }
}

/// Counters and percentiles for one priority tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierSnapshot {
    pub received: u64,
    pub completed_ok: u64,
    pub upstream_errors: u64,
    pub timed_out: u64,
    pub rejected_queue_full: u64,
    pub rejected_shutdown: u64,
    pub cancelled: u64,
    pub wait: Percentiles,
    pub service: Percentiles,
}

/// Snapshot of the recorder at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct RecorderSnapshot {
    pub normal: TierSnapshot,
    pub high: TierSnapshot,
    pub combined_wait: Percentiles,
    pub combined_service: Percentiles,
}
