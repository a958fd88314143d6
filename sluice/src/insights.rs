//! Pipeline insights: per-worker counters and the injected metrics sink.
//!
//! Each worker owns one `WorkerMetrics` and is its only writer. Aggregation
//! happens on read (`MetricsSnapshot`), never on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::worker::Stage;

/// log2(nanoseconds) buckets: bucket `i` holds durations in `[2^i, 2^(i+1))` ns.
const HISTOGRAM_BUCKETS: usize = 40;

/// What happened at the publish boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishEvent {
    Accepted,
    CapacityExceeded,
    ProcessingDisabled,
}

/// Bridge to an external metrics registry. All methods default to no-ops.
pub trait MetricsSink: Send + Sync {
    fn message_processed(&self, _stage: Stage, _worker: usize, _elapsed: Duration, _ok: bool) {}

    fn publish(&self, _event: PublishEvent) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

pub struct WorkerMetrics {
    stage: Stage,
    worker: usize,
    processed: AtomicU64,
    failures: AtomicU64,
    total_nanos: AtomicU64,
    histogram: [AtomicU64; HISTOGRAM_BUCKETS],
}

impl WorkerMetrics {
    pub fn new(stage: Stage, worker: usize) -> Self {
        Self {
            stage,
            worker,
            processed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            histogram: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn record(&self, elapsed: Duration, ok: bool) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.processed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.histogram[bucket_for(nanos)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            stage: self.stage,
            worker: self.worker,
            processed: self.processed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_time: Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed)),
            histogram: std::array::from_fn(|i| self.histogram[i].load(Ordering::Relaxed)),
        }
    }
}

#[inline]
fn bucket_for(nanos: u64) -> usize {
    if nanos == 0 {
        0
    } else {
        (63 - nanos.leading_zeros() as usize).min(HISTOGRAM_BUCKETS - 1)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub stage: Stage,
    pub worker: usize,
    pub processed: u64,
    pub failures: u64,
    pub total_time: Duration,
    histogram: [u64; HISTOGRAM_BUCKETS],
}

impl WorkerStats {
    pub fn mean(&self) -> Duration {
        if self.processed == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.total_time.as_nanos() / self.processed as u128) as u64)
        }
    }

    /// Upper bound of the histogram bucket holding quantile `q` (0.0-1.0).
    pub fn quantile(&self, q: f64) -> Duration {
        let total: u64 = self.histogram.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }
        let target = ((total as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (i, count) in self.histogram.iter().enumerate() {
            seen += count;
            if seen >= target {
                return Duration::from_nanos(1u64 << (i + 1).min(63));
            }
        }
        Duration::from_nanos(1u64 << HISTOGRAM_BUCKETS)
    }
}

#[derive(Debug, Default)]
pub(crate) struct ProducerMetrics {
    accepted: AtomicU64,
    capacity_exceeded: AtomicU64,
    processing_disabled: AtomicU64,
}

impl ProducerMetrics {
    #[inline]
    pub(crate) fn record(&self, event: PublishEvent) {
        let counter = match event {
            PublishEvent::Accepted => &self.accepted,
            PublishEvent::CapacityExceeded => &self.capacity_exceeded,
            PublishEvent::ProcessingDisabled => &self.processing_disabled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub capacity_exceeded: u64,
    pub processing_disabled: u64,
    pub remaining_capacity: u64,
    pub workers: Vec<WorkerStats>,
}

impl MetricsSnapshot {
    pub(crate) fn collect(
        producer: &ProducerMetrics,
        remaining_capacity: u64,
        workers: &[std::sync::Arc<WorkerMetrics>],
    ) -> Self {
        Self {
            accepted: producer.accepted.load(Ordering::Relaxed),
            capacity_exceeded: producer.capacity_exceeded.load(Ordering::Relaxed),
            processing_disabled: producer.processing_disabled.load(Ordering::Relaxed),
            remaining_capacity,
            workers: workers.iter().map(|w| w.stats()).collect(),
        }
    }

    /// Messages processed by every worker of `stage`.
    pub fn processed(&self, stage: Stage) -> u64 {
        self.workers
            .iter()
            .filter(|w| w.stage == stage)
            .map(|w| w.processed)
            .sum()
    }

    pub fn failures(&self, stage: Stage) -> u64 {
        self.workers
            .iter()
            .filter(|w| w.stage == stage)
            .map(|w| w.failures)
            .sum()
    }
}
