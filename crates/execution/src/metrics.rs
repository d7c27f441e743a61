//! Per-operator counters surfaced by `explain_analyze`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arrow::record_batch::RecordBatch;

/// Counters shared by every partition of one physical operator.
#[derive(Debug, Default)]
pub struct OperatorMetrics {
    output_rows: AtomicU64,
    output_batches: AtomicU64,
    output_bytes: AtomicU64,
    elapsed_nanos: AtomicU64,
    spill_count: AtomicU64,
    spill_bytes: AtomicU64,
}

/// Point-in-time copy of [`OperatorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub output_rows: u64,
    pub output_batches: u64,
    pub output_bytes: u64,
    /// Wall time spent polling this operator, children included.
    pub elapsed: Duration,
    pub spill_count: u64,
    pub spill_bytes: u64,
}

impl OperatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, batch: &RecordBatch) {
        self.output_rows
            .fetch_add(batch.num_rows() as u64, Ordering::Relaxed);
        self.output_batches.fetch_add(1, Ordering::Relaxed);
        self.output_bytes
            .fetch_add(batch.get_array_memory_size() as u64, Ordering::Relaxed);
    }

    pub fn add_elapsed(&self, d: Duration) {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn record_spill(&self, bytes: u64) {
        self.spill_count.fetch_add(1, Ordering::Relaxed);
        self.spill_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            output_rows: self.output_rows.load(Ordering::Relaxed),
            output_batches: self.output_batches.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            elapsed: Duration::from_nanos(self.elapsed_nanos.load(Ordering::Relaxed)),
            spill_count: self.spill_count.load(Ordering::Relaxed),
            spill_bytes: self.spill_bytes.load(Ordering::Relaxed),
        }
    }
}
