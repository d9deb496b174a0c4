//! Task-level counters. The sink trait keeps the hot paths free of any
//! knowledge about where the numbers end up.

use std::sync::atomic::{AtomicU64, Ordering};

pub trait MetricsSink: Send + Sync {
    fn incr_records_read(&self, n: u64);
    fn incr_bytes_read(&self, n: u64);
    fn incr_blocks_fetched(&self, n: u64);
    fn incr_batches_exchanged(&self, n: u64);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_records_read(&self, _n: u64) {}
    fn incr_bytes_read(&self, _n: u64) {}
    fn incr_blocks_fetched(&self, _n: u64) {}
    fn incr_batches_exchanged(&self, _n: u64) {}
}

#[derive(Default)]
pub struct ReadMetrics {
    records_read: AtomicU64,
    bytes_read: AtomicU64,
    blocks_fetched: AtomicU64,
    batches_exchanged: AtomicU64,
}

impl ReadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_read(&self) -> u64 {
        self.records_read.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn blocks_fetched(&self) -> u64 {
        self.blocks_fetched.load(Ordering::Relaxed)
    }

    pub fn batches_exchanged(&self) -> u64 {
        self.batches_exchanged.load(Ordering::Relaxed)
    }
}

impl MetricsSink for ReadMetrics {
    fn incr_records_read(&self, n: u64) {
        self.records_read.fetch_add(n, Ordering::Relaxed);
    }
    fn incr_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }
    fn incr_blocks_fetched(&self, n: u64) {
        self.blocks_fetched.fetch_add(n, Ordering::Relaxed);
    }
    fn incr_batches_exchanged(&self, n: u64) {
        self.batches_exchanged.fetch_add(n, Ordering::Relaxed);
    }
}
