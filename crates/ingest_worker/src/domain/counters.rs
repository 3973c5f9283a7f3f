use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-pipeline counters, updated from every receiver worker
#[derive(Debug, Default)]
pub struct PipelineCounters {
    payloads_received: AtomicU64,
    decoded: AtomicU64,
    failed_decodes: AtomicU64,
    duplicates: AtomicU64,
    deduplicator_errors: AtomicU64,
    forwarded: AtomicU64,
    handler_errors: AtomicU64,
}

/// Point-in-time copy of [`PipelineCounters`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub payloads_received: u64,
    pub decoded: u64,
    pub failed_decodes: u64,
    pub duplicates: u64,
    pub deduplicator_errors: u64,
    pub forwarded: u64,
    pub handler_errors: u64,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_payload(&self) {
        self.payloads_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, count: u64) {
        self.decoded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed_decode(&self) {
        self.failed_decodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicator_error(&self) {
        self.deduplicator_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            failed_decodes: self.failed_decodes.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            deduplicator_errors: self.deduplicator_errors.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}
