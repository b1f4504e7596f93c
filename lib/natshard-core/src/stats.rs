//! In-memory runtime counters for the Receiver and Processor (§4.1, §4.2.6).
//! Grounded on the teacher's `internal_events`-module idiom: one small
//! struct per subsystem, plain `AtomicU64` counters bumped on the hot path
//! and logged periodically rather than funneled through a metrics registry
//! this repo has no sink for.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Receiver-side counters (§4.1 "received, written, errors, start time,
/// last-seen timestamp").
#[derive(Debug)]
pub struct ReceiverStats {
    pub received: AtomicU64,
    pub written: AtomicU64,
    pub errors: AtomicU64,
    pub started_at: Instant,
    pub last_seen_unix: AtomicI64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        ReceiverStats {
            received: AtomicU64::new(0),
            written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at: Instant::now(),
            last_seen_unix: AtomicI64::new(0),
        }
    }

    pub fn record_datagram(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
        self.last_seen_unix
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReceiverSnapshot {
        ReceiverSnapshot {
            received: self.received.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiverSnapshot {
    pub received: u64,
    pub written: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

/// Processor-side counters, mirrored into `processor_stats` on each flush
/// (§4.2.6): `lines_processed`, `lines_inserted`, `lines_filtered`,
/// `lines_failed`, `last_log_seen`, plus a rotation counter (§4.2.5).
#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub lines_processed: AtomicU64,
    pub lines_inserted: AtomicU64,
    pub lines_filtered: AtomicU64,
    pub lines_failed: AtomicU64,
    pub last_log_seen: AtomicI64,
    pub rotations: AtomicU64,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_filtered(&self) {
        self.lines_processed.fetch_add(1, Ordering::Relaxed);
        self.lines_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_failure(&self) {
        self.lines_processed.fetch_add(1, Ordering::Relaxed);
        self.lines_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parsed(&self, ts_unix: i64) {
        self.lines_processed.fetch_add(1, Ordering::Relaxed);
        self.lines_inserted.fetch_add(1, Ordering::Relaxed);
        self.last_log_seen.fetch_max(ts_unix, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders the keys §4.2.6 requires for the `processor_stats` upsert.
    pub fn as_kv_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("lines_processed", self.lines_processed.load(Ordering::Relaxed).to_string()),
            ("lines_inserted", self.lines_inserted.load(Ordering::Relaxed).to_string()),
            ("lines_filtered", self.lines_filtered.load(Ordering::Relaxed).to_string()),
            ("lines_failed", self.lines_failed.load(Ordering::Relaxed).to_string()),
            ("last_log_seen", self.last_log_seen.load(Ordering::Relaxed).to_string()),
        ]
    }
}
