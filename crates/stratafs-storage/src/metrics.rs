//! Operation counters for the storage core.
//!
//! Plain atomic counters; how they are exported is the embedder's concern.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters updated on the hot paths.
#[derive(Debug, Default)]
pub struct ZbdMetrics {
    writes: AtomicU64,
    bytes_written: AtomicU64,
    reads: AtomicU64,
    bytes_read: AtomicU64,
    syncs: AtomicU64,
    io_allocations: AtomicU64,
    wal_allocations: AtomicU64,
    meta_allocations: AtomicU64,
    bg_finishes: AtomicU64,
    bg_resets: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// File append calls.
    pub writes: u64,
    /// Bytes appended to zones.
    pub bytes_written: u64,
    /// Positioned read calls.
    pub reads: u64,
    /// Bytes returned by reads.
    pub bytes_read: u64,
    /// Fsync calls on writable files.
    pub syncs: u64,
    /// Data-zone allocations.
    pub io_allocations: u64,
    /// Data-zone allocations taken on the high-priority path.
    pub wal_allocations: u64,
    /// Op-log and snapshot zone allocations.
    pub meta_allocations: u64,
    /// Background zone finishes completed.
    pub bg_finishes: u64,
    /// Background zone resets completed.
    pub bg_resets: u64,
}

impl ZbdMetrics {
    /// Records one file append of `bytes`.
    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one positioned read returning `bytes`.
    pub fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one fsync.
    pub fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one data-zone allocation.
    pub fn record_io_allocation(&self, is_wal: bool) {
        self.io_allocations.fetch_add(1, Ordering::Relaxed);
        if is_wal {
            self.wal_allocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records one op-log or snapshot zone allocation.
    pub fn record_meta_allocation(&self) {
        self.meta_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed background finish.
    pub fn record_bg_finish(&self) {
        self.bg_finishes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed background reset.
    pub fn record_bg_reset(&self) {
        self.bg_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            io_allocations: self.io_allocations.load(Ordering::Relaxed),
            wal_allocations: self.wal_allocations.load(Ordering::Relaxed),
            meta_allocations: self.meta_allocations.load(Ordering::Relaxed),
            bg_finishes: self.bg_finishes.load(Ordering::Relaxed),
            bg_resets: self.bg_resets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = ZbdMetrics::default();
        m.record_write(4096);
        m.record_write(8192);
        m.record_read(4096);
        m.record_io_allocation(true);
        m.record_io_allocation(false);
        m.record_sync();

        let snap = m.snapshot();
        assert_eq!(snap.writes, 2);
        assert_eq!(snap.bytes_written, 12288);
        assert_eq!(snap.reads, 1);
        assert_eq!(snap.io_allocations, 2);
        assert_eq!(snap.wal_allocations, 1);
        assert_eq!(snap.syncs, 1);
    }
}
