//! Transfer queue statistics tracking

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of queue activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items currently queued
    pub depth: usize,
    /// Deepest the queue has been
    pub peak_depth: usize,
    /// Items accepted
    pub enqueued: u64,
    /// Items refused because the queue was full
    pub rejected: u64,
    /// Items removed by a release
    pub released: u64,
    /// Releases issued against an empty queue
    pub empty_releases: u64,
    /// Items dropped by teardown
    pub drained: u64,
}

impl QueueStats {
    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "QueueStats {{ depth: {}, peak: {}, enqueued: {}, rejected: {}, \
             released: {}, empty_releases: {}, drained: {} }}",
            self.depth,
            self.peak_depth,
            self.enqueued,
            self.rejected,
            self.released,
            self.empty_releases,
            self.drained
        )
    }
}

/// Thread-safe counters behind [`QueueStats`]
#[derive(Debug, Default)]
pub struct AtomicQueueStats {
    peak_depth: AtomicUsize,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    released: AtomicU64,
    empty_releases: AtomicU64,
    drained: AtomicU64,
}

impl AtomicQueueStats {
    pub fn record_enqueue(&self, depth: usize) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_release(&self) {
        self.empty_releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drain(&self, count: usize) {
        self.drained.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self, depth: usize) -> QueueStats {
        QueueStats {
            depth,
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            empty_releases: self.empty_releases.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }
}
