//! Frame arena statistics tracking

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of frame arena usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total number of frames in the arena
    pub frame_count: usize,
    /// Frames currently on the free list
    pub free_frames: usize,
    /// Peak number of frames referenced simultaneously
    pub peak_in_use: usize,
    /// Successful frame allocations
    pub allocations: u64,
    /// Allocations refused because no frame was free
    pub allocation_failures: u64,
    /// Extra references taken on already-allocated frames
    pub pins: u64,
    /// Pin attempts on addresses outside the arena or on free frames
    pub pin_failures: u64,
    /// Frames returned to the free list
    pub releases: u64,
}

impl ArenaStats {
    /// Frames currently referenced by someone
    pub fn in_use(&self) -> usize {
        self.frame_count.saturating_sub(self.free_frames)
    }

    /// Calculate arena utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.frame_count == 0 {
            return 0.0;
        }
        self.in_use() as f64 / self.frame_count as f64
    }

    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "ArenaStats {{ frames: {}, free: {}, peak: {}, allocations: {}, \
             failures: {}, pins: {}, pin_failures: {}, releases: {}, utilization: {:.2}% }}",
            self.frame_count,
            self.free_frames,
            self.peak_in_use,
            self.allocations,
            self.allocation_failures,
            self.pins,
            self.pin_failures,
            self.releases,
            self.utilization() * 100.0
        )
    }
}

/// Thread-safe counters behind [`ArenaStats`]
#[derive(Debug, Default)]
pub struct AtomicArenaStats {
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    allocations: AtomicU64,
    allocation_failures: AtomicU64,
    pins: AtomicU64,
    pin_failures: AtomicU64,
    releases: AtomicU64,
}

impl AtomicArenaStats {
    /// Record a frame leaving the free list
    pub fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let now = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_use.fetch_max(now, Ordering::Relaxed);
    }

    /// Record an allocation that found no free frame
    pub fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an extra reference on a live frame
    pub fn record_pin(&self) {
        self.pins.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refused pin
    pub fn record_pin_failure(&self) {
        self.pin_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame going back on the free list
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self, frame_count: usize, free_frames: usize) -> ArenaStats {
        ArenaStats {
            frame_count,
            free_frames,
            peak_in_use: self.peak_in_use.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            pins: self.pins.load(Ordering::Relaxed),
            pin_failures: self.pin_failures.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}
