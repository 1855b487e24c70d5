//! Error counters kept by the subsystem context

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of failure counts by operation family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorStats {
    pub read_errors: u64,
    pub write_errors: u64,
    pub control_errors: u64,
    pub mapping_errors: u64,
}

impl ErrorStats {
    pub fn total(&self) -> u64 {
        self.read_errors + self.write_errors + self.control_errors + self.mapping_errors
    }
}

#[derive(Debug, Default)]
pub struct ErrorCounters {
    read: AtomicU64,
    write: AtomicU64,
    control: AtomicU64,
    mapping: AtomicU64,
}

impl ErrorCounters {
    pub fn record_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.write.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control(&self) {
        self.control.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mapping(&self) {
        self.mapping.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ErrorStats {
        ErrorStats {
            read_errors: self.read.load(Ordering::Relaxed),
            write_errors: self.write.load(Ordering::Relaxed),
            control_errors: self.control.load(Ordering::Relaxed),
            mapping_errors: self.mapping.load(Ordering::Relaxed),
        }
    }
}
