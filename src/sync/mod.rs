//! Synchronization primitives shared by producers and consumers
//!
//! Key features:
//! - Generation-counted readiness notification safe for many waiters
//! - eventfd mirror on Linux for consumers that poll descriptors
//! - Cooperative shutdown flag checked by long-running loops

pub mod notify;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub use notify::{NotificationStats, ReadinessNotifier};

/// Cooperative cancellation shared between a loop and whoever stops it
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl ShutdownFlag {
    /// Create a flag that is not yet raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to stop at its next check
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether shutdown has been requested
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag_shared_between_clones() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();
        assert!(!other.is_requested());
        flag.request();
        assert!(other.is_requested());
    }
}
