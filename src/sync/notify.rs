//! Readiness notification using a generation counter and eventfd
//!
//! In-process waiters sleep on a condition variable keyed by a generation
//! number, so any number of them can wait at once and none misses a wake-up
//! that happens between its readiness check and its wait. On Linux every
//! notification is mirrored onto an eventfd, which external pollers can watch
//! for `POLLIN`. The owner clears the eventfd when there is nothing left to
//! read, so it stays readable only while work is pending.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::{Condvar, Mutex};

#[cfg(target_os = "linux")]
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

#[cfg(target_os = "linux")]
use nix::{
    errno::Errno,
    sys::eventfd::{eventfd, EfdFlags},
    unistd::{read, write},
};

use crate::error::{Result, XferError};

/// Wakes consumers blocked waiting for the queue to become readable
#[derive(Debug)]
pub struct ReadinessNotifier {
    /// Bumped on every notification
    generation: Mutex<u64>,
    condvar: Condvar,
    /// Event file descriptor mirroring notifications for external pollers
    #[cfg(target_os = "linux")]
    event_fd: OwnedFd,
    /// Statistics
    notify_count: AtomicU64,
    wait_count: AtomicU64,
    timeout_count: AtomicU64,
}

impl ReadinessNotifier {
    /// Create a new readiness notifier
    pub fn new() -> Result<Self> {
        Ok(Self {
            generation: Mutex::new(0),
            condvar: Condvar::new(),
            #[cfg(target_os = "linux")]
            event_fd: Self::create_eventfd()?,
            notify_count: AtomicU64::new(0),
            wait_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
        })
    }

    #[cfg(target_os = "linux")]
    fn create_eventfd() -> Result<OwnedFd> {
        eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| XferError::platform(format!("Failed to create eventfd: {}", e)))
    }

    /// Wake every waiter
    pub fn notify(&self) -> Result<()> {
        self.notify_count.fetch_add(1, Ordering::Relaxed);

        {
            let mut generation = self.generation.lock();
            *generation = generation.wrapping_add(1);
        }
        self.condvar.notify_all();

        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;

            let buf = 1u64.to_ne_bytes();
            match write(self.event_fd.as_raw_fd(), &buf) {
                Ok(_) => {}
                // Counter saturated; pollers are already woken
                Err(Errno::EAGAIN) => {}
                Err(e) => {
                    return Err(XferError::platform(format!("Failed to signal eventfd: {}", e)))
                }
            }
        }

        Ok(())
    }

    /// Current generation, to be taken before checking readiness
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Wait until a notification newer than `seen` arrives
    ///
    /// Returns `false` if the timeout expired first. `None` waits forever.
    pub fn wait_past(&self, seen: u64, timeout: Option<Duration>) -> bool {
        self.wait_count.fetch_add(1, Ordering::Relaxed);

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut generation = self.generation.lock();
        while *generation == seen {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut generation, deadline).timed_out()
                        && *generation == seen
                    {
                        self.timeout_count.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                }
                None => self.condvar.wait(&mut generation),
            }
        }
        true
    }

    /// Descriptor that turns readable on notification (Linux only)
    #[cfg(target_os = "linux")]
    pub fn event_fd(&self) -> BorrowedFd<'_> {
        self.event_fd.as_fd()
    }

    /// Reset the eventfd counter, returning the notifications it had collected
    ///
    /// Called once nothing is pending, so pollers stop seeing `POLLIN`.
    #[cfg(target_os = "linux")]
    pub fn clear_pending(&self) -> u64 {
        use std::os::fd::AsRawFd;

        let mut buf = [0u8; 8];
        match read(self.event_fd.as_raw_fd(), &mut buf) {
            Ok(8) => u64::from_ne_bytes(buf),
            Ok(_) | Err(Errno::EAGAIN) => 0,
            Err(e) => {
                warn!("failed to clear eventfd: {}", e);
                0
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn clear_pending(&self) -> u64 {
        0
    }

    /// Get notification statistics
    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            notify_count: self.notify_count.load(Ordering::Relaxed),
            wait_count: self.wait_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for readiness notifications
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationStats {
    /// Number of notifications sent
    pub notify_count: u64,
    /// Number of waits performed
    pub wait_count: u64,
    /// Waits that ended without a notification
    pub timeout_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_notify_counts() {
        let notifier = ReadinessNotifier::new().unwrap();
        notifier.notify().unwrap();
        notifier.notify().unwrap();

        let stats = notifier.stats();
        assert_eq!(stats.notify_count, 2);
        assert_eq!(notifier.generation(), 2);
    }

    #[test]
    fn test_wait_times_out() {
        let notifier = ReadinessNotifier::new().unwrap();
        let seen = notifier.generation();
        assert!(!notifier.wait_past(seen, Some(Duration::from_millis(10))));
        assert_eq!(notifier.stats().timeout_count, 1);
    }

    #[test]
    fn test_notification_before_wait_is_not_lost() {
        let notifier = ReadinessNotifier::new().unwrap();
        let seen = notifier.generation();
        notifier.notify().unwrap();
        assert!(notifier.wait_past(seen, Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_all_waiters_woken() {
        let notifier = Arc::new(ReadinessNotifier::new().unwrap());
        let barrier = Arc::new(Barrier::new(4));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let notifier = Arc::clone(&notifier);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let seen = notifier.generation();
                    barrier.wait();
                    notifier.wait_past(seen, Some(Duration::from_secs(5)))
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        notifier.notify().unwrap();

        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_eventfd_mirrors_notifications() {
        use nix::poll::{poll, PollFd, PollFlags};

        let notifier = ReadinessNotifier::new().unwrap();
        assert_eq!(notifier.clear_pending(), 0);

        notifier.notify().unwrap();
        notifier.notify().unwrap();

        let fd = notifier.event_fd();
        let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
        assert_eq!(poll(&mut fds, 100).unwrap(), 1);
        assert_eq!(notifier.clear_pending(), 2);

        let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
        assert_eq!(poll(&mut fds, 0).unwrap(), 0);
    }
}
