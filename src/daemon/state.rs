//! Daemon states, tick results and statistics

use std::time::Duration;

/// Where the consumer is in handling the head item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Between items; shutdown and health checks are handled here
    Idle,
    /// Asking for the queue depth
    Polling,
    /// Queue is non-empty; fetching head metadata and mapping it
    HasWork,
    /// Bytes are accessible and about to be inspected
    Mapped,
    /// Inspection done; about to unmap
    Verifying,
    /// About to release the head item
    Releasing,
    /// Waiting out a failure before retrying
    ErrorBackoff,
    /// Shutdown observed; the loop is over
    Stopped,
}

impl DaemonState {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonState::Idle => "idle",
            DaemonState::Polling => "polling",
            DaemonState::HasWork => "has-work",
            DaemonState::Mapped => "mapped",
            DaemonState::Verifying => "verifying",
            DaemonState::Releasing => "releasing",
            DaemonState::ErrorBackoff => "error-backoff",
            DaemonState::Stopped => "stopped",
        }
    }
}

/// What the driver should do after one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Step again right away
    Continue,
    /// Sleep before the next step
    Sleep(Duration),
    /// The daemon has stopped
    Stopped,
}

/// Counters kept by the daemon
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    /// Items with a payload that were inspected and released
    pub processed: u64,
    /// Empty items released without mapping
    pub empty_items: u64,
    /// Payload bytes inspected
    pub bytes: u64,
    pub releases: u64,
    pub map_failures: u64,
    pub read_failures: u64,
    /// Failures of any kind
    pub errors: u64,
    /// Long cool-downs taken after too many consecutive failures
    pub cooldowns: u64,
    pub reconnects: u64,
    pub health_checks: u64,
}

impl DaemonStats {
    /// Transfers per minute over `uptime`
    pub fn rate_per_minute(&self, uptime: Duration) -> f64 {
        let secs = uptime.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.processed + self.empty_items) as f64 * 60.0 / secs
    }
}
