//! Consumer daemon configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_COOLDOWN, DEFAULT_ERROR_THRESHOLD, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_POLL_TIMEOUT,
    DEFAULT_PREVIEW_LEN, DEFAULT_SHORT_BACKOFF, MAX_MAP_LEN,
};
use crate::error::{Result, XferError};

/// How the daemon gets at an item's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Map the head page read-only
    Map,
    /// Copy the bytes out through the read path
    Read,
}

impl Default for AccessMode {
    fn default() -> Self {
        Self::Map
    }
}

/// Consumer daemon settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Longest wait for readiness when the queue is empty
    pub poll_timeout: Duration,
    /// Interval between health checks of the control channel
    pub health_check_interval: Duration,
    /// Consecutive failures that trigger the long cool-down
    pub error_threshold: u32,
    /// Pause after an isolated failure
    pub short_backoff: Duration,
    /// Pause after `error_threshold` consecutive failures
    pub cooldown: Duration,
    /// Upper bound on a single mapping request
    pub max_map_len: usize,
    pub access_mode: AccessMode,
    /// Hex dumps and extended previews
    pub verbose: bool,
    /// Bytes shown in the content preview
    pub preview_len: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            short_backoff: DEFAULT_SHORT_BACKOFF,
            cooldown: DEFAULT_COOLDOWN,
            max_map_len: MAX_MAP_LEN,
            access_mode: AccessMode::default(),
            verbose: false,
            preview_len: DEFAULT_PREVIEW_LEN,
        }
    }
}

impl DaemonConfig {
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    pub fn with_backoff(mut self, short: Duration, cooldown: Duration) -> Self {
        self.short_backoff = short;
        self.cooldown = cooldown;
        self
    }

    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.access_mode = mode;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_max_map_len(mut self, max_map_len: usize) -> Self {
        self.max_map_len = max_map_len;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.error_threshold == 0 {
            return Err(XferError::invalid_parameter(
                "error_threshold",
                "Error threshold must be at least 1",
            ));
        }
        if self.max_map_len == 0 {
            return Err(XferError::invalid_parameter(
                "max_map_len",
                "Mapping limit must be positive",
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(XferError::invalid_parameter(
                "health_check_interval",
                "Health check interval must be positive",
            ));
        }
        Ok(())
    }
}
