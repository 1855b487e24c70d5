//! Configuration for a transfer subsystem instance

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MAX_ITEMS;
use crate::error::{Result, XferError};
use crate::memory::{AcquireMode, ArenaConfig};

/// Settings chosen when the subsystem is initialised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemConfig {
    /// Zero-copy pinning or copy fallback
    pub acquire_mode: AcquireMode,
    /// Maximum number of tracked transfer items
    pub max_items: usize,
    /// Frame arena backing the pages
    pub arena: ArenaConfig,
}

impl Default for SubsystemConfig {
    fn default() -> Self {
        Self {
            acquire_mode: AcquireMode::default(),
            max_items: DEFAULT_MAX_ITEMS,
            arena: ArenaConfig::default(),
        }
    }
}

impl SubsystemConfig {
    /// Set the acquisition mode
    pub fn with_acquire_mode(mut self, mode: AcquireMode) -> Self {
        self.acquire_mode = mode;
        self
    }

    /// Set the zero-copy toggle
    pub fn with_zero_copy(self, enabled: bool) -> Self {
        self.with_acquire_mode(AcquireMode::from_zero_copy(enabled))
    }

    /// Set the maximum queue depth
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    /// Set the arena configuration
    pub fn with_arena(mut self, arena: ArenaConfig) -> Self {
        self.arena = arena;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_items == 0 {
            return Err(XferError::invalid_parameter(
                "max_items",
                "Queue must accept at least one item",
            ));
        }
        self.arena.validate()
    }
}

/// On-disk or command-line form of the configuration surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub zero_copy: bool,
    pub max_items: usize,
    pub frames: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let config = SubsystemConfig::default();
        Self {
            zero_copy: config.acquire_mode == AcquireMode::ZeroCopy,
            max_items: config.max_items,
            frames: config.arena.frame_count,
        }
    }
}

impl From<Settings> for SubsystemConfig {
    fn from(settings: Settings) -> Self {
        SubsystemConfig::default()
            .with_zero_copy(settings.zero_copy)
            .with_max_items(settings.max_items)
            .with_arena(ArenaConfig::default().with_frame_count(settings.frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SubsystemConfig::default();
        assert_eq!(config.max_items, 128);
        assert_eq!(config.acquire_mode, AcquireMode::ZeroCopy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(SubsystemConfig::default().with_max_items(0).validate().is_err());
        let bad_arena = ArenaConfig::new("x", 0);
        assert!(SubsystemConfig::default().with_arena(bad_arena).validate().is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let settings = Settings {
            zero_copy: false,
            max_items: 4,
            frames: 8,
        };
        let config = SubsystemConfig::from(settings);
        assert_eq!(config.acquire_mode, AcquireMode::Copy);
        assert_eq!(config.max_items, 4);
        assert_eq!(config.arena.frame_count, 8);
    }
}
