//! Configuration types for frame arenas and page acquisition

use serde::{Deserialize, Serialize};

/// How a producer's bytes end up in a queued page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquireMode {
    /// Pin the arena frame that already holds the producer's bytes
    ZeroCopy,
    /// Allocate a fresh frame and copy the bytes into it
    Copy,
}

impl Default for AcquireMode {
    fn default() -> Self {
        Self::ZeroCopy
    }
}

impl AcquireMode {
    /// Build the mode from the boolean zero-copy toggle
    pub fn from_zero_copy(enabled: bool) -> Self {
        if enabled {
            Self::ZeroCopy
        } else {
            Self::Copy
        }
    }

    /// Get a human-readable name for the mode
    pub fn name(&self) -> &'static str {
        match self {
            AcquireMode::ZeroCopy => "zero-copy",
            AcquireMode::Copy => "copy",
        }
    }
}

/// Configuration for a memfd-backed frame arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Name given to the memfd (visible in /proc/<pid>/fd)
    pub name: String,
    /// Number of page-sized frames in the arena
    pub frame_count: usize,
    /// Whether frames are mlock()ed while referenced
    pub lock_frames: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            name: "pagebridge".to_string(),
            frame_count: crate::config::DEFAULT_ARENA_FRAMES,
            lock_frames: false,
        }
    }
}

impl ArenaConfig {
    /// Create a new arena configuration
    pub fn new(name: impl Into<String>, frame_count: usize) -> Self {
        Self {
            name: name.into(),
            frame_count,
            ..Default::default()
        }
    }

    /// Set the number of frames
    pub fn with_frame_count(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    /// Set whether frames are locked into RAM while referenced
    pub fn with_lock_frames(mut self, lock_frames: bool) -> Self {
        self.lock_frames = lock_frames;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        use crate::error::XferError;

        if self.name.is_empty() {
            return Err(XferError::invalid_parameter(
                "name",
                "Arena name cannot be empty",
            ));
        }

        if self.name.contains('\0') {
            return Err(XferError::invalid_parameter(
                "name",
                "Arena name contains null bytes",
            ));
        }

        if self.frame_count == 0 {
            return Err(XferError::invalid_parameter(
                "frame_count",
                "Arena must hold at least one frame",
            ));
        }

        if self.frame_count > u32::MAX as usize {
            return Err(XferError::invalid_parameter(
                "frame_count",
                format!("Frame count {} exceeds {}", self.frame_count, u32::MAX),
            ));
        }

        Ok(())
    }
}
