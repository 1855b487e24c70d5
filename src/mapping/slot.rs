//! The single system-wide "currently mapped" slot

use std::sync::Arc;

use log::debug;

use crate::memory::PageLease;

/// Identifies one open control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// The live mapping and who owns it
#[derive(Debug)]
pub struct ActiveMapping {
    pub session: SessionId,
    pub generation: u64,
    // Released when the mapping is cleared or replaced
    lease: Arc<PageLease>,
}

impl ActiveMapping {
    /// Frame kept referenced by this mapping
    pub fn frame_id(&self) -> u64 {
        self.lease.frame_id()
    }
}

/// Holder of at most one live mapping, guarded by the mapping lock
#[derive(Debug, Default)]
pub struct MappingSlot {
    active: Option<ActiveMapping>,
    generation: u64,
}

impl MappingSlot {
    /// Record a new mapping, unpinning whichever one it replaces
    pub(crate) fn install(&mut self, session: SessionId, lease: Arc<PageLease>) -> u64 {
        self.generation += 1;
        let replaced = self.active.replace(ActiveMapping {
            session,
            generation: self.generation,
            lease,
        });
        if let Some(old) = replaced {
            debug!(
                "mapping {} of {} (frame {}) replaced",
                old.generation,
                old.session,
                old.frame_id()
            );
        }
        self.generation
    }

    /// Drop the mapping if `session` owns it
    pub(crate) fn clear_for(&mut self, session: SessionId) -> Option<ActiveMapping> {
        match &self.active {
            Some(active) if active.session == session => self.active.take(),
            _ => None,
        }
    }

    /// Drop the mapping regardless of owner
    pub(crate) fn clear(&mut self) -> Option<ActiveMapping> {
        self.active.take()
    }

    pub fn active(&self) -> Option<&ActiveMapping> {
        self.active.as_ref()
    }

    /// Number of mappings established so far
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
