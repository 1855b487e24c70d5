//! Page memory: frame arena, page handles and acquisition

pub mod config;
pub mod stats;
pub mod arena;
pub mod page;
pub mod pinning;

use std::sync::OnceLock;

pub use config::{AcquireMode, ArenaConfig};
pub use stats::{ArenaStats, AtomicArenaStats};
pub use arena::{FrameArena, SharedPage};
pub use page::{OwnershipState, PageHandle, PageLease};
pub use pinning::{clamp_to_page, PageAcquirer};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Size of one system page in bytes
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        use nix::unistd::{sysconf, SysconfVar};

        match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(size)) if size > 0 => size as usize,
            _ => FALLBACK_PAGE_SIZE,
        }
    })
}

/// Source bytes laid out at the start of a page, so acquisition never
/// shortens them at a page boundary
#[cfg(test)]
pub(crate) struct PageAligned {
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

#[cfg(test)]
impl PageAligned {
    pub(crate) fn new(data: &[u8]) -> Self {
        let page = page_size();
        assert!(data.len() <= page);
        let mut buf = vec![0u8; page * 2];
        let start = (page - buf.as_ptr() as usize % page) % page;
        buf[start..start + data.len()].copy_from_slice(data);
        Self {
            buf,
            start,
            len: data.len(),
        }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }
}
