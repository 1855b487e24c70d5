//! Read-only views of a mapped head page

use std::fmt;
use std::os::fd::AsFd;
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

use crate::error::{Result, XferError};
use crate::memory::{page_size, PageLease};
use crate::protocol::MapGrant;

/// The consumer's view of a mapped transfer item
///
/// A region for an empty item maps nothing and reads as an empty slice. A
/// region created in-process keeps its own share of the page lease, so the
/// frame cannot be recycled while the view is alive.
pub struct MappedRegion {
    map: Option<Mmap>,
    lease: Option<Arc<PageLease>>,
    data_offset: usize,
    len: usize,
    frame_id: u64,
    generation: u64,
}

impl MappedRegion {
    /// Zero-effect mapping for an item without a page
    pub fn empty() -> Self {
        Self {
            map: None,
            lease: None,
            data_offset: 0,
            len: 0,
            frame_id: 0,
            generation: 0,
        }
    }

    pub(crate) fn from_lease(
        map: Mmap,
        lease: Arc<PageLease>,
        len: usize,
        generation: u64,
    ) -> Self {
        Self {
            data_offset: lease.data_offset(),
            frame_id: lease.frame_id(),
            map: Some(map),
            lease: Some(lease),
            len,
            generation,
        }
    }

    /// Map the page described by `grant` from the arena descriptor
    ///
    /// Used by consumers in another process after receiving the grant and
    /// the descriptor over a control channel.
    pub fn from_grant<F: AsFd>(fd: F, grant: &MapGrant) -> Result<Self> {
        if grant.is_empty() {
            return Ok(Self::empty());
        }

        let page = page_size();
        let end = grant
            .data_offset
            .checked_add(grant.len)
            .ok_or_else(|| XferError::malformed(format!("Mapping grant overflows: {:?}", grant)))?;
        if end > page as u64 {
            return Err(XferError::invalid_size(usize::try_from(end).unwrap_or(usize::MAX), page));
        }
        let data_offset = grant.data_offset as usize;
        let len = grant.len as usize;

        let fd = fd.as_fd();
        let map = unsafe {
            MmapOptions::new()
                .offset(grant.file_offset)
                .len(page)
                .map(&fd)
                .map_err(|e| {
                    XferError::map_failure(format!(
                        "Failed to map frame {} at {:#x}: {}",
                        grant.frame_id, grant.file_offset, e
                    ))
                })?
        };

        Ok(Self {
            map: Some(map),
            lease: None,
            data_offset,
            len,
            frame_id: grant.frame_id,
            generation: grant.generation,
        })
    }

    /// Whether nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.map.is_none() || self.len == 0
    }

    /// Number of readable bytes
    pub fn len(&self) -> usize {
        if self.map.is_some() {
            self.len
        } else {
            0
        }
    }

    /// The mapped bytes of the item
    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[self.data_offset..self.data_offset + self.len],
            None => &[],
        }
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Generation of the mapping this view belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the view holds its own page reference
    pub fn holds_reference(&self) -> bool {
        self.lease.is_some()
    }
}

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("frame_id", &self.frame_id)
            .field("data_offset", &self.data_offset)
            .field("len", &self.len())
            .field("generation", &self.generation)
            .finish()
    }
}
