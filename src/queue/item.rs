//! Transfer items: one queued page plus its metadata

use crate::memory::PageHandle;
use crate::protocol::XferInfo;

/// One unit of data waiting to be consumed
///
/// An item either owns a page and a nonzero size, or owns nothing and has
/// size zero (the record of a zero-byte write).
#[derive(Debug)]
pub struct TransferItem {
    page: Option<PageHandle>,
    offset: i64,
    size: u64,
    seq: u64,
}

impl TransferItem {
    /// Item carrying `size` bytes of `page`
    pub fn with_page(page: PageHandle, offset: i64, size: usize) -> Self {
        debug_assert!(size > 0, "a paged item carries at least one byte");
        Self {
            page: Some(page),
            offset,
            size: size as u64,
            seq: 0,
        }
    }

    /// Item recording a zero-byte write
    pub fn empty(offset: i64) -> Self {
        Self {
            page: None,
            offset,
            size: 0,
            seq: 0,
        }
    }

    pub fn page(&self) -> Option<&PageHandle> {
        self.page.as_ref()
    }

    pub(crate) fn page_mut(&mut self) -> Option<&mut PageHandle> {
        self.page.as_mut()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.page.is_none()
    }

    /// Enqueue order, assigned by the queue
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    /// Frame identifier, 0 without a page
    pub fn frame_id(&self) -> u64 {
        self.page.as_ref().map(PageHandle::frame_id).unwrap_or(0)
    }

    /// Read-only view handed to inspectors
    pub fn view(&self) -> XferInfo {
        XferInfo {
            offset: self.offset,
            size: self.size,
            frame_id: self.frame_id(),
        }
    }
}
