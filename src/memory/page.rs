//! Page handles and mapping leases
//!
//! A [`PageHandle`] is the single owner of one frame reference. It cannot be
//! cloned; the only way to share the frame is [`PageHandle::lend`], which
//! produces a [`PageLease`] holding a second reference for as long as a
//! mapping is live. Ownership therefore moves through
//! `Unowned -> QueueOwned -> QueueOwnedMapped -> QueueOwned` and ends when the
//! queue drops the handle.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use memmap2::Mmap;

use crate::error::Result;

use super::{arena::FrameRef, config::AcquireMode};

/// Who currently holds references to a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    /// Held by the producer, not yet handed to a queue
    Unowned,
    /// Exclusively owned by the queue
    QueueOwned,
    /// Owned by the queue and lent to a live mapping
    QueueOwnedMapped,
}

/// Owned, counted reference to one page of transfer data
#[derive(Debug)]
pub struct PageHandle {
    frame: FrameRef,
    mode: AcquireMode,
    data_offset: usize,
    queued: bool,
    leases: Arc<AtomicUsize>,
}

impl PageHandle {
    pub(crate) fn new(frame: FrameRef, mode: AcquireMode, data_offset: usize) -> Self {
        Self {
            frame,
            mode,
            data_offset,
            queued: false,
            leases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Current ownership state
    pub fn ownership(&self) -> OwnershipState {
        match (self.queued, self.leases.load(Ordering::Acquire)) {
            (false, _) => OwnershipState::Unowned,
            (true, 0) => OwnershipState::QueueOwned,
            (true, _) => OwnershipState::QueueOwnedMapped,
        }
    }

    /// Hand the page over to a queue
    pub(crate) fn enter_queue(&mut self) {
        debug_assert_eq!(self.ownership(), OwnershipState::Unowned);
        self.queued = true;
    }

    /// Lend the page to a mapping, taking a second frame reference
    pub(crate) fn lend(&self) -> Result<PageLease> {
        debug_assert!(self.queued, "only queued pages are lent to mappings");
        let frame = self.frame.pin()?;
        self.leases.fetch_add(1, Ordering::AcqRel);
        Ok(PageLease {
            frame,
            data_offset: self.data_offset,
            leases: Arc::clone(&self.leases),
        })
    }

    /// How the page was acquired
    pub fn mode(&self) -> AcquireMode {
        self.mode
    }

    /// Offset of the first data byte inside the page
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Debug identifier of the backing frame (never zero)
    pub fn frame_id(&self) -> u64 {
        self.frame.frame_id()
    }

    /// Reference count of the backing frame, across all holders
    pub fn ref_count(&self) -> u32 {
        self.frame.ref_count()
    }

    /// Copy data starting `pos` bytes past the data offset; the caller bounds
    /// `buf` by the item size
    pub(crate) fn read_into(&self, pos: usize, buf: &mut [u8]) -> usize {
        match self.data_offset.checked_add(pos) {
            Some(start) => self.frame.copy_out(start, buf),
            None => 0,
        }
    }
}

/// A temporary extra reference held while a page is mapped
#[derive(Debug)]
pub struct PageLease {
    frame: FrameRef,
    data_offset: usize,
    leases: Arc<AtomicUsize>,
}

impl PageLease {
    /// Map the leased frame read-only at a fresh address
    pub(crate) fn map(&self) -> Result<Mmap> {
        self.frame.arena().map_frame(self.frame.index())
    }

    pub(crate) fn frame_index(&self) -> u32 {
        self.frame.index()
    }

    /// Debug identifier of the leased frame
    pub fn frame_id(&self) -> u64 {
        self.frame.frame_id()
    }

    /// Offset of the first data byte inside the page
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Byte offset of the frame inside the arena's backing file
    pub fn file_offset(&self) -> u64 {
        self.frame.arena().file_offset(self.frame.index())
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }
}
