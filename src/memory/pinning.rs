//! Page acquisition: pin the producer's frame or copy into a fresh one

use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Result, XferError};

use super::{arena::FrameArena, config::AcquireMode, page::PageHandle};

/// Turns producer buffers into owned page handles
#[derive(Debug, Clone)]
pub struct PageAcquirer {
    arena: Arc<FrameArena>,
    mode: AcquireMode,
}

impl PageAcquirer {
    /// Create an acquirer drawing pages from `arena`
    pub fn new(arena: Arc<FrameArena>, mode: AcquireMode) -> Self {
        Self { arena, mode }
    }

    /// Acquire a page holding the first bytes of `source`
    ///
    /// The transfer is clamped to one page and never crosses a page boundary,
    /// so the returned size can be smaller than `requested_size`. On success
    /// the handle holds one reference and belongs to the caller.
    pub fn acquire(&self, source: &[u8], requested_size: usize) -> Result<(PageHandle, usize)> {
        if requested_size == 0 {
            return Err(XferError::invalid_parameter(
                "requested_size",
                "Zero-length transfers carry no page",
            ));
        }

        let page = self.arena.frame_size();
        let in_page = source.as_ptr() as usize % page;
        let size = clamp_to_page(in_page, requested_size, page);

        match self.mode {
            AcquireMode::ZeroCopy => self.pin(source, size),
            AcquireMode::Copy => self.copy(source, size),
        }
    }

    fn pin(&self, source: &[u8], size: usize) -> Result<(PageHandle, usize)> {
        if size > source.len() {
            return Err(XferError::pin_failure(format!(
                "{} bytes requested from a {}-byte buffer",
                size,
                source.len()
            )));
        }

        let (frame, data_offset) = self.arena.pin_address(source.as_ptr()).map_err(|e| {
            warn!("zero-copy pin failed: {}", e);
            e
        })?;
        debug!(
            "pinned frame {} at offset {} for {} bytes",
            frame.frame_id(),
            data_offset,
            size
        );
        Ok((PageHandle::new(frame, AcquireMode::ZeroCopy, data_offset), size))
    }

    fn copy(&self, source: &[u8], size: usize) -> Result<(PageHandle, usize)> {
        if size > source.len() {
            return Err(XferError::copy_failure(size, source.len()));
        }

        let frame = self.arena.alloc_frame()?;
        frame.copy_in(0, &source[..size]);
        debug!("copied {} bytes into frame {}", size, frame.frame_id());
        Ok((PageHandle::new(frame, AcquireMode::Copy, 0), size))
    }

    /// The acquisition mode in use
    pub fn mode(&self) -> AcquireMode {
        self.mode
    }

    /// The arena pages are drawn from
    pub fn arena(&self) -> &Arc<FrameArena> {
        &self.arena
    }
}

/// Clamp a transfer starting `in_page` bytes into a page to that page
pub fn clamp_to_page(in_page: usize, requested: usize, page_size: usize) -> usize {
    let size = requested.min(page_size);
    if in_page + size > page_size {
        page_size - in_page
    } else {
        size
    }
}
