//! memfd-backed arena of page-sized frames
//!
//! Every frame carries its own reference count. A frame leaves the free list
//! with one reference, gains more when it is pinned, and returns to the free
//! list when the last reference is dropped. A second, read-only descriptor
//! for the same file can be handed to another process, which maps a single
//! frame by file offset and cannot map any frame writable.

use std::{
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    ptr, slice,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use log::{debug, warn};
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::error::{Result, XferError};

use super::{
    config::ArenaConfig,
    page_size,
    stats::{ArenaStats, AtomicArenaStats},
};

/// Per-frame bookkeeping, kept in the producer's address space
#[derive(Debug, Default)]
struct FrameSlot {
    refs: AtomicU32,
}

/// A fixed set of page-sized frames backed by one memfd
#[derive(Debug)]
pub struct FrameArena {
    name: String,
    fd: OwnedFd,
    /// Read-only reopening of `fd`, the only descriptor given to consumers
    read_only_fd: OwnedFd,
    map: MmapMut,
    frame_size: usize,
    slots: Box<[FrameSlot]>,
    free: Mutex<Vec<u32>>,
    lock_frames: bool,
    stats: AtomicArenaStats,
}

impl FrameArena {
    /// Create a new arena
    pub fn new(config: ArenaConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let frame_size = page_size();
        let total = frame_size
            .checked_mul(config.frame_count)
            .ok_or_else(|| XferError::invalid_parameter("frame_count", "Arena size overflows"))?;

        let (fd, read_only_fd) = Self::create_backing(&config.name, total)?;
        let map = unsafe {
            MmapOptions::new()
                .len(total)
                .map_mut(&fd)
                .map_err(|e| XferError::from_io(e, "Failed to map frame arena"))?
        };

        let slots = (0..config.frame_count)
            .map(|_| FrameSlot::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Lowest index on top so frames are handed out in ascending order
        let free = (0..config.frame_count as u32).rev().collect();

        debug!(
            "created arena '{}' with {} frames of {} bytes",
            config.name, config.frame_count, frame_size
        );

        Ok(Arc::new(Self {
            name: config.name,
            fd,
            read_only_fd,
            map,
            frame_size,
            slots,
            free: Mutex::new(free),
            lock_frames: config.lock_frames,
            stats: AtomicArenaStats::default(),
        }))
    }

    #[cfg(target_os = "linux")]
    fn create_backing(name: &str, size: usize) -> Result<(OwnedFd, OwnedFd)> {
        use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
        use std::ffi::CString;
        use std::fs::OpenOptions;
        use std::os::fd::AsRawFd;

        let name_cstr = CString::new(name)
            .map_err(|_| XferError::invalid_parameter("name", "Name contains null bytes"))?;

        let owned_fd = memfd_create(&name_cstr, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|e| XferError::platform(format!("Failed to create memfd: {}", e)))?;

        nix::unistd::ftruncate(&owned_fd, size as i64)
            .map_err(|e| XferError::platform(format!("Failed to set memfd size: {}", e)))?;

        // A fresh open of the memfd inode with read access only
        let read_only = OpenOptions::new()
            .read(true)
            .open(format!("/proc/self/fd/{}", owned_fd.as_raw_fd()))
            .map_err(|e| XferError::from_io(e, "Failed to reopen memfd read-only"))?;

        Ok((owned_fd, OwnedFd::from(read_only)))
    }

    #[cfg(not(target_os = "linux"))]
    fn create_backing(name: &str, size: usize) -> Result<(OwnedFd, OwnedFd)> {
        use std::fs::OpenOptions;

        let path = std::env::temp_dir().join(format!("pagebridge_{}_{}", name, std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| XferError::from_io(e, "Failed to create arena file"))?;
        let read_only = OpenOptions::new().read(true).open(&path);
        // The descriptors keep the storage alive once the name is gone
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("failed to unlink arena file {}: {}", path.display(), e);
        }
        let read_only =
            read_only.map_err(|e| XferError::from_io(e, "Failed to reopen arena file read-only"))?;
        file.set_len(size as u64)
            .map_err(|e| XferError::from_io(e, "Failed to set arena file size"))?;
        Ok((OwnedFd::from(file), OwnedFd::from(read_only)))
    }

    /// Take a free frame with one reference
    pub(crate) fn alloc_frame(self: &Arc<Self>) -> Result<FrameRef> {
        let index = match self.free.lock().pop() {
            Some(index) => index,
            None => {
                self.stats.record_allocation_failure();
                return Err(XferError::allocation_failure(format!(
                    "Arena '{}' has no free frame ({} in use)",
                    self.name,
                    self.slots.len()
                )));
            }
        };

        let slot = &self.slots[index as usize];
        let previous = slot.refs.swap(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "frame {} handed out while referenced", index);

        // Fresh frames never leak a previous transfer's bytes
        unsafe {
            ptr::write_bytes(self.frame_ptr(index), 0, self.frame_size);
        }

        if self.lock_frames {
            if let Err(e) = self.lock_frame(index) {
                slot.refs.store(0, Ordering::Release);
                self.free.lock().push(index);
                self.stats.record_allocation_failure();
                return Err(XferError::allocation_failure(format!(
                    "Failed to lock frame {}: {}",
                    index, e
                )));
            }
        }

        self.stats.record_allocation();
        Ok(FrameRef {
            arena: Arc::clone(self),
            index,
        })
    }

    /// Allocate a frame the producer can write into before enqueueing
    pub fn alloc_page(self: &Arc<Self>) -> Result<SharedPage> {
        Ok(SharedPage {
            frame: self.alloc_frame()?,
        })
    }

    /// Take an extra reference on the live frame containing `addr`
    ///
    /// Returns the reference together with the byte offset of `addr` inside
    /// the frame.
    pub(crate) fn pin_address(self: &Arc<Self>, addr: *const u8) -> Result<(FrameRef, usize)> {
        let base = self.map.as_ptr() as usize;
        let addr = addr as usize;
        if addr < base || addr >= base + self.map.len() {
            self.stats.record_pin_failure();
            return Err(XferError::pin_failure(format!(
                "Address {:#x} is not backed by arena '{}'",
                addr, self.name
            )));
        }

        let offset = addr - base;
        let index = (offset / self.frame_size) as u32;
        self.try_pin(index)?;
        Ok((
            FrameRef {
                arena: Arc::clone(self),
                index,
            },
            offset % self.frame_size,
        ))
    }

    fn try_pin(&self, index: u32) -> Result<()> {
        let slot = &self.slots[index as usize];
        let mut current = slot.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                self.stats.record_pin_failure();
                return Err(XferError::pin_failure(format!(
                    "Frame {} has already been released",
                    index
                )));
            }
            match slot.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.stats.record_pin();
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn put_frame(&self, index: u32) {
        let slot = &self.slots[index as usize];
        let previous = slot.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "frame {} reference underflow", index);
        if previous != 1 {
            return;
        }

        if self.lock_frames {
            if let Err(e) = self.unlock_frame(index) {
                warn!("failed to unlock frame {}: {}", index, e);
            }
        }
        self.free.lock().push(index);
        self.stats.record_release();
    }

    fn lock_frame(&self, index: u32) -> nix::Result<()> {
        unsafe {
            nix::sys::mman::mlock(
                self.frame_ptr(index) as *const libc::c_void,
                self.frame_size,
            )
        }
    }

    fn unlock_frame(&self, index: u32) -> nix::Result<()> {
        unsafe {
            nix::sys::mman::munlock(
                self.frame_ptr(index) as *const libc::c_void,
                self.frame_size,
            )
        }
    }

    fn frame_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.slots.len());
        unsafe { (self.map.as_ptr() as *mut u8).add(index as usize * self.frame_size) }
    }

    /// Map one frame read-only at a fresh address
    pub fn map_frame(&self, index: u32) -> Result<Mmap> {
        if index as usize >= self.slots.len() {
            return Err(XferError::invalid_parameter(
                "index",
                format!("Frame {} is outside arena '{}'", index, self.name),
            ));
        }
        unsafe {
            MmapOptions::new()
                .offset(self.file_offset(index))
                .len(self.frame_size)
                .map(&self.read_only_fd)
                .map_err(|e| XferError::map_failure(format!("Failed to map frame {}: {}", index, e)))
        }
    }

    /// Byte offset of a frame inside the backing file
    pub fn file_offset(&self, index: u32) -> u64 {
        index as u64 * self.frame_size as u64
    }

    /// Current reference count of a frame
    pub fn ref_count(&self, index: u32) -> u32 {
        self.slots
            .get(index as usize)
            .map(|slot| slot.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Borrow the read-only descriptor handed to consumers
    ///
    /// Mapping it writable fails with `EACCES`.
    pub fn consumer_fd(&self) -> BorrowedFd<'_> {
        self.read_only_fd.as_fd()
    }

    /// Get the arena name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of one frame in bytes
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of frames in the arena
    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of frames on the free list
    pub fn free_frames(&self) -> usize {
        self.free.lock().len()
    }

    /// Get usage statistics
    pub fn stats(&self) -> ArenaStats {
        self.stats.snapshot(self.slots.len(), self.free_frames())
    }
}

/// One counted reference to an arena frame
///
/// Dropping the last reference returns the frame to the free list.
#[derive(Debug)]
pub(crate) struct FrameRef {
    arena: Arc<FrameArena>,
    index: u32,
}

impl FrameRef {
    /// Take another reference on the same frame
    pub(crate) fn pin(&self) -> Result<FrameRef> {
        self.arena.try_pin(self.index)?;
        Ok(FrameRef {
            arena: Arc::clone(&self.arena),
            index: self.index,
        })
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Debug identifier; never zero so that zero can mean "no page"
    pub(crate) fn frame_id(&self) -> u64 {
        self.index as u64 + 1
    }

    pub(crate) fn arena(&self) -> &Arc<FrameArena> {
        &self.arena
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.arena.ref_count(self.index)
    }

    /// Borrow the whole frame; only for frames no one else writes
    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.arena.frame_ptr(self.index), self.arena.frame_size) }
    }

    /// Copy bytes out of the frame starting at `start`
    ///
    /// Goes through raw pointers only, so a producer writing the same frame
    /// never has its exclusive access aliased by a reference.
    pub(crate) fn copy_out(&self, start: usize, dst: &mut [u8]) -> usize {
        let size = self.arena.frame_size;
        if start >= size {
            return 0;
        }
        let n = dst.len().min(size - start);
        unsafe {
            ptr::copy_nonoverlapping(self.arena.frame_ptr(self.index).add(start), dst.as_mut_ptr(), n);
        }
        n
    }

    /// Copy `src` into the frame at `start`; the caller checks the bounds
    pub(crate) fn copy_in(&self, start: usize, src: &[u8]) {
        debug_assert!(start + src.len() <= self.arena.frame_size);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.arena.frame_ptr(self.index).add(start), src.len());
        }
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        self.arena.put_frame(self.index);
    }
}

/// A producer-owned frame, written in place and then enqueued without copying
///
/// Enqueueing pins the frame, so the page holds one reference of its own and
/// the queue holds another. Bytes written after the enqueue are visible to a
/// consumer that has the frame mapped. Writes are raw copies; the page never
/// hands out a mutable slice, since the queue may be reading the frame.
#[derive(Debug)]
pub struct SharedPage {
    frame: FrameRef,
}

impl SharedPage {
    /// Get the frame as a byte slice
    pub fn as_slice(&self) -> &[u8] {
        self.frame.bytes()
    }

    /// Write data at an offset inside the frame
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let capacity = self.len();
        if offset > capacity || data.len() > capacity - offset {
            return Err(XferError::invalid_parameter(
                "data",
                format!(
                    "{} bytes at offset {} do not fit a {}-byte frame",
                    data.len(),
                    offset,
                    capacity
                ),
            ));
        }
        self.frame.copy_in(offset, data);
        Ok(())
    }

    /// Size of the frame in bytes
    pub fn len(&self) -> usize {
        self.frame.arena().frame_size()
    }

    /// Frames are never zero-sized
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Debug identifier of the frame
    pub fn frame_id(&self) -> u64 {
        self.frame.frame_id()
    }

    /// Current reference count of the frame
    pub fn ref_count(&self) -> u32 {
        self.frame.ref_count()
    }
}

impl AsRef<[u8]> for SharedPage {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(frames: usize) -> Arc<FrameArena> {
        FrameArena::new(ArenaConfig::new("arena_test", frames)).unwrap()
    }

    #[test]
    fn test_alloc_and_release() {
        let arena = arena(2);
        assert_eq!(arena.free_frames(), 2);

        let frame = arena.alloc_frame().unwrap();
        assert_eq!(frame.index(), 0);
        assert_eq!(frame.frame_id(), 1);
        assert_eq!(frame.ref_count(), 1);
        assert_eq!(arena.free_frames(), 1);

        drop(frame);
        assert_eq!(arena.free_frames(), 2);
        assert_eq!(arena.ref_count(0), 0);
    }

    #[test]
    fn test_exhaustion() {
        let arena = arena(1);
        let _held = arena.alloc_frame().unwrap();
        let err = arena.alloc_frame().unwrap_err();
        assert!(matches!(err, XferError::AllocationFailure { .. }));
        assert_eq!(arena.stats().allocation_failures, 1);
    }

    #[test]
    fn test_pin_counts() {
        let arena = arena(1);
        let frame = arena.alloc_frame().unwrap();
        let pinned = frame.pin().unwrap();
        assert_eq!(arena.ref_count(0), 2);

        drop(frame);
        assert_eq!(arena.ref_count(0), 1);
        assert_eq!(arena.free_frames(), 0);

        drop(pinned);
        assert_eq!(arena.free_frames(), 1);
    }

    #[test]
    fn test_pin_address_inside_and_outside() {
        let arena = arena(2);
        let page = arena.alloc_page().unwrap();
        let addr = unsafe { page.as_slice().as_ptr().add(10) };

        let (frame, offset) = arena.pin_address(addr).unwrap();
        assert_eq!(offset, 10);
        assert_eq!(frame.frame_id(), page.frame_id());
        assert_eq!(page.ref_count(), 2);
        drop(frame);

        let outside = vec![0u8; 16];
        let err = arena.pin_address(outside.as_ptr()).unwrap_err();
        assert!(matches!(err, XferError::PinFailure { .. }));
    }

    #[test]
    fn test_pin_released_frame_fails() {
        let arena = arena(2);
        let page = arena.alloc_page().unwrap();
        let addr = page.as_slice().as_ptr();
        drop(page);

        let err = arena.pin_address(addr).unwrap_err();
        assert!(matches!(err, XferError::PinFailure { .. }));
        assert_eq!(arena.stats().pin_failures, 1);
    }

    #[test]
    fn test_map_frame_sees_writes() {
        let arena = arena(2);
        let mut page = arena.alloc_page().unwrap();
        page.write(0, b"through the memfd").unwrap();

        let index = (page.frame_id() - 1) as u32;
        let map = arena.map_frame(index).unwrap();
        assert_eq!(&map[..17], b"through the memfd");
    }

    #[test]
    fn test_shared_page_write_bounds() {
        let arena = arena(1);
        let mut page = arena.alloc_page().unwrap();
        let size = page.len();
        assert!(page.write(size - 2, b"ab").is_ok());
        assert!(page.write(size - 1, b"ab").is_err());
        assert!(page.write(size + 1, b"").is_err());
    }

    #[test]
    fn test_consumer_fd_is_read_only() {
        let arena = arena(2);
        let mut page = arena.alloc_page().unwrap();
        page.write(0, b"readable").unwrap();

        let fd = arena.consumer_fd();
        let map = unsafe {
            MmapOptions::new()
                .len(arena.frame_size())
                .map(&fd)
                .unwrap()
        };
        assert_eq!(&map[..8], b"readable");

        let err = unsafe {
            MmapOptions::new()
                .offset(arena.file_offset(1))
                .len(arena.frame_size())
                .map_mut(&fd)
                .unwrap_err()
        };
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn test_copy_out_bounds() {
        let arena = arena(1);
        let frame = arena.alloc_frame().unwrap();
        frame.copy_in(4, b"tail");

        let mut buf = [0u8; 8];
        assert_eq!(frame.copy_out(4, &mut buf[..4]), 4);
        assert_eq!(&buf[..4], b"tail");
        assert_eq!(frame.copy_out(arena.frame_size() - 2, &mut buf), 2);
        assert_eq!(frame.copy_out(arena.frame_size(), &mut buf), 0);
    }

    #[test]
    fn test_frames_are_zeroed_on_reuse() {
        let arena = arena(1);
        let mut page = arena.alloc_page().unwrap();
        page.write(0, b"secret").unwrap();
        drop(page);

        let page = arena.alloc_page().unwrap();
        assert!(page.as_slice()[..6].iter().all(|&b| b == 0));
    }
}
