//! The subsystem context: one queue, one mapping slot, one notifier
//!
//! Lock order is mapping lock, then queue lock. The queue lock is only ever
//! held for list manipulation; the mapping lock may be held while a mapping
//! is established.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{Result, XferError};
use crate::mapping::{MappedRegion, MappingSlot, SessionId};
use crate::memory::{page_size, AcquireMode, ArenaStats, FrameArena, PageAcquirer};
use crate::protocol::{ControlOp, ControlReply, MapGrant, XferInfo};
use crate::queue::{QueueStats, TransferItem, TransferQueue};
use crate::sync::ReadinessNotifier;

use super::{
    config::SubsystemConfig,
    stats::{ErrorCounters, ErrorStats},
};

/// What teardown found and released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Items still queued at teardown
    pub drained_items: usize,
    /// Whether a mapping was still live
    pub dropped_mapping: bool,
    pub errors: ErrorStats,
}

/// Process-wide transfer state, created once and passed by reference
#[derive(Debug)]
pub struct XferContext {
    config: SubsystemConfig,
    arena: Arc<FrameArena>,
    acquirer: PageAcquirer,
    notifier: Arc<ReadinessNotifier>,
    queue: TransferQueue,
    mapping: Mutex<MappingSlot>,
    errors: ErrorCounters,
    next_session: AtomicU64,
    torn_down: AtomicBool,
}

impl XferContext {
    /// Initialise the subsystem
    pub fn init(config: SubsystemConfig) -> Result<Self> {
        config.validate()?;

        let arena = FrameArena::new(config.arena.clone())?;
        let acquirer = PageAcquirer::new(Arc::clone(&arena), config.acquire_mode);
        let notifier = Arc::new(ReadinessNotifier::new()?);
        let queue = TransferQueue::new(config.max_items, Arc::clone(&notifier));

        info!(
            "transfer subsystem initialised: {} mode, {} max items, {} frames of {} bytes",
            config.acquire_mode.name(),
            config.max_items,
            arena.frame_count(),
            arena.frame_size()
        );

        Ok(Self {
            config,
            arena,
            acquirer,
            notifier,
            queue,
            mapping: Mutex::new(MappingSlot::default()),
            errors: ErrorCounters::default(),
            next_session: AtomicU64::new(1),
            torn_down: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(XferError::channel_closed("Transfer subsystem has been torn down"));
        }
        Ok(())
    }

    /// Turn a producer write into a queued transfer item
    ///
    /// Returns the number of bytes accepted, which may be smaller than `len`
    /// when the write would cross a page. A zero-length write queues an empty
    /// item and returns 0.
    pub fn enqueue_write(&self, offset: i64, buf: &[u8], len: usize) -> Result<usize> {
        self.ensure_live()?;

        let (item, size) = if len == 0 {
            (TransferItem::empty(offset), 0)
        } else {
            let (page, size) = self.acquirer.acquire(buf, len).map_err(|e| {
                self.errors.record_write();
                e
            })?;
            (TransferItem::with_page(page, offset, size), size)
        };

        self.queue.enqueue(item).map_err(|e| {
            self.errors.record_write();
            warn!("write at offset {} rejected: {}", offset, e);
            e
        })?;
        Ok(size)
    }

    /// Copy bytes of the head item starting at `pos`
    ///
    /// Returns 0 when the queue is empty, the head item is empty, or `pos`
    /// is past its end.
    pub fn read_head(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_live().map_err(|e| {
            self.errors.record_read();
            e
        })?;

        let copied = self.queue.with_head(|item| {
            let size = item.size();
            match item.page() {
                Some(page) if pos < size => {
                    let n = buf.len().min((size - pos) as usize);
                    page.read_into(pos as usize, &mut buf[..n])
                }
                _ => 0,
            }
        });
        Ok(copied.unwrap_or(0))
    }

    /// Execute one control operation
    pub fn control(&self, op: ControlOp) -> Result<ControlReply> {
        match op {
            ControlOp::GetCount => Ok(ControlReply::Count(self.count() as u64)),
            ControlOp::GetInfo => self.peek_info().map(ControlReply::Info),
            ControlOp::ReleaseHead => {
                self.release_head();
                Ok(ControlReply::Released)
            }
        }
    }

    /// Current queue depth
    pub fn count(&self) -> usize {
        self.queue.count()
    }

    /// Metadata of the head item
    pub fn peek_info(&self) -> Result<XferInfo> {
        self.queue.peek_head().ok_or(XferError::NoItem)
    }

    /// Remove the head item; a no-op on an empty queue
    pub fn release_head(&self) -> Option<XferInfo> {
        self.queue.release_head()
    }

    /// Open a session for a new control channel
    pub fn open_session(&self) -> SessionId {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        debug!("{} opened", id);
        id
    }

    /// Close a session, unpinning its mapping if it never unmapped
    pub fn close_session(&self, session: SessionId) {
        if let Some(active) = self.mapping.lock().clear_for(session) {
            debug!(
                "{} closed with mapping {} of frame {} still live",
                session,
                active.generation,
                active.frame_id()
            );
        } else {
            debug!("{} closed", session);
        }
    }

    fn check_map_length(&self, length: usize) -> Result<()> {
        let page = page_size();
        if length == 0 || length > page {
            self.errors.record_mapping();
            return Err(XferError::invalid_size(length, page));
        }
        Ok(())
    }

    /// Map the head item read-only into this process
    ///
    /// The returned region shares the mapping's page reference, so the page
    /// stays valid for as long as the region lives even if the item is
    /// released meanwhile. An empty head item yields an empty region.
    pub fn map_head(&self, session: SessionId, length: usize) -> Result<MappedRegion> {
        self.ensure_live()?;
        self.check_map_length(length)?;

        let mut slot = self.mapping.lock();
        let (lease, info) = self.lend_head()?;
        let lease = match lease {
            Some(lease) => Arc::new(lease),
            None => {
                debug!("{} mapped an empty item", session);
                return Ok(MappedRegion::empty());
            }
        };

        let map = lease.map().map_err(|e| {
            self.errors.record_mapping();
            warn!("{} failed to map frame {}: {}", session, info.frame_id, e);
            e
        })?;

        let len = length.min(info.size as usize);
        let generation = slot.install(session, Arc::clone(&lease));
        debug!(
            "{} mapped frame {} ({} bytes, generation {})",
            session, info.frame_id, len, generation
        );
        Ok(MappedRegion::from_lease(map, lease, len, generation))
    }

    /// Pin the head item for a consumer in another process
    ///
    /// The consumer maps the page itself from the arena descriptor using
    /// the returned grant.
    pub fn grant_head(&self, session: SessionId, length: usize) -> Result<MapGrant> {
        self.ensure_live()?;
        self.check_map_length(length)?;

        let mut slot = self.mapping.lock();
        let (lease, info) = self.lend_head()?;
        let lease = match lease {
            Some(lease) => lease,
            None => return Ok(MapGrant::empty()),
        };

        let grant = MapGrant {
            frame_id: lease.frame_id(),
            file_offset: lease.file_offset(),
            data_offset: lease.data_offset() as u64,
            len: length.min(info.size as usize) as u64,
            generation: 0,
        };
        let generation = slot.install(session, Arc::new(lease));
        debug!(
            "{} granted frame {} ({} bytes, generation {})",
            session, grant.frame_id, grant.len, generation
        );
        Ok(MapGrant { generation, ..grant })
    }

    fn lend_head(&self) -> Result<(Option<crate::memory::PageLease>, XferInfo)> {
        let lent = self.queue.with_head(|item| match item.page() {
            Some(page) => page.lend().map(|lease| (Some(lease), item.view())),
            None => Ok((None, item.view())),
        });
        match lent {
            Some(result) => result.map_err(|e| {
                self.errors.record_mapping();
                e
            }),
            None => Err(XferError::NoItem),
        }
    }

    /// Drop the mapping owned by `session`; returns whether one existed
    pub fn unmap(&self, session: SessionId) -> bool {
        let cleared = self.mapping.lock().clear_for(session);
        if let Some(active) = &cleared {
            debug!("{} unmapped generation {}", session, active.generation);
        }
        cleared.is_some()
    }

    /// Wait until the queue is non-empty, up to `timeout`
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.notifier.generation();
            if self.count() > 0 {
                return true;
            }
            if self.torn_down.load(Ordering::Acquire) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.notifier.wait_past(seen, Some(remaining)) {
                return self.count() > 0;
            }
        }
    }

    /// Record a failed control request (undecodable, undeliverable)
    pub fn record_control_error(&self) {
        self.errors.record_control();
    }

    /// Record a failed read request
    pub fn record_read_error(&self) {
        self.errors.record_read();
    }

    /// Drain the queue and drop any live mapping
    ///
    /// Only the first call does any work.
    pub fn teardown(&self) -> TeardownReport {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return TeardownReport {
                drained_items: 0,
                dropped_mapping: false,
                errors: self.errors.snapshot(),
            };
        }

        let mut slot = self.mapping.lock();
        let dropped_mapping = slot.clear().is_some();
        let drained_items = self.queue.close();
        drop(slot);
        // Wake anyone blocked in wait_readable
        if let Err(e) = self.notifier.notify() {
            warn!("failed to wake waiters on teardown: {}", e);
        }

        let errors = self.errors.snapshot();
        info!(
            "transfer subsystem torn down: {} items drained, mapping dropped: {}, \
             errors read={} write={} control={} mapping={}",
            drained_items,
            dropped_mapping,
            errors.read_errors,
            errors.write_errors,
            errors.control_errors,
            errors.mapping_errors
        );

        TeardownReport {
            drained_items,
            dropped_mapping,
            errors,
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn error_stats(&self) -> ErrorStats {
        self.errors.snapshot()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    /// The frame arena pages are drawn from
    pub fn arena(&self) -> &Arc<FrameArena> {
        &self.arena
    }

    pub fn notifier(&self) -> &Arc<ReadinessNotifier> {
        &self.notifier
    }

    pub fn acquire_mode(&self) -> AcquireMode {
        self.config.acquire_mode
    }

    pub fn config(&self) -> &SubsystemConfig {
        &self.config
    }

    /// Generation of the live mapping, if any
    pub fn active_mapping(&self) -> Option<(SessionId, u64)> {
        self.mapping
            .lock()
            .active()
            .map(|active| (active.session, active.generation))
    }
}

impl Drop for XferContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
