//! Bounded FIFO of transfer items behind a single lock
//!
//! The lock is held only while the sequence itself is touched. Pages removed
//! by a release are dropped after the lock is released, so returning a frame
//! to the arena never happens inside the queue's critical section.
//!
//! The notifier's eventfd is cleared under the lock whenever the queue runs
//! empty. Enqueue signals after it unlocks, so a non-empty queue always leaves
//! the eventfd readable.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Result, XferError};
use crate::protocol::XferInfo;
use crate::sync::ReadinessNotifier;

use super::{
    item::TransferItem,
    stats::{AtomicQueueStats, QueueStats},
};

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<TransferItem>,
    next_seq: u64,
    closed: bool,
}

/// Ordered collection of transfer items owned by the subsystem
#[derive(Debug)]
pub struct TransferQueue {
    inner: Mutex<QueueInner>,
    max_depth: usize,
    notifier: Arc<ReadinessNotifier>,
    stats: AtomicQueueStats,
}

impl TransferQueue {
    /// Create a queue holding at most `max_depth` items
    pub fn new(max_depth: usize, notifier: Arc<ReadinessNotifier>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(max_depth.min(1024)),
                next_seq: 1,
                closed: false,
            }),
            max_depth,
            notifier,
            stats: AtomicQueueStats::default(),
        }
    }

    /// Append an item and wake readers
    ///
    /// On success the queue owns the item's page and the item's sequence
    /// number is returned. A full or closed queue rejects the item and its
    /// page reference is dropped.
    pub fn enqueue(&self, mut item: TransferItem) -> Result<u64> {
        let seq = {
            let mut inner = self.inner.lock();
            if inner.closed {
                drop(inner);
                self.stats.record_rejection();
                return Err(XferError::channel_closed("Transfer queue is closed"));
            }
            if inner.items.len() >= self.max_depth {
                drop(inner);
                self.stats.record_rejection();
                return Err(XferError::queue_full(self.max_depth));
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            item.set_seq(seq);
            if let Some(page) = item.page_mut() {
                page.enter_queue();
            }
            debug!(
                "enqueued item {} (offset {}, size {}, frame {})",
                seq,
                item.offset(),
                item.size(),
                item.frame_id()
            );
            inner.items.push_back(item);
            self.stats.record_enqueue(inner.items.len());
            seq
        };

        if let Err(e) = self.notifier.notify() {
            warn!("failed to signal readiness for item {}: {}", seq, e);
        }
        Ok(seq)
    }

    /// Number of queued items
    pub fn count(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// View of the head item without removing it
    pub fn peek_head(&self) -> Option<XferInfo> {
        self.inner.lock().items.front().map(TransferItem::view)
    }

    /// Run `f` against the head item while holding the queue lock
    ///
    /// `f` must not block.
    pub fn with_head<R>(&self, f: impl FnOnce(&TransferItem) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.items.front().map(f)
    }

    /// Remove and drop the head item; a no-op on an empty queue
    ///
    /// Returns the view of the removed item. A page still lent to a mapping
    /// keeps the lease's reference and is freed only when the mapping ends.
    pub fn release_head(&self) -> Option<XferInfo> {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.items.pop_front();
            if removed.is_some() && inner.items.is_empty() {
                self.notifier.clear_pending();
            }
            removed
        };
        match removed {
            Some(item) => {
                let info = item.view();
                debug!("released item {} (frame {})", item.seq(), info.frame_id);
                self.stats.record_release();
                // Page reference dropped here, outside the lock
                drop(item);
                Some(info)
            }
            None => {
                self.stats.record_empty_release();
                None
            }
        }
    }

    /// Refuse further items and drop every queued one, returning how many
    /// there were
    ///
    /// Items are released while the lock is held so none can be observed
    /// half-drained, and no enqueue can slip in after the drain.
    pub fn close(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let count = inner.items.len();
        inner.items.clear();
        self.notifier.clear_pending();
        drop(inner);
        self.stats.record_drain(count);
        count
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Maximum number of items the queue tracks
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        self.stats.snapshot(self.count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        AcquireMode, ArenaConfig, FrameArena, OwnershipState, PageAcquirer, PageAligned,
    };
    use std::time::Duration;

    fn setup(frames: usize, depth: usize) -> (Arc<FrameArena>, PageAcquirer, TransferQueue) {
        let arena = FrameArena::new(ArenaConfig::new("queue_test", frames)).unwrap();
        let acquirer = PageAcquirer::new(Arc::clone(&arena), AcquireMode::Copy);
        let notifier = Arc::new(ReadinessNotifier::new().unwrap());
        (arena, acquirer, TransferQueue::new(depth, notifier))
    }

    fn item(acquirer: &PageAcquirer, offset: i64, data: &[u8]) -> TransferItem {
        let staged = PageAligned::new(data);
        let (page, size) = acquirer.acquire(staged.as_slice(), data.len()).unwrap();
        TransferItem::with_page(page, offset, size)
    }

    #[test]
    fn test_fifo_order() {
        let (_arena, acquirer, queue) = setup(4, 8);
        for (i, data) in [b"a", b"b", b"c"].iter().enumerate() {
            queue.enqueue(item(&acquirer, i as i64, *data)).unwrap();
        }

        let mut offsets = Vec::new();
        while let Some(info) = queue.release_head() {
            offsets.push(info.offset);
        }
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[test]
    fn test_enqueue_takes_ownership() {
        let (_arena, acquirer, queue) = setup(1, 8);
        queue.enqueue(item(&acquirer, 0, b"owned")).unwrap();
        let state = queue.with_head(|item| item.page().map(|p| p.ownership()));
        assert_eq!(state, Some(Some(OwnershipState::QueueOwned)));
    }

    #[test]
    fn test_release_frees_page_once() {
        let (arena, acquirer, queue) = setup(1, 8);
        queue.enqueue(item(&acquirer, 0, b"once")).unwrap();
        assert_eq!(arena.free_frames(), 0);

        assert!(queue.release_head().is_some());
        assert_eq!(arena.free_frames(), 1);

        assert!(queue.release_head().is_none());
        assert_eq!(arena.free_frames(), 1);
        assert_eq!(queue.stats().empty_releases, 1);
    }

    #[test]
    fn test_queue_full_drops_rejected_page() {
        let (arena, acquirer, queue) = setup(2, 1);
        queue.enqueue(item(&acquirer, 0, b"first")).unwrap();

        let err = queue.enqueue(item(&acquirer, 1, b"second")).unwrap_err();
        assert!(matches!(err, XferError::QueueFull { depth: 1 }));
        assert_eq!(queue.count(), 1);
        assert_eq!(arena.free_frames(), 1);
    }

    #[test]
    fn test_empty_item_flows_through() {
        let (_arena, _acquirer, queue) = setup(1, 8);
        queue.enqueue(TransferItem::empty(7)).unwrap();

        let info = queue.peek_head().unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(info.frame_id, 0);
        assert_eq!(info.offset, 7);
        assert!(queue.release_head().is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_notifies() {
        let notifier = Arc::new(ReadinessNotifier::new().unwrap());
        let queue = TransferQueue::new(4, Arc::clone(&notifier));
        let seen = notifier.generation();
        queue.enqueue(TransferItem::empty(0)).unwrap();
        assert!(notifier.wait_past(seen, Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_close_releases_everything() {
        let (arena, acquirer, queue) = setup(3, 8);
        for i in 0..3 {
            queue.enqueue(item(&acquirer, i, b"x")).unwrap();
        }
        assert_eq!(queue.close(), 3);
        assert!(queue.is_closed());
        assert_eq!(arena.free_frames(), 3);
        assert_eq!(queue.stats().drained, 3);
    }

    #[test]
    fn test_closed_queue_rejects_items() {
        let (arena, acquirer, queue) = setup(2, 8);
        queue.close();

        let err = queue.enqueue(item(&acquirer, 0, b"late")).unwrap_err();
        assert!(matches!(err, XferError::ChannelClosed { .. }));
        assert_eq!(queue.count(), 0);
        assert_eq!(arena.free_frames(), 2);
        assert_eq!(queue.stats().rejected, 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_eventfd_tracks_non_empty_queue() {
        use nix::poll::{poll, PollFd, PollFlags};

        let notifier = Arc::new(ReadinessNotifier::new().unwrap());
        let queue = TransferQueue::new(4, Arc::clone(&notifier));
        let readable = || {
            let fd = notifier.event_fd();
            let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
            poll(&mut fds, 0).unwrap() == 1
        };
        assert!(!readable());

        queue.enqueue(TransferItem::empty(0)).unwrap();
        queue.enqueue(TransferItem::empty(1)).unwrap();
        assert!(readable());

        // Still pending after the first release
        queue.release_head().unwrap();
        assert!(readable());

        queue.release_head().unwrap();
        assert_eq!(queue.count(), 0);
        assert!(!readable());

        // An empty release leaves it cleared
        assert!(queue.release_head().is_none());
        assert!(!readable());

        queue.enqueue(TransferItem::empty(2)).unwrap();
        assert!(readable());
        queue.close();
        assert!(!readable());
    }
}
