//! Integration tests for the producer side: acquisition, ordering, backpressure

use pagebridge::{
    memory::{page_size, ArenaConfig},
    AcquireMode, SubsystemConfig, XferContext, XferError,
};

fn context(mode: AcquireMode, max_items: usize, frames: usize) -> XferContext {
    let config = SubsystemConfig::default()
        .with_acquire_mode(mode)
        .with_max_items(max_items)
        .with_arena(ArenaConfig::new("queue_tests", frames));
    XferContext::init(config).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_leave_in_write_order() {
        let ctx = context(AcquireMode::ZeroCopy, 8, 8);
        let mut pages = Vec::new();
        for i in 0..5u8 {
            let mut page = ctx.arena().alloc_page().unwrap();
            page.write(0, &[i; 16]).unwrap();
            ctx.enqueue_write(i as i64 * 100, page.as_slice(), 16).unwrap();
            pages.push(page);
        }

        assert_eq!(ctx.count(), 5);
        for i in 0..5u8 {
            let info = ctx.peek_info().unwrap();
            assert_eq!(info.offset, i as i64 * 100);
            assert_eq!(info.size, 16);

            let mut buf = [0u8; 16];
            assert_eq!(ctx.read_head(0, &mut buf).unwrap(), 16);
            assert_eq!(buf, [i; 16]);
            ctx.release_head();
        }
        assert_eq!(ctx.count(), 0);
    }

    #[test]
    fn test_zero_copy_shares_the_page() {
        let ctx = context(AcquireMode::ZeroCopy, 4, 4);
        let mut page = ctx.arena().alloc_page().unwrap();
        page.write(0, b"before").unwrap();
        ctx.enqueue_write(0, page.as_slice(), 6).unwrap();
        assert_eq!(page.ref_count(), 2);

        // Same frame, so later writes by the producer are visible
        page.write(0, b"after!").unwrap();
        let mut buf = [0u8; 6];
        ctx.read_head(0, &mut buf).unwrap();
        assert_eq!(&buf, b"after!");
        assert_eq!(ctx.peek_info().unwrap().frame_id, page.frame_id());

        ctx.release_head();
        assert_eq!(page.ref_count(), 1);
    }

    #[test]
    fn test_copy_mode_snapshots_the_data() {
        let ctx = context(AcquireMode::Copy, 4, 4);
        let mut page = ctx.arena().alloc_page().unwrap();
        page.write(0, b"before").unwrap();
        ctx.enqueue_write(0, page.as_slice(), 6).unwrap();

        page.write(0, b"after!").unwrap();
        let mut buf = [0u8; 6];
        ctx.read_head(0, &mut buf).unwrap();
        assert_eq!(&buf, b"before");
        assert_ne!(ctx.peek_info().unwrap().frame_id, page.frame_id());
        assert_eq!(page.ref_count(), 1);
    }

    #[test]
    fn test_full_queue_rejects_without_side_effects() {
        let ctx = context(AcquireMode::Copy, 2, 8);
        let page = ctx.arena().alloc_page().unwrap();
        ctx.enqueue_write(0, page.as_slice(), 8).unwrap();
        ctx.enqueue_write(8, page.as_slice(), 8).unwrap();
        let free_before = ctx.arena().free_frames();

        let err = ctx.enqueue_write(16, page.as_slice(), 8).unwrap_err();
        assert!(matches!(err, XferError::QueueFull { depth: 2 }));
        assert_eq!(ctx.count(), 2);
        assert_eq!(ctx.arena().free_frames(), free_before);
        assert_eq!(ctx.queue_stats().rejected, 1);
        assert_eq!(ctx.error_stats().write_errors, 1);
    }

    #[test]
    fn test_pin_failure_leaves_queue_unchanged() {
        let ctx = context(AcquireMode::ZeroCopy, 4, 4);
        let outside = vec![7u8; 64];

        let err = ctx.enqueue_write(0, &outside, 64).unwrap_err();
        assert!(matches!(err, XferError::PinFailure { .. }));
        assert_eq!(ctx.count(), 0);
        assert_eq!(ctx.error_stats().write_errors, 1);
    }

    #[test]
    fn test_write_clamped_to_page_boundary() {
        let ctx = context(AcquireMode::ZeroCopy, 4, 4);
        let mut page = ctx.arena().alloc_page().unwrap();
        page.write(page_size() - 10, &[1u8; 10]).unwrap();

        let source = &page.as_slice()[page_size() - 10..];
        let accepted = ctx.enqueue_write(0, source, 10).unwrap();
        assert_eq!(accepted, 10);

        // Asking for more than remains in the page yields a short write
        let tail = &page.as_slice()[page_size() - 4..];
        let accepted = ctx.enqueue_write(10, tail, 10).unwrap();
        assert_eq!(accepted, 4);
        assert_eq!(ctx.count(), 2);

        ctx.release_head();
        let info = ctx.peek_info().unwrap();
        assert_eq!(info.size, 4);
    }

    #[test]
    fn test_zero_length_write_queues_empty_item() {
        let ctx = context(AcquireMode::ZeroCopy, 4, 4);
        assert_eq!(ctx.enqueue_write(42, &[], 0).unwrap(), 0);

        let info = ctx.peek_info().unwrap();
        assert!(info.is_empty());
        assert_eq!(info.offset, 42);
        assert_eq!(info.frame_id, 0);

        let mut buf = [0u8; 4];
        assert_eq!(ctx.read_head(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_release_on_empty_queue_is_noop() {
        let ctx = context(AcquireMode::Copy, 4, 4);
        assert!(ctx.release_head().is_none());
        assert!(ctx.release_head().is_none());
        assert_eq!(ctx.count(), 0);
        assert_eq!(ctx.queue_stats().empty_releases, 2);
        assert!(matches!(ctx.peek_info(), Err(XferError::NoItem)));
    }

    #[test]
    fn test_released_frames_return_to_arena() {
        let ctx = context(AcquireMode::Copy, 4, 4);
        let page = ctx.arena().alloc_page().unwrap();
        let free = ctx.arena().free_frames();

        ctx.enqueue_write(0, page.as_slice(), 32).unwrap();
        assert_eq!(ctx.arena().free_frames(), free - 1);
        ctx.release_head();
        assert_eq!(ctx.arena().free_frames(), free);
    }

    #[test]
    fn test_teardown_drains_and_refuses_writes() {
        let ctx = context(AcquireMode::Copy, 4, 4);
        let page = ctx.arena().alloc_page().unwrap();
        ctx.enqueue_write(0, page.as_slice(), 32).unwrap();
        ctx.enqueue_write(32, page.as_slice(), 32).unwrap();

        let report = ctx.teardown();
        assert_eq!(report.drained_items, 2);
        assert_eq!(ctx.count(), 0);
        assert!(ctx.enqueue_write(64, page.as_slice(), 32).is_err());

        // Only the first teardown does anything
        assert_eq!(ctx.teardown().drained_items, 0);
    }
}
