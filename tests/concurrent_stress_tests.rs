//! Concurrent stress tests for many producers against one consumer
//! Tests focused on exactly-once delivery, ordering and wakeups under contention

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
    time::{Duration, Instant},
};

use pagebridge::{memory::ArenaConfig, AcquireMode, SubsystemConfig, XferContext, XferError};

fn shared_context(mode: AcquireMode, max_items: usize, frames: usize) -> Arc<XferContext> {
    let config = SubsystemConfig::default()
        .with_acquire_mode(mode)
        .with_max_items(max_items)
        .with_arena(ArenaConfig::new("stress_tests", frames));
    Arc::new(XferContext::init(config).unwrap())
}

fn tag(producer: u32, seq: u32) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&producer.to_le_bytes());
    bytes[4..].copy_from_slice(&seq.to_le_bytes());
    bytes
}

fn untag(bytes: &[u8; 8]) -> (u32, u32) {
    let mut producer = [0u8; 4];
    let mut seq = [0u8; 4];
    producer.copy_from_slice(&bytes[..4]);
    seq.copy_from_slice(&bytes[4..]);
    (u32::from_le_bytes(producer), u32::from_le_bytes(seq))
}

/// Retry a write until the queue and arena have room
fn enqueue_retrying(ctx: &XferContext, offset: i64, source: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match ctx.enqueue_write(offset, source, source.len()) {
            Ok(_) => return,
            Err(XferError::QueueFull { .. }) | Err(XferError::AllocationFailure { .. }) => {
                assert!(Instant::now() < deadline, "producer starved");
                thread::yield_now();
            }
            Err(e) => panic!("unexpected write failure: {}", e),
        }
    }
}

#[cfg(test)]
mod concurrent_stress_tests {
    use super::*;

    fn run_producers_single_consumer(mode: AcquireMode) {
        const PRODUCERS: u32 = 4;
        const WRITES: u32 = 200;

        let ctx = shared_context(mode, 16, 64);
        let barrier = Arc::new(Barrier::new(PRODUCERS as usize + 1));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let ctx = Arc::clone(&ctx);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for seq in 0..WRITES {
                        // Each zero-copy write needs its own frame
                        let mut page = ctx.arena().alloc_page().unwrap_or_else(|_| loop {
                            thread::yield_now();
                            if let Ok(page) = ctx.arena().alloc_page() {
                                break page;
                            }
                        });
                        page.write(0, &tag(producer, seq)).unwrap();
                        enqueue_retrying(&ctx, (producer * WRITES + seq) as i64, &page.as_slice()[..8]);
                    }
                })
            })
            .collect();

        barrier.wait();
        let total = (PRODUCERS * WRITES) as usize;
        let mut seen = HashSet::new();
        let mut last_seq = vec![None::<u32>; PRODUCERS as usize];
        let deadline = Instant::now() + Duration::from_secs(60);

        while seen.len() < total {
            assert!(Instant::now() < deadline, "consumer timed out");
            if !ctx.wait_readable(Duration::from_millis(50)) {
                continue;
            }

            let mut buf = [0u8; 8];
            assert_eq!(ctx.read_head(0, &mut buf).unwrap(), 8);
            let (producer, seq) = untag(&buf);

            // Items from one producer keep their order
            if let Some(previous) = last_seq[producer as usize] {
                assert!(seq > previous, "producer {} reordered: {} after {}", producer, seq, previous);
            }
            last_seq[producer as usize] = Some(seq);
            assert!(seen.insert((producer, seq)), "duplicate item {:?}", (producer, seq));

            assert!(ctx.release_head().is_some());
        }

        for handle in producers {
            handle.join().unwrap();
        }

        assert_eq!(ctx.count(), 0);
        let stats = ctx.queue_stats();
        assert_eq!(stats.enqueued, total as u64);
        assert_eq!(stats.released, total as u64);
        assert!(stats.peak_depth <= 16);
        assert_eq!(ctx.arena().free_frames(), ctx.arena().frame_count());
    }

    #[test]
    fn stress_zero_copy_exactly_once() {
        run_producers_single_consumer(AcquireMode::ZeroCopy);
    }

    #[test]
    fn stress_copy_mode_exactly_once() {
        run_producers_single_consumer(AcquireMode::Copy);
    }

    /// Every waiter blocked on an empty queue is woken by one enqueue
    #[test]
    fn stress_all_waiters_wake() {
        const WAITERS: usize = 6;

        let ctx = shared_context(AcquireMode::Copy, 4, 8);
        let woken = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(WAITERS + 1));

        let waiters: Vec<_> = (0..WAITERS)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                let woken = Arc::clone(&woken);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    if ctx.wait_readable(Duration::from_secs(10)) {
                        woken.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        let page = ctx.arena().alloc_page().unwrap();
        ctx.enqueue_write(0, page.as_slice(), 8).unwrap();

        for handle in waiters {
            handle.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
    }

    /// Teardown wakes consumers blocked on an empty queue
    #[test]
    fn stress_teardown_unblocks_waiters() {
        let ctx = shared_context(AcquireMode::Copy, 4, 4);
        let waiter = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                let start = Instant::now();
                let readable = ctx.wait_readable(Duration::from_secs(10));
                (readable, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        ctx.teardown();

        let (readable, elapsed) = waiter.join().unwrap();
        assert!(!readable);
        assert!(elapsed < Duration::from_secs(5));
    }

    /// Writes racing teardown either land before the drain or are refused
    #[test]
    fn stress_writes_racing_teardown_leave_nothing_pinned() {
        const PRODUCERS: usize = 4;

        let ctx = shared_context(AcquireMode::Copy, 64, 128);
        let barrier = Arc::new(Barrier::new(PRODUCERS + 1));
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let ctx = Arc::clone(&ctx);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let source = [producer as u8; 32];
                    barrier.wait();
                    loop {
                        match ctx.enqueue_write(0, &source, source.len()) {
                            Ok(_) => {}
                            Err(XferError::ChannelClosed { .. }) => return,
                            Err(XferError::QueueFull { .. }) | Err(XferError::AllocationFailure { .. }) => {
                                thread::yield_now();
                            }
                            Err(e) => panic!("unexpected write failure: {}", e),
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        ctx.teardown();

        for handle in producers {
            handle.join().unwrap();
        }
        assert_eq!(ctx.count(), 0);
        assert_eq!(ctx.arena().free_frames(), ctx.arena().frame_count());
    }

    /// A producer rewriting a queued page while the consumer copies it out
    #[test]
    fn stress_rewrite_queued_page_during_reads() {
        let ctx = shared_context(AcquireMode::ZeroCopy, 4, 4);
        let mut page = ctx.arena().alloc_page().unwrap();
        page.write(0, &[0u8; 64]).unwrap();
        ctx.enqueue_write(0, page.as_slice(), 64).unwrap();

        let writer = thread::spawn(move || {
            for round in 1..=200u8 {
                page.write(0, &[round; 64]).unwrap();
            }
            page
        });

        let mut buf = [0u8; 64];
        for _ in 0..200 {
            assert_eq!(ctx.read_head(0, &mut buf).unwrap(), 64);
            assert!(buf.iter().all(|&b| b <= 200));
        }

        let page = writer.join().unwrap();
        assert_eq!(ctx.read_head(0, &mut buf).unwrap(), 64);
        assert_eq!(buf, [200u8; 64]);
        assert_eq!(page.ref_count(), 2);
    }

    /// Concurrent releases never remove more items than were queued
    #[test]
    fn stress_concurrent_releases() {
        const ITEMS: usize = 32;
        const RELEASERS: usize = 4;

        let ctx = shared_context(AcquireMode::Copy, ITEMS, ITEMS + 2);
        let page = ctx.arena().alloc_page().unwrap();
        for i in 0..ITEMS {
            ctx.enqueue_write(i as i64, page.as_slice(), 16).unwrap();
        }

        let released = Arc::new(AtomicUsize::new(0));
        let releasers: Vec<_> = (0..RELEASERS)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                let released = Arc::clone(&released);
                thread::spawn(move || {
                    for _ in 0..ITEMS {
                        if ctx.release_head().is_some() {
                            released.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in releasers {
            handle.join().unwrap();
        }

        assert_eq!(released.load(Ordering::SeqCst), ITEMS);
        assert_eq!(ctx.count(), 0);
        assert_eq!(ctx.queue_stats().empty_releases, (ITEMS * RELEASERS - ITEMS) as u64);
    }
}
