use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagebridge::{
    memory::ArenaConfig, AcquireMode, ControlChannel, LocalChannel, SubsystemConfig, XferContext,
};

fn context(mode: AcquireMode, frames: usize) -> XferContext {
    let config = SubsystemConfig::default()
        .with_acquire_mode(mode)
        .with_max_items(frames)
        .with_arena(ArenaConfig::new("transfer_bench", frames));
    XferContext::init(config).unwrap()
}

fn benchmark_enqueue_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("TransferQueue_EnqueueRelease");

    for batch in [1usize, 16, 64].iter() {
        group.throughput(Throughput::Elements(*batch as u64));

        group.bench_with_input(BenchmarkId::new("zero_copy", batch), batch, |b, &batch| {
            let ctx = context(AcquireMode::ZeroCopy, batch * 2 + 1);
            let mut page = ctx.arena().alloc_page().unwrap();
            page.write(0, &[0xAB; 512]).unwrap();

            b.iter(|| {
                for i in 0..batch {
                    ctx.enqueue_write(i as i64, page.as_slice(), 512).unwrap();
                }
                for _ in 0..batch {
                    ctx.release_head();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("copy", batch), batch, |b, &batch| {
            let ctx = context(AcquireMode::Copy, batch * 2 + 1);
            let page = ctx.arena().alloc_page().unwrap();

            b.iter(|| {
                for i in 0..batch {
                    ctx.enqueue_write(i as i64, page.as_slice(), 512).unwrap();
                }
                for _ in 0..batch {
                    ctx.release_head();
                }
            });
        });
    }

    group.finish();
}

fn benchmark_map_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("Mapping");

    group.bench_function("map_inspect_unmap", |b| {
        let ctx = context(AcquireMode::ZeroCopy, 4);
        let mut page = ctx.arena().alloc_page().unwrap();
        page.write(0, b"benchmark payload").unwrap();
        ctx.enqueue_write(0, page.as_slice(), 17).unwrap();
        let mut channel = LocalChannel::open(&ctx);

        b.iter(|| {
            let region = channel.map_head(17).unwrap();
            let sum: u32 = region.as_slice().iter().map(|&b| b as u32).sum();
            drop(region);
            channel.unmap().unwrap();
            sum
        });
    });

    group.bench_function("control_get_info", |b| {
        let ctx = context(AcquireMode::Copy, 4);
        let page = ctx.arena().alloc_page().unwrap();
        ctx.enqueue_write(0, page.as_slice(), 64).unwrap();
        let mut channel = LocalChannel::open(&ctx);

        b.iter(|| channel.info().unwrap());
    });

    group.finish();
}

criterion_group!(benches, benchmark_enqueue_release, benchmark_map_head);
criterion_main!(benches);
