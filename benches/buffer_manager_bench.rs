// Buffer manager performance benchmarks: allocate/resolve throughput and
// eviction under load.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;
use vmcache::buffer::dtr::NullRegistry;
use vmcache::{BufferManager, BufferManagerConfig, ExclusiveGuard};

/// `NullRegistry` never reports a parent, so the background page providers
/// can never find one for a hot frame and so never cool it back to the free
/// list. These benchmarks therefore reclaim each allocated frame by hand
/// right after using it, rather than relying on eviction — otherwise
/// repeated `allocate_page` calls would exhaust a bench-sized DRAM pool
/// within a single criterion sample.
fn allocate_write_and_reclaim(manager: &BufferManager, byte: u8) {
    let mut page = manager.allocate_page();
    page.payload_mut()[0] = black_box(byte);
    let frame_id = page.frame_id();
    page.finish();
    let guard = ExclusiveGuard::acquire(&manager.frame(frame_id).latch);
    manager.reclaim_page(frame_id, guard);
}

fn create_manager(dram_gib: f64, partition_bits: u32) -> (Arc<BufferManager>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("bench.db");
    let config = BufferManagerConfig::builder()
        .device_path(db_path.to_str().unwrap().to_string())
        .dram_gib(dram_gib)
        .partition_bits(partition_bits)
        .pp_threads(1usize << partition_bits.min(2))
        .free_pct(10.0)
        .cool_pct(20.0)
        .build();
    let manager = BufferManager::new(config, Arc::new(NullRegistry)).unwrap();
    (Arc::new(manager), temp_dir)
}

fn bench_allocate_page(c: &mut Criterion) {
    let (manager, _temp) = create_manager(0.01, 4);

    c.bench_function("allocate_page", |b| {
        b.iter(|| allocate_write_and_reclaim(&manager, 7));
    });
}

fn bench_resolve_hot_swip(c: &mut Criterion) {
    use vmcache::Swip;

    let (manager, _temp) = create_manager(0.01, 1);
    let mut page = manager.allocate_page();
    let frame_id = page.frame_id();
    page.finish();
    let swip = Swip::from_frame(manager.frame(frame_id) as *const _);

    c.bench_function("resolve_hot_fast_path", |b| {
        b.iter(|| {
            let holder = manager.frame(frame_id);
            let guard = vmcache::OptimisticGuard::new(&holder.latch);
            let resolved = manager.resolve_swip(&guard, &swip).unwrap();
            black_box(resolved);
        });
    });
}

fn bench_concurrent_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_allocate");

    for num_threads in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                let (manager, _temp) = create_manager(0.05, 4);
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let manager = manager.clone();
                            std::thread::spawn(move || {
                                for _ in 0..20 {
                                    allocate_write_and_reclaim(&manager, 1);
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_allocate_page,
    bench_resolve_hot_swip,
    bench_concurrent_allocate
);
criterion_main!(benches);
