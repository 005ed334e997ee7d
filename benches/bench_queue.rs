//! Criterion benchmarks for the hot queue paths: the request/flush/
//! acquire/release cycle and the allocation-eliding reuse request.

use std::sync::Arc;

use criterion::{ criterion_group, criterion_main, Criterion };

use flipq::buffer::MemfdAllocator;
use flipq::fence::SyncFence;
use flipq::queue::{ BufferQueue, ConsumerListener };
use flipq::types::{ BufferFlushConfig, BufferRequestConfig, ExtraData };

struct NoopListener;

impl ConsumerListener for NoopListener {
    fn on_buffer_available(&self) {}
}

fn bench_queue(c: &mut Criterion) {
    let queue = BufferQueue::new("bench", Arc::new(MemfdAllocator::default()));
    queue.register_consumer_listener(Arc::new(NoopListener));
    let config = BufferRequestConfig { width: 256, height: 256, ..Default::default() };

    // warm the cache so the loop below measures reuse, not allocation
    let warm = queue.request_buffer(&config).unwrap();
    queue
        .flush_buffer(
            warm.sequence,
            ExtraData::new(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(256, 256)
        )
        .unwrap();
    let acquired = queue.acquire_buffer().unwrap();
    queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    c.bench_function("request_flush_acquire_release", |b| {
        b.iter(|| {
            let reply = queue.request_buffer(&config).unwrap();
            queue
                .flush_buffer(
                    reply.sequence,
                    ExtraData::new(),
                    SyncFence::invalid(),
                    &BufferFlushConfig::full_damage(256, 256)
                )
                .unwrap();
            let acquired = queue.acquire_buffer().unwrap();
            queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();
        })
    });

    c.bench_function("request_reuse_only", |b| {
        b.iter(|| {
            let reply = queue.request_buffer(&config).unwrap();
            queue.cancel_buffer(reply.sequence, ExtraData::new()).unwrap();
        })
    });
}

criterion_group!(benches, bench_queue);
criterion_main!(benches);
