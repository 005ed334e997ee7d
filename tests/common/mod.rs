//! Shared fixtures for the integration suites.

use std::sync::Arc;
use std::sync::atomic::{ AtomicU32, Ordering };

use parking_lot::Mutex;

use flipq::buffer::{ Allocator, MemfdAllocator, SurfaceBuffer };
use flipq::error::Result;
use flipq::queue::{ BufferQueue, BufferState, ConsumerListener, QueueSnapshot };
use flipq::types::{ BufferRequestConfig, BufferUsage, PixelFormat };

/// Wraps the memfd allocator and counts every real allocation, so tests
/// can prove the reuse paths never touch the allocator
pub struct CountingAllocator {
    inner: MemfdAllocator,
    allocations: AtomicU32,
}

impl CountingAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemfdAllocator::default(),
            allocations: AtomicU32::new(0),
        })
    }

    pub fn allocations(&self) -> u32 {
        self.allocations.load(Ordering::Acquire)
    }
}

impl Allocator for CountingAllocator {
    fn allocate(
        &self,
        config: &BufferRequestConfig,
        previous: Option<&Arc<SurfaceBuffer>>
    ) -> Result<Arc<SurfaceBuffer>> {
        self.allocations.fetch_add(1, Ordering::AcqRel);
        self.inner.allocate(config, previous)
    }
}

/// Consumer listener recording what fired
#[derive(Default)]
pub struct RecordingListener {
    pub available: AtomicU32,
    pub clean_cache_calls: Mutex<Vec<Option<u32>>>,
    pub go_background_calls: AtomicU32,
    pub transform_changes: AtomicU32,
}

impl ConsumerListener for RecordingListener {
    fn on_buffer_available(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
    }

    fn on_clean_cache(&self, pre_cache_sequence: Option<u32>) {
        self.clean_cache_calls.lock().push(pre_cache_sequence);
    }

    fn on_go_background(&self) {
        self.go_background_calls.fetch_add(1, Ordering::AcqRel);
    }

    fn on_transform_change(&self) {
        self.transform_changes.fetch_add(1, Ordering::AcqRel);
    }
}

pub struct Fixture {
    pub queue: Arc<BufferQueue>,
    pub allocator: Arc<CountingAllocator>,
    pub listener: Arc<RecordingListener>,
}

pub fn fixture(name: &str) -> Fixture {
    let allocator = CountingAllocator::new();
    let queue = BufferQueue::new(name, allocator.clone());
    let listener = Arc::new(RecordingListener::default());
    queue.register_consumer_listener(listener.clone());
    Fixture { queue, allocator, listener }
}

pub fn config(width: i32, height: i32) -> BufferRequestConfig {
    BufferRequestConfig {
        width,
        height,
        format: PixelFormat::Rgba8888,
        usage: BufferUsage::CPU_READ | BufferUsage::CPU_WRITE,
        ..Default::default()
    }
}

/// Conservation invariant: every cached sequence is on exactly the list
/// its state demands, and the lists hold no strangers
pub fn assert_conservation(snapshot: &QueueSnapshot) {
    assert!(snapshot.cache.len() <= (snapshot.queue_size as usize), "cache exceeds queue size");

    for &(sequence, state) in &snapshot.cache {
        let on_free = snapshot.free.contains(&sequence);
        let on_dirty = snapshot.dirty.contains(&sequence);
        let on_deleting = snapshot.deleting.contains(&sequence);
        let memberships = [on_free, on_dirty, on_deleting]
            .iter()
            .filter(|&&b| b)
            .count();
        assert!(memberships <= 1, "sequence {sequence} appears on {memberships} lists");
        match state {
            BufferState::Released => assert!(on_free, "released {sequence} missing from free list"),
            BufferState::Flushed => assert!(on_dirty, "flushed {sequence} missing from dirty list"),
            _ => assert!(!on_free && !on_dirty, "{state:?} {sequence} should be off the slot lists"),
        }
    }
    for sequence in &snapshot.free {
        assert!(
            snapshot.cache.iter().any(|(seq, _)| seq == sequence),
            "free list holds uncached {sequence}"
        );
    }
    for sequence in &snapshot.dirty {
        assert!(
            snapshot.cache.iter().any(|(seq, _)| seq == sequence),
            "dirty list holds uncached {sequence}"
        );
    }
}
