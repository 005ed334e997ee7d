//! Producer/consumer facade behavior: connection gating, the local
//! buffer cache with pre-cache retention, release-listener delivery and
//! the seq-and-fence pre-hand-out, transform-hint fanout, and the
//! low-power playback mirror.

mod common;

use std::sync::Arc;
use std::sync::atomic::{ AtomicU32, Ordering };

use parking_lot::Mutex;

use common::{ config, fixture };
use flipq::consumer::BufferQueueConsumer;
use flipq::error::FlipqError;
use flipq::fence::SyncFence;
use flipq::producer::BufferQueueProducer;
use flipq::queue::{ BufferState, ProducerListener, SurfaceProperty };
use flipq::queue::lpp::LppRegion;
use flipq::types::{ BufferFlushConfig, ExtraData, SourceType, TransformType };

#[derive(Default)]
struct RecordingProducerListener {
    released: AtomicU32,
    handouts: Mutex<Vec<u32>>,
    properties: Mutex<Vec<TransformType>>,
}

impl ProducerListener for RecordingProducerListener {
    fn on_buffer_released(&self) -> flipq::Result<()> {
        self.released.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn on_buffer_released_with_sequence_and_fence(
        &self,
        sequence: u32,
        _fence: &SyncFence
    ) -> flipq::Result<()> {
        self.handouts.lock().push(sequence);
        Ok(())
    }

    fn on_property_change(&self, property: SurfaceProperty) -> flipq::Result<()> {
        self.properties.lock().push(property.transform_hint);
        Ok(())
    }
}

// ============================================================================
// Connection gating
// ============================================================================

#[test]
fn reconnecting_from_the_same_pid_is_idempotent() {
    let fx = fixture("connect");
    let producer = BufferQueueProducer::new(fx.queue.clone());

    producer.connect().unwrap();
    producer.connect().unwrap();
    assert!(producer.is_connected());
    assert_ne!(fx.queue.connected_pid(), 0);
}

#[test]
fn strict_disconnect_refuses_further_traffic() {
    let fx = fixture("strict");
    let producer = BufferQueueProducer::new(fx.queue.clone());

    producer.connect_strictly().unwrap();
    producer.disconnect_strictly().unwrap();

    assert_eq!(producer.connect().unwrap_err(), FlipqError::ConsumerDisconnected);
    assert_eq!(producer.check_connection().unwrap_err(), FlipqError::ConsumerDisconnected);
    assert_eq!(
        producer.request_buffer(&config(64, 64)).unwrap_err(),
        FlipqError::ConsumerDisconnected
    );
}

// ============================================================================
// Local cache & pre-cache retention
// ============================================================================

#[test]
fn disconnect_retains_exactly_the_pre_cache_buffer() {
    let fx = fixture("pre-cache");
    let producer = BufferQueueProducer::new(fx.queue.clone());
    let consumer = BufferQueueConsumer::new(fx.queue.clone());
    let cfg = config(64, 64);

    // complete one frame, leave a second one flushed
    let first = producer.request_buffer(&cfg).unwrap();
    producer
        .flush_buffer(
            first.sequence,
            ExtraData::new(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(64, 64)
        )
        .unwrap();
    let acquired = consumer.acquire_buffer().unwrap();
    consumer.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    let second = producer.request_buffer(&cfg).unwrap();
    producer
        .flush_buffer(
            second.sequence,
            ExtraData::new(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(64, 64)
        )
        .unwrap();

    producer.disconnect().unwrap();
    assert_eq!(producer.cached_buffer_count(), 0);
    assert!(producer.has_pre_cache_buffer(), "the last flushed frame stays alive");

    // the pre-cache reference drops once the cache regrows to two
    let replies = producer.request_buffers(&cfg, 2).unwrap();
    assert!(replies.len() >= 2);
    assert!(!producer.has_pre_cache_buffer());
}

#[test]
fn no_consumer_clears_the_local_cache() {
    let fx = fixture("cache-clear");
    let producer = BufferQueueProducer::new(fx.queue.clone());

    let reply = producer.request_buffer(&config(64, 64)).unwrap();
    assert_eq!(producer.cached_buffer_count(), 1);

    fx.queue.set_status(false);
    let err = producer
        .flush_buffer(
            reply.sequence,
            ExtraData::new(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(64, 64)
        )
        .unwrap_err();
    assert_eq!(err, FlipqError::NoConsumer);
    assert_eq!(producer.cached_buffer_count(), 0);
}

// ============================================================================
// Release listeners
// ============================================================================

#[test]
fn release_listener_fires_after_each_release() {
    let fx = fixture("release-listener");
    let listener = Arc::new(RecordingProducerListener::default());
    fx.queue.register_producer_release_listener(listener.clone(), false);

    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();
    fx.queue
        .flush_buffer(
            reply.sequence,
            ExtraData::new(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(64, 64)
        )
        .unwrap();
    let acquired = fx.queue.acquire_buffer().unwrap();
    fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    assert_eq!(listener.released.load(Ordering::Acquire), 1);
}

#[test]
fn seq_and_fence_listener_gets_pre_handed_slots() {
    let fx = fixture("seq-fence");
    let producer = BufferQueueProducer::new(fx.queue.clone());
    producer.connect().unwrap();

    let listener = Arc::new(RecordingProducerListener::default());
    producer.register_release_listener(listener.clone(), true);

    let cfg = config(64, 64);
    let reply = producer.request_buffer(&cfg).unwrap();
    producer
        .flush_buffer(
            reply.sequence,
            ExtraData::new(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(64, 64)
        )
        .unwrap();
    let acquired = fx.queue.acquire_buffer().unwrap();
    fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    // the released slot was immediately re-requested for the producer
    assert_eq!(listener.handouts.lock().as_slice(), &[reply.sequence]);
    let snapshot = fx.queue.snapshot();
    assert!(
        snapshot.cache.iter().any(|&(seq, state)| seq == reply.sequence &&
            state == BufferState::Requested)
    );
}

#[test]
fn transform_hint_fanout_skips_the_setter() {
    let fx = fixture("hint-fanout");
    let first = Arc::new(RecordingProducerListener::default());
    let second = Arc::new(RecordingProducerListener::default());
    fx.queue.register_producer_property_listener(first.clone(), 1);
    fx.queue.register_producer_property_listener(second.clone(), 2);

    fx.queue.set_transform_hint(TransformType::Rotate90, 1).unwrap();
    assert!(first.properties.lock().is_empty(), "the setter is excluded");
    assert_eq!(second.properties.lock().as_slice(), &[TransformType::Rotate90]);

    // an unchanged value short-circuits the fanout entirely
    fx.queue.set_transform_hint(TransformType::Rotate90, 2).unwrap();
    assert!(first.properties.lock().is_empty());
    assert_eq!(second.properties.lock().len(), 1);
}

#[test]
fn transform_change_notifies_consumer_only_on_change() {
    let fx = fixture("transform-change");
    fx.queue.set_transform(TransformType::Rotate180).unwrap();
    fx.queue.set_transform(TransformType::Rotate180).unwrap();
    assert_eq!(fx.listener.transform_changes.load(Ordering::Acquire), 1);
}

#[test]
fn delete_listener_fires_on_eviction() {
    let fx = fixture("delete-listener");
    let deleted: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = deleted.clone();
    fx.queue.register_delete_buffer_listener(
        Box::new(move |sequence| sink.lock().push(sequence)),
        false
    );

    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();
    fx.queue.cancel_buffer(reply.sequence, ExtraData::new()).unwrap();

    // shrinking evicts the free slot and must announce it exactly once
    fx.queue.set_queue_size(1).unwrap();
    assert_eq!(deleted.lock().as_slice(), &[reply.sequence]);
}

// ============================================================================
// Low-power playback mirror
// ============================================================================

struct LppHarness {
    fx: common::Fixture,
    region: LppRegion,
    sequences: Vec<u32>,
}

fn lpp_harness(frames: usize) -> LppHarness {
    let fx = fixture("lpp");
    fx.queue.set_queue_size(8).unwrap();
    fx.queue.set_source_type(SourceType::LowPowerVideo);

    let mut sequences = Vec::new();
    for _ in 0..frames {
        let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();
        sequences.push(reply.sequence);
    }

    let (region, peer) = LppRegion::create_anonymous().unwrap();
    fx.queue.set_lpp_share_fd(Some(peer)).unwrap();
    LppHarness { fx, region, sequences }
}

/// Publish frame `index` into the ring the way the video firmware does
fn publish(region: &LppRegion, index: usize, sequence: u32, timestamp: i64) {
    use std::sync::atomic::Ordering::Release;
    let entry = region.slot(index % flipq::constants::LPP_SLOT_COUNT);
    entry.seq_id.store(sequence, Release);
    entry.timestamp.store(timestamp, Release);
    region
        .header()
        .write_offset.store(((index + 1) % flipq::constants::LPP_SLOT_COUNT) as i32, Release);
}

#[test]
fn lpp_acquire_reads_the_latest_descriptor() {
    let harness = lpp_harness(1);
    publish(&harness.region, 0, harness.sequences[0], 111);

    let reply = harness.fx.queue.acquire_lpp_buffer().unwrap();
    assert_eq!(reply.buffer.sequence(), harness.sequences[0]);
    assert_eq!(reply.ui_timestamp, 111);
    assert!(!reply.fence.is_valid(), "no fence fd lives in the ring");

    // nothing new published: the next acquire reports empty
    assert_eq!(harness.fx.queue.acquire_lpp_buffer().unwrap_err(), FlipqError::NoBuffer);
}

#[test]
fn lpp_limits_buffers_in_flight() {
    let harness = lpp_harness(4);

    let mut acquired = Vec::new();
    for (index, &sequence) in harness.sequences[..3].iter().enumerate() {
        publish(&harness.region, index, sequence, 100 + (index as i64));
        acquired.push(harness.fx.queue.acquire_lpp_buffer().unwrap().buffer);
    }

    // a fourth in-flight descriptor exceeds the cap
    publish(&harness.region, 3, harness.sequences[3], 103);
    assert_eq!(harness.fx.queue.acquire_lpp_buffer().unwrap_err(), FlipqError::NoBuffer);

    // releasing one frame (normal path, invalid fence) makes room again
    harness.fx.queue.release_buffer(&acquired[0], SyncFence::invalid()).unwrap();
    let reply = harness.fx.queue.acquire_lpp_buffer().unwrap();
    assert_eq!(reply.buffer.sequence(), harness.sequences[3]);
}

#[test]
fn lpp_requires_low_power_source() {
    let fx = fixture("lpp-source");
    let (_region, peer) = LppRegion::create_anonymous().unwrap();
    assert!(matches!(fx.queue.set_lpp_share_fd(Some(peer)), Err(FlipqError::NotSupport { .. })));
    assert!(matches!(fx.queue.acquire_lpp_buffer(), Err(FlipqError::NotSupport { .. })));
}
