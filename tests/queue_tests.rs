//! End-to-end queue scenarios: request/flush/acquire/release round
//! trips, backpressure, timestamp-driven frame dropping, last-flushed
//! pinning, cache cleaning and buffer migration.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use common::{ assert_conservation, config, fixture };
use flipq::error::FlipqError;
use flipq::fence::SyncFence;
use flipq::queue::{ BufferState, InvokerType };
use flipq::types::{ BufferFlushConfig, BufferUsage, ExtraData, Rect };

fn flush_simple(fx: &common::Fixture, sequence: u32, width: i32, height: i32) {
    fx.queue
        .flush_buffer(
            sequence,
            ExtraData::new(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(width, height)
        )
        .unwrap();
}

fn flush_with_desired(fx: &common::Fixture, sequence: u32, desired: i64) {
    let config = BufferFlushConfig {
        damages: vec![Rect::new(0, 0, 64, 64)],
        ui_timestamp: 0,
        desired_present_timestamp: desired,
    };
    fx.queue.flush_buffer(sequence, ExtraData::new(), SyncFence::invalid(), &config).unwrap();
}

// ============================================================================
// Scenario: simple round trip with allocation elision
// ============================================================================

#[test]
fn round_trip_reuses_cached_buffer() {
    let fx = fixture("round-trip");
    fx.queue.set_queue_size(3).unwrap();
    let cfg = config(256, 256);

    let first = fx.queue.request_buffer(&cfg).unwrap();
    assert!(first.buffer.is_some(), "fresh allocation must ship the buffer");
    assert!(!first.fence.is_valid());
    let sequence = first.sequence;

    flush_simple(&fx, sequence, 256, 256);
    assert_eq!(fx.listener.available.load(Ordering::Acquire), 1);

    let acquired = fx.queue.acquire_buffer().unwrap();
    assert_eq!(acquired.buffer.sequence(), sequence);
    assert_eq!(acquired.damages, vec![Rect::new(0, 0, 256, 256)]);
    fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    // identical config: the slot comes back without its handle and
    // without touching the allocator
    let allocations = fx.allocator.allocations();
    let second = fx.queue.request_buffer(&cfg).unwrap();
    assert_eq!(second.sequence, sequence);
    assert!(second.buffer.is_none(), "cached buffer must be elided");
    assert_eq!(fx.allocator.allocations(), allocations);

    assert_conservation(&fx.queue.snapshot());
}

#[test]
fn request_prefers_exact_config_match() {
    let fx = fixture("config-match");
    fx.queue.set_queue_size(3).unwrap();

    let small = fx.queue.request_buffer(&config(64, 64)).unwrap();
    let large = fx.queue.request_buffer(&config(128, 128)).unwrap();
    flush_simple(&fx, small.sequence, 64, 64);
    flush_simple(&fx, large.sequence, 128, 128);
    for _ in 0..2 {
        let acquired = fx.queue.acquire_buffer().unwrap();
        fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();
    }

    // free list order is [small, large]; an exact match must skip FIFO
    let reply = fx.queue.request_buffer(&config(128, 128)).unwrap();
    assert_eq!(reply.sequence, large.sequence);
    assert!(reply.buffer.is_none());
}

// ============================================================================
// Scenario: backpressure in blocking and noblock modes
// ============================================================================

#[test]
fn full_queue_times_out_in_blocking_mode() {
    let fx = fixture("backpressure");
    fx.queue.set_queue_size(2).unwrap();

    let a = fx.queue.request_buffer(&config(64, 64)).unwrap();
    let b = fx.queue.request_buffer(&config(128, 128)).unwrap();
    assert_ne!(a.sequence, b.sequence);

    let mut third = config(64, 64);
    third.timeout_ms = 50;
    let err = fx.queue.request_buffer(&third).unwrap_err();
    assert_eq!(err, FlipqError::NoBuffer);
    assert_conservation(&fx.queue.snapshot());
}

#[test]
fn full_queue_steals_oldest_dirty_in_noblock_mode() {
    let fx = fixture("noblock");
    fx.queue.set_queue_size(2).unwrap();
    fx.queue.set_noblock_mode(true);

    let a = fx.queue.request_buffer(&config(64, 64)).unwrap();
    let b = fx.queue.request_buffer(&config(64, 64)).unwrap();
    flush_simple(&fx, a.sequence, 64, 64);
    flush_simple(&fx, b.sequence, 64, 64);

    // the oldest dirty frame is sacrificed
    let third = fx.queue.request_buffer(&config(64, 64)).unwrap();
    assert_eq!(third.sequence, a.sequence);
    assert_eq!(fx.queue.snapshot().dirty, vec![b.sequence]);
}

#[test]
fn release_wakes_blocked_request() {
    let fx = fixture("wakeup");
    fx.queue.set_queue_size(1).unwrap();

    let only = fx.queue.request_buffer(&config(64, 64)).unwrap();
    flush_simple(&fx, only.sequence, 64, 64);
    let acquired = fx.queue.acquire_buffer().unwrap();

    let queue = fx.queue.clone();
    let waiter = thread::spawn(move || {
        let mut cfg = config(64, 64);
        cfg.timeout_ms = 2000;
        queue.request_buffer(&cfg)
    });

    thread::sleep(Duration::from_millis(50));
    fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    let reply = waiter.join().unwrap().unwrap();
    assert_eq!(reply.sequence, only.sequence);
}

#[test]
fn dead_status_fails_waiters_cleanly() {
    let fx = fixture("dead-status");
    fx.queue.set_queue_size(1).unwrap();
    let _held = fx.queue.request_buffer(&config(64, 64)).unwrap();

    let queue = fx.queue.clone();
    let waiter = thread::spawn(move || {
        let mut cfg = config(64, 64);
        cfg.timeout_ms = 5000;
        queue.request_buffer(&cfg)
    });
    thread::sleep(Duration::from_millis(50));
    fx.queue.set_status(false);

    assert_eq!(waiter.join().unwrap().unwrap_err(), FlipqError::NoConsumer);
}

// ============================================================================
// Scenario: last-flushed pinning
// ============================================================================

#[test]
fn pinned_last_flushed_is_skipped_by_requests() {
    let fx = fixture("pinning");
    let cfg = config(64, 64);

    let first = fx.queue.request_buffer(&cfg).unwrap();
    flush_simple(&fx, first.sequence, 64, 64);
    let acquired = fx.queue.acquire_buffer().unwrap();
    fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    let pinned = fx.queue.acquire_last_flushed_buffer(false).unwrap();
    assert_eq!(pinned.buffer.sequence(), first.sequence);

    // pinning twice is refused
    assert!(matches!(
        fx.queue.acquire_last_flushed_buffer(false),
        Err(FlipqError::BufferStateInvalid { .. })
    ));

    // the pinned slot sits on the free list but cannot be dequeued
    let other = fx.queue.request_buffer(&cfg).unwrap();
    assert_ne!(other.sequence, first.sequence);

    fx.queue.release_last_flushed_buffer(first.sequence).unwrap();
    let reused = fx.queue.request_buffer(&cfg).unwrap();
    assert_eq!(reused.sequence, first.sequence);
}

#[test]
fn protected_buffer_refuses_last_flushed_access() {
    let fx = fixture("protected");
    let mut cfg = config(64, 64);
    cfg.usage = BufferUsage::PROTECTED;

    let reply = fx.queue.request_buffer(&cfg).unwrap();
    flush_simple(&fx, reply.sequence, 64, 64);

    assert!(matches!(
        fx.queue.get_last_flushed_buffer(false, false),
        Err(FlipqError::NotSupport { .. })
    ));
}

// ============================================================================
// Scenario: present-timestamp dropping
// ============================================================================

#[test]
fn acquire_drops_frames_behind_expect_present() {
    let fx = fixture("pts-drop");
    fx.queue.set_queue_size(4).unwrap();
    let cfg = config(64, 64);

    let mut sequences = Vec::new();
    for desired in [100i64, 200, 300] {
        let reply = fx.queue.request_buffer(&cfg).unwrap();
        flush_with_desired(&fx, reply.sequence, desired);
        sequences.push(reply.sequence);
    }

    let acquired = fx.queue.acquire_buffer_expect_present(250, false).unwrap();
    assert_eq!(acquired.buffer.sequence(), sequences[1], "the frame due at 200 wins");

    let snapshot = fx.queue.snapshot();
    assert_eq!(snapshot.dirty, vec![sequences[2]], "the future frame stays queued");
    assert!(snapshot.free.contains(&sequences[0]), "the stale frame was auto-released");
    assert_conservation(&snapshot);
}

#[test]
fn near_future_frame_reports_not_ready() {
    let fx = fixture("pts-not-ready");
    let cfg = config(64, 64);

    let reply = fx.queue.request_buffer(&cfg).unwrap();
    flush_with_desired(&fx, reply.sequence, 100);

    let err = fx.queue.acquire_buffer_expect_present(50, false).unwrap_err();
    assert_eq!(err, FlipqError::NoBufferReady);
    assert_eq!(fx.queue.snapshot().dirty, vec![reply.sequence]);
}

#[test]
fn drop_by_level_caps_dirty_backlog() {
    let fx = fixture("level-drop");
    fx.queue.set_queue_size(5).unwrap();
    fx.queue.set_drop_frame_level(2).unwrap();
    let cfg = config(64, 64);

    let mut sequences = Vec::new();
    for desired in [10i64, 20, 30, 40] {
        let reply = fx.queue.request_buffer(&cfg).unwrap();
        flush_with_desired(&fx, reply.sequence, desired);
        sequences.push(reply.sequence);
    }

    let acquired = fx.queue.acquire_buffer_expect_present(1_000, false).unwrap();
    assert_eq!(acquired.buffer.sequence(), *sequences.last().unwrap());

    let snapshot = fx.queue.snapshot();
    assert!(snapshot.dirty.len() <= 2);
    assert_conservation(&snapshot);
}

// ============================================================================
// Scenario: CleanCache retains exactly one
// ============================================================================

#[test]
fn clean_cache_reports_last_flushed_and_wipes() {
    let fx = fixture("clean-cache");
    let cfg = config(64, 64);

    let first = fx.queue.request_buffer(&cfg).unwrap();
    flush_simple(&fx, first.sequence, 64, 64);
    let acquired = fx.queue.acquire_buffer().unwrap();
    fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    let second = fx.queue.request_buffer(&cfg).unwrap();
    flush_simple(&fx, second.sequence, 64, 64);

    let pre_cache = fx.queue.clean_cache(false).unwrap();
    assert_eq!(pre_cache, Some(second.sequence));
    assert_eq!(fx.listener.clean_cache_calls.lock().as_slice(), &[Some(second.sequence)]);

    let snapshot = fx.queue.snapshot();
    assert!(snapshot.cache.is_empty());
    assert!(snapshot.free.is_empty() && snapshot.dirty.is_empty());

    // the next request allocates fresh
    let third = fx.queue.request_buffer(&cfg).unwrap();
    assert!(third.buffer.is_some());
    assert_ne!(third.sequence, second.sequence);
}

#[test]
fn go_background_fires_listener_and_clears() {
    let fx = fixture("background");
    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();
    flush_simple(&fx, reply.sequence, 64, 64);

    fx.queue.go_background().unwrap();
    assert_eq!(fx.listener.go_background_calls.load(Ordering::Acquire), 1);
    assert!(fx.queue.snapshot().cache.is_empty());
}

#[test]
fn consumer_death_wipes_without_callbacks() {
    let fx = fixture("consumer-died");
    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();
    flush_simple(&fx, reply.sequence, 64, 64);

    let clean_calls = fx.listener.clean_cache_calls.lock().len();
    fx.queue.on_consumer_died().unwrap();
    assert!(fx.queue.snapshot().cache.is_empty());
    assert_eq!(fx.listener.clean_cache_calls.lock().len(), clean_calls);
    assert_eq!(fx.listener.go_background_calls.load(Ordering::Acquire), 0);
}

// ============================================================================
// Scenario: attach migration between queues
// ============================================================================

#[test]
fn buffer_migrates_between_queues_without_copying() {
    let fx_a = fixture("migrate-a");
    let fx_b = fixture("migrate-b");
    let cfg = config(96, 96);

    let reply = fx_a.queue.request_buffer(&cfg).unwrap();
    let buffer = reply.buffer.clone().unwrap();

    fx_a.queue.detach_from_queue(&buffer, InvokerType::Producer, false).unwrap();
    assert!(!fx_a.queue.is_buffer_in_cache(buffer.sequence()));

    fx_b.queue.attach_to_queue(buffer.clone(), InvokerType::Producer).unwrap();
    let snapshot = fx_b.queue.snapshot();
    assert!(
        snapshot.cache.iter().any(|&(seq, state)| seq == buffer.sequence() &&
            state == BufferState::Requested)
    );

    flush_simple(&fx_b, buffer.sequence(), 96, 96);
    let acquired = fx_b.queue.acquire_buffer().unwrap();
    assert_eq!(acquired.buffer.width(), 96);
    assert_eq!(acquired.buffer.height(), 96);
}

#[test]
fn duplicate_attach_is_rejected() {
    let fx = fixture("dup-attach");
    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();
    let buffer = reply.buffer.clone().unwrap();

    let err = fx.queue.attach_to_queue(buffer, InvokerType::Producer).unwrap_err();
    assert!(matches!(err, FlipqError::BufferIsInCache { .. }));
}

#[test]
fn consumer_detach_can_reserve_the_slot() {
    let fx = fixture("reserve");
    fx.queue.set_queue_size(2).unwrap();
    let cfg = config(64, 64);

    let reply = fx.queue.request_buffer(&cfg).unwrap();
    let buffer = reply.buffer.clone().unwrap();
    flush_simple(&fx, reply.sequence, 64, 64);
    let acquired = fx.queue.acquire_buffer().unwrap();

    fx.queue.detach_from_queue(&acquired.buffer, InvokerType::Consumer, true).unwrap();

    // the reservation holds one slot back from producers
    let first = fx.queue.request_buffer(&cfg).unwrap();
    let mut cfg_timeout = cfg.clone();
    cfg_timeout.timeout_ms = 50;
    assert_eq!(fx.queue.request_buffer(&cfg_timeout).unwrap_err(), FlipqError::NoBuffer);

    // a consumer re-attach releases the reservation
    fx.queue.attach_to_queue(buffer, InvokerType::Consumer).unwrap();
    let _ = first;
}

// ============================================================================
// Cancel, state machine edges, sizing
// ============================================================================

#[test]
fn cancel_returns_slot_to_free_list() {
    let fx = fixture("cancel");
    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();

    fx.queue.cancel_buffer(reply.sequence, ExtraData::new()).unwrap();
    let snapshot = fx.queue.snapshot();
    assert_eq!(snapshot.free, vec![reply.sequence]);

    // cancelling twice is a state error
    assert!(matches!(
        fx.queue.cancel_buffer(reply.sequence, ExtraData::new()),
        Err(FlipqError::BufferStateInvalid { .. })
    ));
}

#[test]
fn flush_requires_requested_state() {
    let fx = fixture("flush-state");
    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();
    flush_simple(&fx, reply.sequence, 64, 64);

    let err = fx.queue
        .flush_buffer(
            reply.sequence,
            ExtraData::new(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(64, 64)
        )
        .unwrap_err();
    assert!(matches!(err, FlipqError::BufferStateInvalid { .. }));

    let err = fx.queue
        .flush_buffer(
            9999,
            ExtraData::new(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(64, 64)
        )
        .unwrap_err();
    assert!(matches!(err, FlipqError::BufferNotInCache { .. }));
}

#[test]
fn negative_damage_is_rejected() {
    let fx = fixture("bad-damage");
    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();

    let config = BufferFlushConfig {
        damages: vec![Rect::new(0, 0, -1, 64)],
        ..Default::default()
    };
    let err = fx.queue
        .flush_buffer(reply.sequence, ExtraData::new(), SyncFence::invalid(), &config)
        .unwrap_err();
    assert!(matches!(err, FlipqError::InvalidArguments { .. }));
}

#[test]
fn shrinking_queue_deletes_free_buffers_first() {
    let fx = fixture("shrink");
    fx.queue.set_queue_size(4).unwrap();
    let cfg = config(64, 64);

    // one free, one dirty, one requested
    let a = fx.queue.request_buffer(&cfg).unwrap();
    flush_simple(&fx, a.sequence, 64, 64);
    let acquired = fx.queue.acquire_buffer().unwrap();
    fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    let b = fx.queue.request_buffer(&config(65, 65)).unwrap();
    flush_simple(&fx, b.sequence, 65, 65);
    let _c = fx.queue.request_buffer(&config(66, 66)).unwrap();

    fx.queue.set_queue_size(3).unwrap();
    let snapshot = fx.queue.snapshot();
    assert!(!snapshot.cache.iter().any(|&(seq, _)| seq == a.sequence), "free slot deleted first");
    assert!(snapshot.cache.iter().any(|&(seq, _)| seq == b.sequence), "dirty slot survives");
    assert_conservation(&snapshot);

    // the deleted sequence reaches the producer as cache invalidation
    let acquired = fx.queue.acquire_buffer().unwrap();
    fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();
    let reply = fx.queue.request_buffer(&config(65, 65)).unwrap();
    assert!(reply.deleting_buffers.contains(&a.sequence));
}

#[test]
fn queue_size_clamps_to_max() {
    let fx = fixture("max-size");
    fx.queue.set_max_queue_size(4).unwrap();
    fx.queue.set_queue_size(10).unwrap();
    assert_eq!(fx.queue.queue_size(), 4);

    assert!(fx.queue.set_queue_size(0).is_err());
    assert!(fx.queue.set_queue_size(100).is_err());
}

#[test]
fn attach_waits_for_release_of_known_sequence() {
    let fx = fixture("attach-wait");
    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();
    let buffer = reply.buffer.clone().unwrap();
    flush_simple(&fx, reply.sequence, 64, 64);
    let acquired = fx.queue.acquire_buffer().unwrap();

    let queue = fx.queue.clone();
    let attach_buffer = buffer.clone();
    let attacher = thread::spawn(move || queue.attach_buffer(&attach_buffer, 2000));

    thread::sleep(Duration::from_millis(50));
    fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();
    attacher.join().unwrap().unwrap();

    let snapshot = fx.queue.snapshot();
    assert!(
        snapshot.cache.iter().any(|&(seq, state)| seq == buffer.sequence() &&
            state == BufferState::Attached)
    );
}

#[test]
fn extra_data_rides_with_the_slot() {
    let fx = fixture("extra-data");
    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();

    let mut extra = ExtraData::new();
    extra.set("frameNumber", flipq::types::ExtraValue::I64(7)).unwrap();
    fx.queue
        .flush_buffer(
            reply.sequence,
            extra.clone(),
            SyncFence::invalid(),
            &BufferFlushConfig::full_damage(64, 64)
        )
        .unwrap();

    let acquired = fx.queue.acquire_buffer().unwrap();
    assert_eq!(acquired.buffer.extra_data(), extra);
}

#[test]
fn release_merges_buffer_sync_fence() {
    let fx = fixture("fence-merge");
    let reply = fx.queue.request_buffer(&config(64, 64)).unwrap();
    let buffer = reply.buffer.clone().unwrap();
    flush_simple(&fx, reply.sequence, 64, 64);
    let acquired = fx.queue.acquire_buffer().unwrap();

    let own = SyncFence::new("consumer-gpu");
    own.signal_at(500);
    buffer.set_sync_fence(Some(own));
    let caller = SyncFence::new("release");
    caller.signal_at(300);
    fx.queue.release_buffer(&acquired.buffer, caller).unwrap();

    // the next request hands back the merged fence
    let next = fx.queue.request_buffer(&config(64, 64)).unwrap();
    assert_eq!(next.sequence, reply.sequence);
    assert_eq!(next.fence.signalled_time(), Some(500));
}
