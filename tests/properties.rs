//! Property tests for the quantified invariants: fence-merge laws,
//! conservation, the size bound and double-release rejection under
//! arbitrary operation interleavings.

mod common;

use std::collections::VecDeque;
use std::sync::Arc;

use proptest::prelude::*;

use common::{ assert_conservation, config, fixture };
use flipq::buffer::SurfaceBuffer;
use flipq::error::FlipqError;
use flipq::fence::SyncFence;
use flipq::types::{ BufferFlushConfig, ExtraData };

proptest! {
    #[test]
    fn merge_with_invalid_is_identity(timestamp in 0i64..1_000_000) {
        let fence = SyncFence::new("f");
        fence.signal_at(timestamp);

        let left = SyncFence::merge("m", &SyncFence::invalid(), &fence);
        let right = SyncFence::merge("m", &fence, &SyncFence::invalid());
        prop_assert_eq!(left.signalled_time(), Some(timestamp));
        prop_assert_eq!(right.signalled_time(), Some(timestamp));
    }

    #[test]
    fn merge_signals_at_the_later_input(a in 0i64..1_000_000, b in 0i64..1_000_000) {
        let fa = SyncFence::new("a");
        let fb = SyncFence::new("b");
        fa.signal_at(a);
        fb.signal_at(b);

        let merged = SyncFence::merge("m", &fa, &fb);
        prop_assert!(merged.is_signalled());
        prop_assert_eq!(merged.signalled_time(), Some(a.max(b)));
    }

    #[test]
    fn merge_nests_without_losing_the_max(times in proptest::collection::vec(0i64..1_000_000, 2..6)) {
        let fences: Vec<SyncFence> = times
            .iter()
            .map(|&t| {
                let f = SyncFence::new("n");
                f.signal_at(t);
                f
            })
            .collect();
        let mut merged = fences[0].clone();
        for fence in &fences[1..] {
            merged = SyncFence::merge("m", &merged, fence);
        }
        prop_assert_eq!(merged.signalled_time(), times.iter().copied().max());
    }
}

/// One step of the randomized driver
#[derive(Debug, Clone, Copy)]
enum Op {
    Request,
    Flush,
    Acquire,
    Release,
    Cancel,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Request),
        Just(Op::Flush),
        Just(Op::Acquire),
        Just(Op::Release),
        Just(Op::Cancel)
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Conservation and the size bound hold after every operation of an
    /// arbitrary request/flush/acquire/release/cancel interleaving
    #[test]
    fn invariants_hold_under_random_interleavings(
        ops in proptest::collection::vec(op_strategy(), 1..60),
        queue_size in 1u32..5
    ) {
        let fx = fixture("prop-driver");
        fx.queue.set_queue_size(queue_size).unwrap();
        let cfg = {
            let mut cfg = config(32, 32);
            cfg.timeout_ms = 0;
            cfg
        };

        let mut requested: VecDeque<u32> = VecDeque::new();
        let mut acquired: VecDeque<Arc<SurfaceBuffer>> = VecDeque::new();

        for op in ops {
            match op {
                Op::Request => {
                    if let Ok(reply) = fx.queue.request_buffer(&cfg) {
                        requested.push_back(reply.sequence);
                    }
                }
                Op::Flush => {
                    if let Some(sequence) = requested.pop_front() {
                        fx.queue
                            .flush_buffer(
                                sequence,
                                ExtraData::new(),
                                SyncFence::invalid(),
                                &BufferFlushConfig::full_damage(32, 32)
                            )
                            .unwrap();
                    }
                }
                Op::Acquire => {
                    if let Ok(reply) = fx.queue.acquire_buffer() {
                        acquired.push_back(reply.buffer);
                    }
                }
                Op::Release => {
                    if let Some(buffer) = acquired.pop_front() {
                        fx.queue.release_buffer(&buffer, SyncFence::invalid()).unwrap();
                    }
                }
                Op::Cancel => {
                    if let Some(sequence) = requested.pop_front() {
                        fx.queue.cancel_buffer(sequence, ExtraData::new()).unwrap();
                    }
                }
            }
            let snapshot = fx.queue.snapshot();
            prop_assert!(snapshot.cache.len() <= (queue_size as usize));
            assert_conservation(&snapshot);
        }
    }
}

#[test]
fn double_release_is_rejected_without_state_change() {
    let fx = fixture("double-release");
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
    let before = fx.queue.snapshot();
    let err = fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap_err();
    assert!(matches!(err, FlipqError::BufferStateInvalid { .. }));

    let after = fx.queue.snapshot();
    assert_eq!(before.free, after.free);
    assert_eq!(before.dirty, after.dirty);
}

#[test]
fn dirty_list_is_fifo() {
    let fx = fixture("fifo");
    fx.queue.set_queue_size(4).unwrap();

    let mut flushed = Vec::new();
    for _ in 0..3 {
        let reply = fx.queue.request_buffer(&config(32, 32)).unwrap();
        fx.queue
            .flush_buffer(
                reply.sequence,
                ExtraData::new(),
                SyncFence::invalid(),
                &BufferFlushConfig::full_damage(32, 32)
            )
            .unwrap();
        flushed.push(reply.sequence);
    }
    for expected in flushed {
        let acquired = fx.queue.acquire_buffer().unwrap();
        assert_eq!(acquired.buffer.sequence(), expected);
        fx.queue.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();
    }
}
