//! Wire-level tests: a remote producer driving the stub over the
//! loopback transport, with the consumer acquiring locally.

mod common;

use std::sync::Arc;

use common::{ config, fixture };
use flipq::consumer::BufferQueueConsumer;
use flipq::error::FlipqError;
use flipq::fence::SyncFence;
use flipq::producer::BufferQueueProducer;
use flipq::transport::{
    decode_reply,
    encode_frame,
    LoopbackTransport,
    ProducerStub,
    RemoteProducer,
    Transport,
};
use flipq::types::{ BufferFlushConfig, ExtraData, TransformType };

struct Remote {
    fx: common::Fixture,
    remote: RemoteProducer,
    consumer: BufferQueueConsumer,
}

fn remote_fixture(name: &str) -> Remote {
    let fx = fixture(name);
    let producer = Arc::new(BufferQueueProducer::new(fx.queue.clone()));
    let stub = ProducerStub::new(producer);
    let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(stub));
    let remote = RemoteProducer::new(transport);
    let consumer = BufferQueueConsumer::new(fx.queue.clone());
    Remote { fx, remote, consumer }
}

#[test]
fn remote_round_trip_with_handle_elision() {
    let harness = remote_fixture("wire-round-trip");
    let cfg = config(128, 128);

    harness.remote.connect().unwrap();
    let first = harness.remote.request_buffer(&cfg).unwrap();
    assert_eq!(harness.remote.cached_buffer_count(), 1);
    assert_eq!(first.buffer.width(), 128);

    harness.remote
        .flush_buffer(
            first.sequence,
            ExtraData::new(),
            &SyncFence::invalid(),
            &BufferFlushConfig::full_damage(128, 128)
        )
        .unwrap();

    let acquired = harness.consumer.acquire_buffer().unwrap();
    assert_eq!(acquired.buffer.sequence(), first.sequence);
    harness.consumer.release_buffer(&acquired.buffer, SyncFence::invalid()).unwrap();

    // the elided reply resolves against the remote-side cache
    let second = harness.remote.request_buffer(&cfg).unwrap();
    assert_eq!(second.sequence, first.sequence);
    assert_eq!(harness.remote.cached_buffer_count(), 1);
    assert!(Arc::ptr_eq(&second.buffer, &first.buffer));
}

#[test]
fn remote_errors_travel_verbatim() {
    let harness = remote_fixture("wire-errors");
    harness.fx.queue.set_queue_size(1).unwrap();
    harness.remote.connect().unwrap();

    let mut cfg = config(64, 64);
    let _held = harness.remote.request_buffer(&cfg).unwrap();
    cfg.timeout_ms = 50;
    assert_eq!(harness.remote.request_buffer(&cfg).unwrap_err(), FlipqError::NoBuffer);
}

#[test]
fn remote_surface_state_ops() {
    let harness = remote_fixture("wire-state");

    assert_eq!(harness.remote.name().unwrap(), "wire-state");
    assert_eq!(harness.remote.unique_id().unwrap(), harness.fx.queue.unique_id());

    harness.remote.set_queue_size(5).unwrap();
    assert_eq!(harness.remote.queue_size().unwrap(), 5);
    assert_eq!(harness.fx.queue.queue_size(), 5);

    harness.remote.set_transform(TransformType::Rotate270).unwrap();
    assert_eq!(harness.remote.transform().unwrap(), TransformType::Rotate270);
}

#[test]
fn disconnect_reports_the_pre_cache_sequence() {
    let harness = remote_fixture("wire-disconnect");
    let cfg = config(64, 64);

    harness.remote.connect().unwrap();
    let reply = harness.remote.request_buffer(&cfg).unwrap();
    harness.remote
        .flush_buffer(
            reply.sequence,
            ExtraData::new(),
            &SyncFence::invalid(),
            &BufferFlushConfig::full_damage(64, 64)
        )
        .unwrap();

    let pre_cache = harness.remote.disconnect().unwrap();
    assert_eq!(pre_cache, Some(reply.sequence));
    assert_eq!(harness.remote.cached_buffer_count(), 1, "exactly the pre-cache buffer survives");
}

#[test]
fn stub_rejects_unknown_opcode_and_bad_frames() {
    let harness = remote_fixture("wire-reject");
    let producer = Arc::new(BufferQueueProducer::new(harness.fx.queue.clone()));
    let stub = ProducerStub::new(producer);

    let reply = stub.dispatch(&encode_frame(9999, b""));
    assert!(matches!(decode_reply(&reply), Err(FlipqError::InvalidArguments { .. })));

    let reply = stub.dispatch(b"short");
    assert!(matches!(decode_reply(&reply), Err(FlipqError::InvalidArguments { .. })));
}
