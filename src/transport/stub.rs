//! Server-side stub: validates each frame, decodes the argument record
//! for its opcode and calls the producer facade. Every reply begins with
//! the 32-bit error code; errors never carry a record.

use std::sync::Arc;

use tracing::warn;

use crate::error::{ FlipqError, Result };
use crate::producer::BufferQueueProducer;
use crate::queue::{ ProducerListener, RequestBufferReply };
use crate::types::{
    AlphaType,
    BufferUsage,
    ScalingMode,
    SourceType,
    TransformType,
};

use super::records::*;
use super::wire::{
    decode_frame,
    decode_payload,
    encode_error_reply,
    encode_reply,
    BufferDescriptor,
    FenceDescriptor,
};
use super::ProducerOp;

pub struct ProducerStub {
    producer: Arc<BufferQueueProducer>,
    /// Out-of-band callback channel to the remote producer; release
    /// listener opcodes bind this sink to the queue
    callback_sink: parking_lot::Mutex<Option<Arc<dyn ProducerListener>>>,
}

impl ProducerStub {
    pub fn new(producer: Arc<BufferQueueProducer>) -> Self {
        Self {
            producer,
            callback_sink: parking_lot::Mutex::new(None),
        }
    }

    /// Install the reverse-direction listener channel (delivered by the
    /// hosting transport when the connection is set up)
    pub fn set_callback_sink(&self, sink: Arc<dyn ProducerListener>) {
        *self.callback_sink.lock() = Some(sink);
    }

    pub fn producer(&self) -> &Arc<BufferQueueProducer> {
        &self.producer
    }

    pub fn dispatch(&self, frame: &[u8]) -> Vec<u8> {
        match self.try_dispatch(frame) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(unique_id = self.producer.unique_id(), %err, "dispatch failed");
                encode_error_reply(&err)
            }
        }
    }

    fn request_reply(reply: RequestBufferReply) -> Result<Vec<u8>> {
        encode_reply(
            &(WireRequestReply {
                sequence: reply.sequence,
                buffer: reply.buffer.as_deref().map(BufferDescriptor::from_buffer),
                fence: FenceDescriptor::from_fence(&reply.fence),
                extra: reply.extra_data,
                deleting: reply.deleting_buffers,
            })
        )
    }

    fn try_dispatch(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let (opcode, payload) = decode_frame(frame)?;
        let op = ProducerOp::try_from(opcode)?;
        let producer = &self.producer;

        match op {
            ProducerOp::GetInitInfo => encode_reply(producer.init_info()),
            ProducerOp::RequestBuffer => {
                let args: RequestArgs = decode_payload(payload)?;
                Self::request_reply(producer.request_buffer_remote(&args.config)?)
            }
            ProducerOp::RequestBuffers => {
                let args: RequestBuffersArgs = decode_payload(payload)?;
                let replies = producer.request_buffers_remote(&args.config, args.count)?;
                let wire: Vec<WireRequestReply> = replies
                    .into_iter()
                    .map(|reply| WireRequestReply {
                        sequence: reply.sequence,
                        buffer: reply.buffer.as_deref().map(BufferDescriptor::from_buffer),
                        fence: FenceDescriptor::from_fence(&reply.fence),
                        extra: reply.extra_data,
                        deleting: reply.deleting_buffers,
                    })
                    .collect();
                encode_reply(&wire)
            }
            ProducerOp::RequestAndDetachBuffer => {
                let args: RequestArgs = decode_payload(payload)?;
                Self::request_reply(producer.request_and_detach_remote(&args.config)?)
            }
            ProducerOp::CancelBuffer => {
                let args: CancelArgs = decode_payload(payload)?;
                producer.cancel_buffer(args.sequence, args.extra)?;
                encode_reply(&())
            }
            ProducerOp::FlushBuffer => {
                let args: FlushArgs = decode_payload(payload)?;
                producer.flush_buffer(args.sequence, args.extra, args.fence.to_fence(), &args.config)?;
                encode_reply(&())
            }
            ProducerOp::FlushBuffers => {
                let args: FlushBatchArgs = decode_payload(payload)?;
                for item in args.items {
                    producer.flush_buffer(
                        item.sequence,
                        item.extra,
                        item.fence.to_fence(),
                        &item.config
                    )?;
                }
                encode_reply(&())
            }
            ProducerOp::AttachToQueue => {
                let args: DetachArgs = decode_payload(payload)?;
                producer.attach_buffer_to_queue(args.buffer.open()?)?;
                encode_reply(&())
            }
            ProducerOp::DetachFromQueue => {
                let args: DetachArgs = decode_payload(payload)?;
                producer.detach_buffer_from_queue(&args.buffer.open()?)?;
                encode_reply(&())
            }
            ProducerOp::AttachBuffer => {
                let args: AttachArgs = decode_payload(payload)?;
                producer.attach_buffer(&args.buffer.open()?, args.timeout_ms)?;
                encode_reply(&())
            }
            ProducerOp::DetachBuffer => {
                let args: DetachArgs = decode_payload(payload)?;
                producer.detach_buffer(&args.buffer.open()?)?;
                encode_reply(&())
            }
            ProducerOp::AttachAndFlushBuffer => {
                let args: AttachAndFlushArgs = decode_payload(payload)?;
                producer.attach_and_flush(
                    args.buffer.open()?,
                    args.extra,
                    args.fence.to_fence(),
                    &args.config,
                    args.need_map
                )?;
                encode_reply(&())
            }
            ProducerOp::GetQueueSize => encode_reply(&producer.queue_size()),
            ProducerOp::SetQueueSize => {
                producer.set_queue_size(decode_payload(payload)?)?;
                encode_reply(&())
            }
            ProducerOp::GetName => encode_reply(&producer.name()),
            ProducerOp::GetDefaultWidth => encode_reply(&producer.default_width()),
            ProducerOp::GetDefaultHeight => encode_reply(&producer.default_height()),
            ProducerOp::GetDefaultUsage => encode_reply(&producer.default_usage().bits()),
            ProducerOp::SetDefaultUsage => {
                let bits: u64 = decode_payload(payload)?;
                producer.set_default_usage(BufferUsage::from_bits_retain(bits));
                encode_reply(&())
            }
            ProducerOp::GetUniqueId => encode_reply(&producer.unique_id()),
            ProducerOp::CleanCache => {
                let args: CleanCacheArgs = decode_payload(payload)?;
                encode_reply(&producer.clean_cache(args.clean_all)?)
            }
            ProducerOp::RegisterReleaseListener => {
                let args: RegisterReleaseListenerArgs = decode_payload(payload)?;
                let sink = self.callback_sink
                    .lock()
                    .clone()
                    .ok_or_else(|| FlipqError::not_support("no callback channel bound"))?;
                producer.register_release_listener(sink, args.seq_and_fence);
                encode_reply(&())
            }
            ProducerOp::UnregisterReleaseListener => {
                producer.unregister_release_listener();
                encode_reply(&())
            }
            ProducerOp::RegisterReleaseListenerWithFence => {
                let sink = self.callback_sink
                    .lock()
                    .clone()
                    .ok_or_else(|| FlipqError::not_support("no callback channel bound"))?;
                producer.register_release_listener_with_fence(sink);
                encode_reply(&())
            }
            ProducerOp::UnregisterReleaseListenerWithFence => {
                producer.unregister_release_listener_with_fence();
                encode_reply(&())
            }
            ProducerOp::SetTransform => {
                let value: u32 = decode_payload(payload)?;
                producer.set_transform(TransformType::from_wire(value)?)?;
                encode_reply(&())
            }
            ProducerOp::GetTransform => encode_reply(&(producer.transform() as u32)),
            ProducerOp::Connect => {
                producer.connect()?;
                encode_reply(&())
            }
            ProducerOp::Disconnect => encode_reply(&producer.disconnect()?),
            ProducerOp::ConnectStrictly => {
                producer.connect_strictly()?;
                encode_reply(&())
            }
            ProducerOp::DisconnectStrictly => {
                producer.disconnect_strictly()?;
                encode_reply(&())
            }
            ProducerOp::SetScalingMode => {
                let args: ScalingModeArgs = decode_payload(payload)?;
                producer.set_scaling_mode(args.sequence, args.mode)?;
                encode_reply(&())
            }
            ProducerOp::SetScalingModeAll => {
                let mode: ScalingMode = decode_payload(payload)?;
                producer.set_scaling_mode_all(mode);
                encode_reply(&())
            }
            ProducerOp::SetMetadata => {
                let args: MetadataArgs = decode_payload(payload)?;
                producer.set_metadata(args.sequence, args.records)?;
                encode_reply(&())
            }
            ProducerOp::SetMetadataSet => {
                let args: MetadataSetArgs = decode_payload(payload)?;
                producer.set_metadata_set(args.sequence, args.key, args.data)?;
                encode_reply(&())
            }
            ProducerOp::SetTunnelHandle => {
                let args: TunnelHandleArgs = decode_payload(payload)?;
                producer.set_tunnel_handle(args.handle)?;
                encode_reply(&())
            }
            ProducerOp::GoBackground => {
                producer.go_background()?;
                encode_reply(&())
            }
            ProducerOp::GetPresentTimestamp => {
                let args: PresentTimestampArgs = decode_payload(payload)?;
                encode_reply(&producer.present_timestamp(args.sequence, args.kind)?)
            }
            ProducerOp::GetLastFlushedBuffer => {
                let args: LastFlushedArgs = decode_payload(payload)?;
                let reply = producer.get_last_flushed_buffer(args.use_new_matrix)?;
                encode_reply(
                    &(WireLastFlushedReply {
                        buffer: BufferDescriptor::from_buffer(&reply.buffer),
                        fence: FenceDescriptor::from_fence(&reply.fence),
                        matrix: reply.matrix,
                    })
                )
            }
            ProducerOp::AcquireLastFlushedBuffer => {
                let args: LastFlushedArgs = decode_payload(payload)?;
                let reply = producer.acquire_last_flushed_buffer(args.use_new_matrix)?;
                encode_reply(
                    &(WireLastFlushedReply {
                        buffer: BufferDescriptor::from_buffer(&reply.buffer),
                        fence: FenceDescriptor::from_fence(&reply.fence),
                        matrix: reply.matrix,
                    })
                )
            }
            ProducerOp::ReleaseLastFlushedBuffer => {
                producer.release_last_flushed_buffer(decode_payload(payload)?)?;
                encode_reply(&())
            }
            ProducerOp::GetTransformHint => encode_reply(&(producer.transform_hint() as u32)),
            ProducerOp::SetTransformHint => {
                let value: u32 = decode_payload(payload)?;
                producer.set_transform_hint(TransformType::from_wire(value)?)?;
                encode_reply(&())
            }
            ProducerOp::SetBufferHold => {
                producer.set_buffer_hold(decode_payload(payload)?);
                encode_reply(&())
            }
            ProducerOp::SetBufferName => {
                let name: String = decode_payload(payload)?;
                producer.set_buffer_name(name);
                encode_reply(&())
            }
            ProducerOp::SetBufferReallocFlag => {
                producer.set_buffer_realloc_flag(decode_payload(payload)?);
                encode_reply(&())
            }
            ProducerOp::GetSourceType => encode_reply(&producer.source_type()),
            ProducerOp::SetSourceType => {
                let source: SourceType = decode_payload(payload)?;
                producer.set_source_type(source);
                encode_reply(&())
            }
            ProducerOp::GetAppFrameworkType => encode_reply(&producer.app_framework_type()),
            ProducerOp::SetAppFrameworkType => {
                let kind: String = decode_payload(payload)?;
                producer.set_app_framework_type(kind)?;
                encode_reply(&())
            }
            ProducerOp::SetHdrWhitePointBrightness => {
                producer.set_hdr_white_point_brightness(decode_payload(payload)?);
                encode_reply(&())
            }
            ProducerOp::SetSdrWhitePointBrightness => {
                producer.set_sdr_white_point_brightness(decode_payload(payload)?);
                encode_reply(&())
            }
            ProducerOp::SetGlobalAlpha => {
                producer.set_global_alpha(decode_payload(payload)?);
                encode_reply(&())
            }
            ProducerOp::SetNoblockMode => {
                producer.set_noblock_mode(decode_payload(payload)?);
                encode_reply(&())
            }
            ProducerOp::GetRotatingBufferCount => encode_reply(&producer.rotating_buffer_count()),
            ProducerOp::SetRotatingBufferCount => {
                producer.set_rotating_buffer_count(decode_payload(payload)?)?;
                encode_reply(&())
            }
            ProducerOp::SetFrameGravity => {
                producer.set_frame_gravity(decode_payload(payload)?)?;
                encode_reply(&())
            }
            ProducerOp::SetFixedRotation => {
                producer.set_fixed_rotation(decode_payload(payload)?)?;
                encode_reply(&())
            }
            ProducerOp::RegisterPropertyListener => {
                let sink = self.callback_sink
                    .lock()
                    .clone()
                    .ok_or_else(|| FlipqError::not_support("no callback channel bound"))?;
                producer.register_property_listener(sink);
                encode_reply(&())
            }
            ProducerOp::UnregisterPropertyListener => {
                producer.unregister_property_listener();
                encode_reply(&())
            }
            ProducerOp::PreAllocBuffers => {
                let args: PreAllocArgs = decode_payload(payload)?;
                producer.pre_alloc_buffers(&args.config, args.count)?;
                encode_reply(&())
            }
            ProducerOp::SetLppShareFd => {
                let args: LppShareFdArgs = decode_payload(payload)?;
                let file = if args.attach {
                    let dup = unsafe { libc::dup(args.fd) };
                    if dup < 0 {
                        return Err(FlipqError::invalid_args("lpp fd dup failed"));
                    }
                    Some(unsafe { <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(dup) })
                } else {
                    None
                };
                producer.set_lpp_share_fd(file)?;
                encode_reply(&())
            }
            ProducerOp::SetAlphaType => {
                let alpha: AlphaType = decode_payload(payload)?;
                producer.set_alpha_type(alpha);
                encode_reply(&())
            }
            ProducerOp::CheckConnection => {
                producer.check_connection()?;
                encode_reply(&())
            }
        }
    }
}
