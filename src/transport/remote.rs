//! Client-side encoder: a producer handle whose queue lives behind a
//! [`Transport`]. Keeps the remote-side buffer cache so handles are only
//! reopened when the service actually ships a descriptor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::buffer::SurfaceBuffer;
use crate::error::{ FlipqError, Result };
use crate::fence::SyncFence;
use crate::producer::ProducerRequestResult;
use crate::queue::ProducerInitInfo;
use crate::types::{ BufferFlushConfig, BufferRequestConfig, ExtraData, TransformType };

use super::records::*;
use super::wire::{ decode_payload, decode_reply, encode_frame, encode_payload, FenceDescriptor };
use super::{ ProducerOp, Transport };

pub struct RemoteProducer {
    transport: Arc<dyn Transport>,
    cache: Mutex<HashMap<u32, Arc<SurfaceBuffer>>>,
}

impl RemoteProducer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// One framed round-trip: encode args, call, split the reply code,
    /// decode the record
    pub fn call_op<A: Serialize, R: DeserializeOwned>(&self, op: ProducerOp, args: &A) -> Result<R> {
        let payload = encode_payload(args)?;
        let frame = encode_frame(op as u32, &payload);
        let reply = self.transport.call(&frame)?;
        decode_payload(decode_reply(&reply)?)
    }

    pub fn init_info(&self) -> Result<ProducerInitInfo> {
        self.call_op(ProducerOp::GetInitInfo, &())
    }

    pub fn connect(&self) -> Result<()> {
        self.call_op(ProducerOp::Connect, &())
    }

    pub fn check_connection(&self) -> Result<()> {
        self.call_op(ProducerOp::CheckConnection, &())
    }

    /// Request a slot, reconciling the local cache with the reply: evict
    /// everything named in the deleting vector, install a shipped
    /// descriptor, or resolve an elided handle from the cache
    pub fn request_buffer(&self, config: &BufferRequestConfig) -> Result<ProducerRequestResult> {
        let reply: WireRequestReply = self.call_op(
            ProducerOp::RequestBuffer,
            &(RequestArgs { config: config.clone() })
        )?;
        self.install_wire_reply(reply)
    }

    fn install_wire_reply(&self, reply: WireRequestReply) -> Result<ProducerRequestResult> {
        let mut cache = self.cache.lock();
        for sequence in &reply.deleting {
            cache.remove(sequence);
        }
        let buffer = match reply.buffer {
            Some(descriptor) => {
                let buffer = descriptor.open()?;
                cache.insert(reply.sequence, buffer.clone());
                buffer
            }
            None =>
                cache
                    .get(&reply.sequence)
                    .cloned()
                    .ok_or_else(||
                        FlipqError::unknown(format!("buffer {} not cached", reply.sequence))
                    )?,
        };
        Ok(ProducerRequestResult {
            sequence: reply.sequence,
            fence: reply.fence.to_fence(),
            extra_data: reply.extra,
            buffer,
        })
    }

    pub fn request_buffers(
        &self,
        config: &BufferRequestConfig,
        count: u32
    ) -> Result<Vec<ProducerRequestResult>> {
        let replies: Vec<WireRequestReply> = self.call_op(
            ProducerOp::RequestBuffers,
            &(RequestBuffersArgs { config: config.clone(), count })
        )?;
        replies
            .into_iter()
            .map(|reply| self.install_wire_reply(reply))
            .collect()
    }

    pub fn flush_buffer(
        &self,
        sequence: u32,
        extra: ExtraData,
        fence: &SyncFence,
        config: &BufferFlushConfig
    ) -> Result<()> {
        self.call_op(
            ProducerOp::FlushBuffer,
            &(FlushArgs {
                sequence,
                extra,
                fence: FenceDescriptor::from_fence(fence),
                config: config.clone(),
            })
        )
    }

    pub fn cancel_buffer(&self, sequence: u32, extra: ExtraData) -> Result<()> {
        self.call_op(ProducerOp::CancelBuffer, &(CancelArgs { sequence, extra }))
    }

    /// Disconnect and retain exactly the pre-cache buffer the service
    /// names, so the display pipeline can finish the previous frame
    pub fn disconnect(&self) -> Result<Option<u32>> {
        let pre_cache: Option<u32> = self.call_op(ProducerOp::Disconnect, &())?;
        let mut cache = self.cache.lock();
        let retained = pre_cache.and_then(|sequence| cache.remove(&sequence));
        cache.clear();
        if let (Some(sequence), Some(buffer)) = (pre_cache, retained) {
            cache.insert(sequence, buffer);
        }
        Ok(pre_cache)
    }

    pub fn queue_size(&self) -> Result<u32> {
        self.call_op(ProducerOp::GetQueueSize, &())
    }

    pub fn set_queue_size(&self, size: u32) -> Result<()> {
        self.call_op(ProducerOp::SetQueueSize, &size)
    }

    pub fn name(&self) -> Result<String> {
        self.call_op(ProducerOp::GetName, &())
    }

    pub fn unique_id(&self) -> Result<u64> {
        self.call_op(ProducerOp::GetUniqueId, &())
    }

    pub fn set_transform(&self, transform: TransformType) -> Result<()> {
        self.call_op(ProducerOp::SetTransform, &(transform as u32))
    }

    pub fn transform(&self) -> Result<TransformType> {
        let value: u32 = self.call_op(ProducerOp::GetTransform, &())?;
        TransformType::from_wire(value)
    }

    pub fn clean_cache(&self, clean_all: bool) -> Result<Option<u32>> {
        let pre_cache: Option<u32> = self.call_op(
            ProducerOp::CleanCache,
            &(CleanCacheArgs { clean_all })
        )?;
        self.cache.lock().clear();
        Ok(pre_cache)
    }

    pub fn cached_buffer_count(&self) -> usize {
        self.cache.lock().len()
    }
}
