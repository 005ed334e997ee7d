//! Producer facade.
//!
//! Owns the connection state (one pid at a time, strict-disconnect
//! gating) and a local `sequence -> buffer` cache so buffer handles never
//! cross the wire twice. Every remote entry point goes through
//! [`check_connection`](BufferQueueProducer::check_connection) first.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{ debug, warn };

use crate::buffer::SurfaceBuffer;
use crate::error::{ FlipqError, Result };
use crate::fence::SyncFence;
use crate::queue::{ BufferQueue, ProducerInitInfo, ProducerListener, RequestBufferReply };
use crate::types::{
    AlphaType,
    BufferFlushConfig,
    BufferRequestConfig,
    BufferUsage,
    ExtraData,
    HdrMetaDataRecord,
    PresentTimestampType,
    ScalingMode,
    SourceType,
    TransformType,
    TunnelHandle,
};

/// Game-upscale hook: rewrites request geometry before it reaches the
/// queue (adaptive super-resolution clients render smaller than they
/// present)
pub trait ApsProcessor: Send + Sync {
    fn rewrite_request(&self, config: &mut BufferRequestConfig);
}

struct ConnectionState {
    connected_pid: i32,
    strict_mode: bool,
    strict_disconnected: bool,
}

/// A fully resolved producer-side request result: the buffer is always
/// present, taken from the local cache when the queue elided the handle
#[derive(Debug)]
pub struct ProducerRequestResult {
    pub buffer: Arc<SurfaceBuffer>,
    pub sequence: u32,
    pub fence: SyncFence,
    pub extra_data: ExtraData,
}

pub struct BufferQueueProducer {
    queue: Arc<BufferQueue>,
    init_info: ProducerInitInfo,
    state: Mutex<ConnectionState>,
    cache: Mutex<HashMap<u32, Arc<SurfaceBuffer>>>,
    /// One buffer kept alive across a CleanCache so the display pipeline
    /// can finish presenting it; dropped once the cache regrows to two
    pre_cache: Mutex<Option<Arc<SurfaceBuffer>>>,
    aps: Mutex<Option<Arc<dyn ApsProcessor>>>,
}

fn current_pid() -> i32 {
    Pid::this().as_raw()
}

impl BufferQueueProducer {
    pub fn new(queue: Arc<BufferQueue>) -> Self {
        let init_info = queue.producer_init_info();
        Self {
            queue,
            init_info,
            state: Mutex::new(ConnectionState {
                connected_pid: 0,
                strict_mode: false,
                strict_disconnected: false,
            }),
            cache: Mutex::new(HashMap::new()),
            pre_cache: Mutex::new(None),
            aps: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<BufferQueue> {
        &self.queue
    }

    pub fn init_info(&self) -> &ProducerInitInfo {
        &self.init_info
    }

    pub fn producer_id(&self) -> u64 {
        self.init_info.producer_id
    }

    pub fn unique_id(&self) -> u64 {
        self.queue.unique_id()
    }

    pub fn name(&self) -> String {
        self.queue.name().to_owned()
    }

    pub fn set_aps_processor(&self, processor: Option<Arc<dyn ApsProcessor>>) {
        *self.aps.lock() = processor;
    }

    // ========================================================================
    // Connection gating
    // ========================================================================

    /// Register the caller as the connected producer. The first caller
    /// wins; reconnecting from the same pid is idempotent.
    pub fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.strict_disconnected {
            return Err(FlipqError::ConsumerDisconnected);
        }
        let pid = current_pid();
        if state.connected_pid == 0 || state.connected_pid == pid {
            state.connected_pid = pid;
            self.queue.set_connected_pid(pid);
            Ok(())
        } else {
            Err(FlipqError::ConsumerIsConnected { pid: state.connected_pid })
        }
    }

    /// Traversed by every remote call before it touches the queue
    pub fn check_connection(&self) -> Result<()> {
        let state = self.state.lock();
        if state.strict_disconnected {
            return Err(FlipqError::ConsumerDisconnected);
        }
        if state.strict_mode && state.connected_pid != 0 && state.connected_pid != current_pid() {
            return Err(FlipqError::ConsumerIsConnected { pid: state.connected_pid });
        }
        Ok(())
    }

    /// Connect and refuse any other pid until a strict disconnect
    pub fn connect_strictly(&self) -> Result<()> {
        self.connect()?;
        self.state.lock().strict_mode = true;
        Ok(())
    }

    /// Disconnect and refuse all further producer traffic
    pub fn disconnect_strictly(&self) -> Result<()> {
        self.disconnect()?;
        let mut state = self.state.lock();
        state.strict_mode = false;
        state.strict_disconnected = true;
        Ok(())
    }

    /// Tear the connection down. The queue reports which sequence to pin
    /// as the pre-cache buffer; exactly that buffer survives locally and
    /// the sequence travels back so remote caches can do the same.
    pub fn disconnect(&self) -> Result<Option<u32>> {
        {
            let state = self.state.lock();
            let pid = current_pid();
            if state.connected_pid != 0 && state.connected_pid != pid {
                return Err(FlipqError::ConsumerIsConnected { pid: state.connected_pid });
            }
        }
        let pre_cache_seq = self.queue.clean_cache(false)?;
        self.queue.set_producer_cache_clean_flag(true);

        let mut cache = self.cache.lock();
        let retained = pre_cache_seq.and_then(|seq| cache.get(&seq).cloned());
        cache.clear();
        *self.pre_cache.lock() = retained;

        let mut state = self.state.lock();
        state.connected_pid = 0;
        self.queue.set_connected_pid(0);
        debug!(unique_id = self.unique_id(), ?pre_cache_seq, "producer disconnected");
        Ok(pre_cache_seq)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected_pid != 0
    }

    // ========================================================================
    // Request / flush / cancel
    // ========================================================================

    /// Remote request path: connect, forward, then reconcile the local
    /// cache with the reply (evict the deleting vector, install a newly
    /// shipped buffer, or resolve the elided handle from the cache)
    pub fn request_buffer(&self, config: &BufferRequestConfig) -> Result<ProducerRequestResult> {
        self.connect()?;
        let mut config = config.clone();
        if let Some(processor) = self.aps.lock().clone() {
            processor.rewrite_request(&mut config);
        }

        let reply = match self.queue.request_buffer(&config) {
            Ok(reply) => reply,
            Err(err) => {
                if err == FlipqError::NoConsumer {
                    self.cache.lock().clear();
                }
                return Err(err);
            }
        };
        self.install_reply(reply)
    }

    /// Remote request path used by the stub: the handle elision in the
    /// reply is preserved because the cache lives on the remote side
    pub fn request_buffer_remote(&self, config: &BufferRequestConfig) -> Result<RequestBufferReply> {
        self.connect()?;
        let mut config = config.clone();
        if let Some(processor) = self.aps.lock().clone() {
            processor.rewrite_request(&mut config);
        }
        match self.queue.request_buffer(&config) {
            Ok(reply) => {
                if let Some(buffer) = &reply.buffer {
                    self.tag_allocation(buffer);
                }
                Ok(reply)
            }
            Err(err) => {
                if err == FlipqError::NoConsumer {
                    self.cache.lock().clear();
                }
                Err(err)
            }
        }
    }

    /// Remote batch request; every reply ships its buffer descriptor
    pub fn request_buffers_remote(
        &self,
        config: &BufferRequestConfig,
        count: u32
    ) -> Result<Vec<RequestBufferReply>> {
        self.connect()?;
        self.queue.request_buffers(config, count)
    }

    /// Remote request-and-detach
    pub fn request_and_detach_remote(
        &self,
        config: &BufferRequestConfig
    ) -> Result<RequestBufferReply> {
        self.connect()?;
        self.queue.request_and_detach(config)
    }

    fn install_reply(&self, reply: RequestBufferReply) -> Result<ProducerRequestResult> {
        let mut cache = self.cache.lock();
        for sequence in &reply.deleting_buffers {
            cache.remove(sequence);
        }

        let buffer = match reply.buffer {
            Some(buffer) => {
                self.tag_allocation(&buffer);
                cache.insert(reply.sequence, buffer.clone());
                buffer
            }
            None =>
                match cache.get(&reply.sequence) {
                    Some(buffer) => buffer.clone(),
                    None => {
                        // cache desync: force the queue to re-ship handles
                        warn!(
                            unique_id = self.unique_id(),
                            sequence = reply.sequence,
                            "reply elided a buffer missing from the local cache"
                        );
                        drop(cache);
                        self.queue.set_producer_cache_clean_flag(true);
                        return Err(
                            FlipqError::unknown(format!("buffer {} not cached", reply.sequence))
                        );
                    }
                }
        };

        if cache.len() >= 2 {
            self.pre_cache.lock().take();
        }

        Ok(ProducerRequestResult {
            sequence: reply.sequence,
            fence: reply.fence,
            extra_data: reply.extra_data,
            buffer,
        })
    }

    /// Label the fresh allocation for memory accounting: the configured
    /// buffer name wins, then the source type, then a leak-tracking label
    fn tag_allocation(&self, buffer: &SurfaceBuffer) {
        let buffer_name = &self.init_info.buffer_name;
        let label = if !buffer_name.is_empty() {
            buffer_name.clone()
        } else {
            match self.queue.source_type() {
                SourceType::Default => format!("flipq-leak-{}", self.queue.name()),
                source => format!("{source:?}"),
            }
        };
        self.queue.allocator_tag(buffer, &label);
    }

    /// Batch request in one call; stops at the first non-OK core reply
    pub fn request_buffers(
        &self,
        config: &BufferRequestConfig,
        count: u32
    ) -> Result<Vec<ProducerRequestResult>> {
        self.connect()?;
        let replies = self.queue.request_buffers(config, count)?;
        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            results.push(self.install_reply(reply)?);
        }
        Ok(results)
    }

    /// Request and detach in one round-trip (buffer migration)
    pub fn request_and_detach(&self, config: &BufferRequestConfig) -> Result<ProducerRequestResult> {
        self.connect()?;
        let reply = self.queue.request_and_detach(config)?;
        self.install_reply(reply)
    }

    pub fn flush_buffer(
        &self,
        sequence: u32,
        extra_data: ExtraData,
        fence: SyncFence,
        config: &BufferFlushConfig
    ) -> Result<()> {
        self.check_connection()?;
        match self.queue.flush_buffer(sequence, extra_data, fence, config) {
            Err(FlipqError::NoConsumer) => {
                self.cache.lock().clear();
                Err(FlipqError::NoConsumer)
            }
            other => other,
        }
    }

    /// Attach a caller-provided buffer and flush it in a single round-trip
    pub fn attach_and_flush(
        &self,
        buffer: Arc<SurfaceBuffer>,
        extra_data: ExtraData,
        fence: SyncFence,
        config: &BufferFlushConfig,
        need_map: bool
    ) -> Result<()> {
        self.check_connection()?;
        let sequence = buffer.sequence();
        self.queue.attach_and_flush(buffer.clone(), extra_data, fence, config, need_map)?;
        self.cache.lock().insert(sequence, buffer);
        Ok(())
    }

    pub fn cancel_buffer(&self, sequence: u32, extra_data: ExtraData) -> Result<()> {
        self.check_connection()?;
        self.queue.cancel_buffer(sequence, extra_data)
    }

    // ========================================================================
    // Attach / detach
    // ========================================================================

    pub fn attach_buffer(&self, buffer: &Arc<SurfaceBuffer>, timeout_ms: i32) -> Result<()> {
        self.check_connection()?;
        self.queue.attach_buffer(buffer, timeout_ms)
    }

    pub fn detach_buffer(&self, buffer: &Arc<SurfaceBuffer>) -> Result<()> {
        self.check_connection()?;
        self.queue.detach_buffer(buffer)
    }

    pub fn attach_buffer_to_queue(&self, buffer: Arc<SurfaceBuffer>) -> Result<()> {
        self.check_connection()?;
        let sequence = buffer.sequence();
        self.queue.attach_to_queue(buffer.clone(), crate::queue::InvokerType::Producer)?;
        self.cache.lock().insert(sequence, buffer);
        Ok(())
    }

    pub fn detach_buffer_from_queue(&self, buffer: &Arc<SurfaceBuffer>) -> Result<()> {
        self.check_connection()?;
        self.queue.detach_from_queue(buffer, crate::queue::InvokerType::Producer, false)?;
        self.cache.lock().remove(&buffer.sequence());
        Ok(())
    }

    // ========================================================================
    // Pass-through surface state
    // ========================================================================

    pub fn queue_size(&self) -> u32 {
        self.queue.queue_size()
    }

    pub fn set_queue_size(&self, size: u32) -> Result<()> {
        self.queue.set_queue_size(size)
    }

    pub fn default_width(&self) -> i32 {
        self.queue.default_width()
    }

    pub fn default_height(&self) -> i32 {
        self.queue.default_height()
    }

    pub fn default_usage(&self) -> BufferUsage {
        self.queue.default_usage()
    }

    pub fn set_default_usage(&self, usage: BufferUsage) {
        self.queue.set_default_usage(usage)
    }

    /// Local caches (ours and every native window's) are gone after this;
    /// the queue re-ships handles on the next requests
    pub fn clean_cache(&self, clean_all: bool) -> Result<Option<u32>> {
        self.check_connection()?;
        let pre_cache = self.queue.clean_cache(clean_all)?;
        self.queue.set_producer_cache_clean_flag(true);
        self.cache.lock().clear();
        if clean_all {
            self.pre_cache.lock().take();
        }
        Ok(pre_cache)
    }

    pub fn go_background(&self) -> Result<()> {
        self.check_connection()?;
        self.queue.go_background()?;
        self.cache.lock().clear();
        Ok(())
    }

    pub fn set_transform(&self, transform: TransformType) -> Result<()> {
        self.queue.set_transform(transform)
    }

    pub fn transform(&self) -> TransformType {
        self.queue.transform()
    }

    pub fn set_transform_hint(&self, hint: TransformType) -> Result<()> {
        self.queue.set_transform_hint(hint, self.init_info.producer_id)
    }

    pub fn transform_hint(&self) -> TransformType {
        self.queue.transform_hint()
    }

    pub fn set_scaling_mode(&self, sequence: u32, mode: ScalingMode) -> Result<()> {
        self.queue.set_scaling_mode(sequence, mode)
    }

    pub fn set_scaling_mode_all(&self, mode: ScalingMode) {
        self.queue.set_scaling_mode_all(mode)
    }

    pub fn set_metadata(&self, sequence: u32, metadata: Vec<HdrMetaDataRecord>) -> Result<()> {
        self.queue.set_metadata(sequence, metadata)
    }

    pub fn set_metadata_set(&self, sequence: u32, key: u32, metadata: Vec<u8>) -> Result<()> {
        self.queue.set_metadata_set(sequence, key, metadata)
    }

    pub fn set_tunnel_handle(&self, handle: Option<TunnelHandle>) -> Result<()> {
        self.queue.set_tunnel_handle(handle)
    }

    pub fn present_timestamp(&self, sequence: u32, kind: PresentTimestampType) -> Result<i64> {
        self.queue.present_timestamp(sequence, kind)
    }

    pub fn get_last_flushed_buffer(&self, use_new_matrix: bool) -> Result<crate::queue::LastFlushedReply> {
        self.queue.get_last_flushed_buffer(use_new_matrix, false)
    }

    pub fn acquire_last_flushed_buffer(&self, use_new_matrix: bool) -> Result<crate::queue::LastFlushedReply> {
        self.queue.acquire_last_flushed_buffer(use_new_matrix)
    }

    pub fn release_last_flushed_buffer(&self, sequence: u32) -> Result<()> {
        self.queue.release_last_flushed_buffer(sequence)
    }

    pub fn set_buffer_hold(&self, hold: bool) {
        self.queue.set_buffer_hold(hold)
    }

    pub fn set_buffer_name(&self, name: impl Into<String>) {
        self.queue.set_buffer_name(name)
    }

    pub fn set_buffer_realloc_flag(&self, flag: bool) {
        self.queue.set_buffer_realloc_flag(flag)
    }

    pub fn set_source_type(&self, source: SourceType) {
        self.queue.set_source_type(source)
    }

    pub fn source_type(&self) -> SourceType {
        self.queue.source_type()
    }

    pub fn set_app_framework_type(&self, kind: impl Into<String>) -> Result<()> {
        self.queue.set_app_framework_type(kind)
    }

    pub fn app_framework_type(&self) -> String {
        self.queue.app_framework_type()
    }

    pub fn set_hdr_white_point_brightness(&self, brightness: f32) {
        self.queue.set_hdr_white_point_brightness(brightness)
    }

    pub fn set_sdr_white_point_brightness(&self, brightness: f32) {
        self.queue.set_sdr_white_point_brightness(brightness)
    }

    pub fn set_global_alpha(&self, alpha: i32) {
        self.queue.set_global_alpha(alpha)
    }

    pub fn set_noblock_mode(&self, noblock: bool) {
        self.queue.set_noblock_mode(noblock)
    }

    pub fn rotating_buffer_count(&self) -> u32 {
        self.queue.rotating_buffer_count()
    }

    pub fn set_rotating_buffer_count(&self, count: u32) -> Result<()> {
        self.queue.set_rotating_buffer_count(count)
    }

    pub fn set_frame_gravity(&self, gravity: i32) -> Result<()> {
        self.queue.set_frame_gravity(gravity)
    }

    pub fn set_fixed_rotation(&self, rotation: i32) -> Result<()> {
        self.queue.set_fixed_rotation(rotation)
    }

    pub fn set_alpha_type(&self, alpha_type: AlphaType) {
        self.queue.set_alpha_type(alpha_type)
    }

    pub fn pre_alloc_buffers(&self, config: &BufferRequestConfig, count: u32) -> Result<()> {
        self.check_connection()?;
        self.queue.pre_alloc_buffers(config, count)
    }

    pub fn set_lpp_share_fd(&self, file: Option<File>) -> Result<()> {
        self.check_connection()?;
        self.queue.set_lpp_share_fd(file)
    }

    /// Register for release notifications; the seq-and-fence variant also
    /// records the calling pid so the pre-hand-out only fires for the
    /// connected producer
    pub fn register_release_listener(
        &self,
        listener: Arc<dyn ProducerListener>,
        seq_and_fence: bool
    ) {
        self.queue.register_producer_release_listener(listener, seq_and_fence);
        if seq_and_fence {
            self.queue.set_listener_pid(current_pid());
        }
    }

    pub fn unregister_release_listener(&self) {
        self.queue.unregister_producer_release_listener();
    }

    pub fn register_release_listener_with_fence(&self, listener: Arc<dyn ProducerListener>) {
        self.queue.register_producer_release_listener_with_fence(listener);
    }

    pub fn unregister_release_listener_with_fence(&self) {
        self.queue.unregister_producer_release_listener_with_fence();
    }

    pub fn register_property_listener(&self, listener: Arc<dyn ProducerListener>) {
        self.queue.register_producer_property_listener(listener, self.init_info.producer_id);
    }

    pub fn unregister_property_listener(&self) {
        self.queue.unregister_producer_property_listener(self.init_info.producer_id);
    }

    /// Number of buffers the producer currently caches (tests and dumps)
    pub fn cached_buffer_count(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn has_pre_cache_buffer(&self) -> bool {
        self.pre_cache.lock().is_some()
    }
}
