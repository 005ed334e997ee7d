//! Consumer facade: a thin forwarding wrapper owning the listener
//! registrations. The delete-buffer listeners it installs run under the
//! queue mutex during cache eviction and must not call back into the
//! queue.

use std::fs::File;
use std::sync::Arc;

use crate::buffer::SurfaceBuffer;
use crate::error::Result;
use crate::fence::SyncFence;
use crate::queue::{
    AcquireReply,
    BufferQueue,
    ConsumerListener,
    InvokerType,
    LastFlushedReply,
    OnDeleteFn,
    OnReleaseFn,
    ProducerListener,
    QueueSnapshot,
};
use crate::types::{
    BufferUsage,
    HdrMetaDataRecord,
    HdrMetaDataType,
    PresentTimestamp,
    ScalingMode,
    SourceType,
    TransformType,
    TunnelHandle,
};

pub struct BufferQueueConsumer {
    queue: Arc<BufferQueue>,
}

impl BufferQueueConsumer {
    pub fn new(queue: Arc<BufferQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<BufferQueue> {
        &self.queue
    }

    pub fn name(&self) -> String {
        self.queue.name().to_owned()
    }

    pub fn unique_id(&self) -> u64 {
        self.queue.unique_id()
    }

    // ========================================================================
    // Acquire / release
    // ========================================================================

    pub fn acquire_buffer(&self) -> Result<AcquireReply> {
        self.queue.acquire_buffer()
    }

    pub fn acquire_buffer_expect_present(
        &self,
        expect_present: i64,
        is_using_auto_timestamp: bool
    ) -> Result<AcquireReply> {
        self.queue.acquire_buffer_expect_present(expect_present, is_using_auto_timestamp)
    }

    pub fn release_buffer(&self, buffer: &Arc<SurfaceBuffer>, fence: SyncFence) -> Result<()> {
        self.queue.release_buffer(buffer, fence)
    }

    pub fn acquire_lpp_buffer(&self) -> Result<AcquireReply> {
        self.queue.acquire_lpp_buffer()
    }

    pub fn set_lpp_share_fd(&self, file: Option<File>) -> Result<()> {
        self.queue.set_lpp_share_fd(file)
    }

    pub fn set_lpp_draw_source(&self, is_shb_source: bool, is_rs_source: bool) -> Result<()> {
        self.queue.set_lpp_draw_source(is_shb_source, is_rs_source)
    }

    // ========================================================================
    // Attach / detach (consumer side)
    // ========================================================================

    pub fn attach_buffer(&self, buffer: &Arc<SurfaceBuffer>, timeout_ms: i32) -> Result<()> {
        self.queue.attach_buffer(buffer, timeout_ms)
    }

    pub fn detach_buffer(&self, buffer: &Arc<SurfaceBuffer>) -> Result<()> {
        self.queue.detach_buffer(buffer)
    }

    pub fn attach_buffer_to_queue(&self, buffer: Arc<SurfaceBuffer>) -> Result<()> {
        self.queue.attach_to_queue(buffer, InvokerType::Consumer)
    }

    /// Detach, optionally reserving the freed slot so the producer cannot
    /// race-fill the capacity before a matching re-attach
    pub fn detach_buffer_from_queue(
        &self,
        buffer: &Arc<SurfaceBuffer>,
        reserve_slot: bool
    ) -> Result<()> {
        self.queue.detach_from_queue(buffer, InvokerType::Consumer, reserve_slot)
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn register_consumer_listener(&self, listener: Arc<dyn ConsumerListener>) {
        self.queue.register_consumer_listener(listener)
    }

    pub fn unregister_consumer_listener(&self) {
        self.queue.unregister_consumer_listener()
    }

    pub fn register_release_listener(&self, func: OnReleaseFn) {
        self.queue.register_release_listener(func)
    }

    /// Latched once per thread kind (main / redraw); later calls no-op
    pub fn register_delete_buffer_listener(&self, func: OnDeleteFn, for_redraw: bool) {
        self.queue.register_delete_buffer_listener(func, for_redraw)
    }

    pub fn register_producer_release_listener(
        &self,
        listener: Arc<dyn ProducerListener>,
        seq_and_fence: bool
    ) {
        self.queue.register_producer_release_listener(listener, seq_and_fence)
    }

    // ========================================================================
    // Queue lifecycle
    // ========================================================================

    pub fn set_status(&self, status: bool) {
        self.queue.set_status(status)
    }

    pub fn status(&self) -> bool {
        self.queue.status()
    }

    pub fn clean_cache(&self, clean_all: bool) -> Result<Option<u32>> {
        self.queue.clean_cache(clean_all)
    }

    pub fn go_background(&self) -> Result<()> {
        self.queue.go_background()
    }

    pub fn on_consumer_died(&self) -> Result<()> {
        self.queue.on_consumer_died()
    }

    pub fn set_queue_size(&self, size: u32) -> Result<()> {
        self.queue.set_queue_size(size)
    }

    pub fn queue_size(&self) -> u32 {
        self.queue.queue_size()
    }

    pub fn set_max_queue_size(&self, size: u32) -> Result<()> {
        self.queue.set_max_queue_size(size)
    }

    pub fn max_queue_size(&self) -> u32 {
        self.queue.max_queue_size()
    }

    pub fn set_default_size(&self, width: i32, height: i32) -> Result<()> {
        self.queue.set_default_size(width, height)
    }

    pub fn set_default_usage(&self, usage: BufferUsage) {
        self.queue.set_default_usage(usage)
    }

    pub fn set_drop_frame_level(&self, level: i32) -> Result<()> {
        self.queue.set_drop_frame_level(level)
    }

    pub fn set_source_type(&self, source: SourceType) {
        self.queue.set_source_type(source)
    }

    pub fn source_type(&self) -> SourceType {
        self.queue.source_type()
    }

    pub fn consumer_request_cpu_access(&self, on: bool) {
        self.queue.consumer_request_cpu_access(on)
    }

    // ========================================================================
    // Per-slot and surface state
    // ========================================================================

    pub fn get_last_flushed_buffer(&self, use_new_matrix: bool) -> Result<LastFlushedReply> {
        self.queue.get_last_flushed_buffer(use_new_matrix, false)
    }

    pub fn acquire_last_flushed_buffer(&self, use_new_matrix: bool) -> Result<LastFlushedReply> {
        self.queue.acquire_last_flushed_buffer(use_new_matrix)
    }

    pub fn release_last_flushed_buffer(&self, sequence: u32) -> Result<()> {
        self.queue.release_last_flushed_buffer(sequence)
    }

    pub fn scaling_mode(&self, sequence: u32) -> Result<ScalingMode> {
        self.queue.scaling_mode(sequence)
    }

    pub fn metadata_type(&self, sequence: u32) -> Result<HdrMetaDataType> {
        self.queue.metadata_type(sequence)
    }

    pub fn metadata(&self, sequence: u32) -> Result<Vec<HdrMetaDataRecord>> {
        self.queue.metadata(sequence)
    }

    pub fn metadata_set(&self, sequence: u32) -> Result<(u32, Vec<u8>)> {
        self.queue.metadata_set(sequence)
    }

    pub fn set_present_timestamp(&self, sequence: u32, timestamp: PresentTimestamp) -> Result<()> {
        self.queue.set_present_timestamp(sequence, timestamp)
    }

    pub fn transform(&self) -> TransformType {
        self.queue.transform()
    }

    pub fn set_transform(&self, transform: TransformType) -> Result<()> {
        self.queue.set_transform(transform)
    }

    pub fn tunnel_handle(&self) -> Option<TunnelHandle> {
        self.queue.tunnel_handle()
    }

    pub fn available_buffer_count(&self) -> u32 {
        self.queue.available_buffer_count()
    }

    pub fn query_if_buffer_available(&self) -> bool {
        self.queue.query_if_buffer_available()
    }

    pub fn is_buffer_in_cache(&self, sequence: u32) -> bool {
        self.queue.is_buffer_in_cache(sequence)
    }

    pub fn last_consume_time(&self) -> i64 {
        self.queue.last_consume_time()
    }

    pub fn hdr_white_point_brightness(&self) -> f32 {
        self.queue.hdr_white_point_brightness()
    }

    pub fn sdr_white_point_brightness(&self) -> f32 {
        self.queue.sdr_white_point_brightness()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn dump(&self, result: &mut String) {
        self.queue.dump(result)
    }
}
