//! The BufferQueue state machine.
//!
//! One logical component guarded by a single mutex, accessed through the
//! producer and consumer facades. Slots move through the states of
//! [`BufferState`] along two FIFO lanes:
//!
//! ```text
//!                 request                    flush
//!   free list  ───────────►  Requested  ───────────►  dirty list
//!      ▲                        │ cancel                   │ acquire
//!      │ release                ▼                          ▼
//!   Released  ◄────────────  Acquired  ◄───────────────  Flushed
//! ```
//!
//! Suspension points (`wait_req`, `wait_attach`, the allocation guard)
//! all ride on the queue mutex; allocator calls and listener callbacks
//! always run with that mutex released.

mod acquire;
mod listeners;
pub mod lpp;
mod request;
mod slot;

pub use listeners::{
    ConsumerListener,
    OnDeleteFn,
    OnReleaseFn,
    ProducerListener,
    SurfaceProperty,
};
pub use slot::{ BufferSlot, BufferState };

use std::collections::{ HashMap, VecDeque };
use std::sync::Arc;
use std::sync::atomic::{ AtomicU64, Ordering };

use parking_lot::{ Condvar, Mutex, MutexGuard };
use serde::{ Deserialize, Serialize };
use tracing::{ debug, warn };

use crate::buffer::{ Allocator, SurfaceBuffer };
use crate::constants::{
    APP_FRAMEWORK_TYPE_MAX_LEN,
    DEFAULT_QUEUE_SIZE,
    GLOBAL_ALPHA_MAX,
    GLOBAL_ALPHA_MIN,
    INVALID_SEQUENCE,
    MAX_FIXED_ROTATION,
    MAX_FRAME_GRAVITY,
    MAX_ROTATING_BUFFER_COUNT,
    MIN_FIXED_ROTATION,
    MIN_FRAME_GRAVITY,
};
use crate::error::{ FlipqError, Result };
use crate::fence::SyncFence;
use crate::types::{
    AlphaType,
    BufferUsage,
    ExtraData,
    HdrMetaDataRecord,
    HdrMetaDataType,
    PresentTimestamp,
    PresentTimestampType,
    Rect,
    ScalingMode,
    SourceType,
    TransformType,
    TunnelHandle,
};

use listeners::ListenerRegistry;
use lpp::LppState;

static NEXT_PRODUCER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

fn next_unique_id() -> u64 {
    let pid = std::process::id() as u64;
    (pid << 32) | NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which side of the queue performs an attach/detach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokerType {
    Producer,
    Consumer,
}

/// Reply to a producer request
#[derive(Debug)]
pub struct RequestBufferReply {
    pub sequence: u32,
    /// `None` when the producer already caches this buffer
    pub buffer: Option<Arc<SurfaceBuffer>>,
    /// Release fence to wait on before CPU access
    pub fence: SyncFence,
    pub extra_data: ExtraData,
    /// Cache-invalidation vector drained from the deleting list
    pub deleting_buffers: Vec<u32>,
}

/// Reply to a consumer acquire
#[derive(Debug)]
pub struct AcquireReply {
    pub buffer: Arc<SurfaceBuffer>,
    pub fence: SyncFence,
    pub ui_timestamp: i64,
    pub damages: Vec<Rect>,
}

/// Reply to a last-flushed-buffer query
#[derive(Debug)]
pub struct LastFlushedReply {
    pub buffer: Arc<SurfaceBuffer>,
    pub fence: SyncFence,
    pub matrix: [f32; crate::matrix::MATRIX_SIZE],
}

/// Initial handshake data for a connecting producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerInitInfo {
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub unique_id: u64,
    pub producer_id: u64,
    pub transform_hint: TransformType,
    pub buffer_name: String,
}

/// Read-only view of the bookkeeping, for dump paths and tests
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub cache: Vec<(u32, BufferState)>,
    pub free: Vec<u32>,
    pub dirty: Vec<u32>,
    pub deleting: Vec<u32>,
    pub queue_size: u32,
}

/// Everything behind the queue mutex
pub(crate) struct QueueCore {
    pub cache: HashMap<u32, BufferSlot>,
    pub free_list: VecDeque<u32>,
    pub dirty_list: VecDeque<u32>,
    pub deleting_list: Vec<u32>,
    pub queue_size: u32,
    pub max_queue_size: u32,
    pub default_width: i32,
    pub default_height: i32,
    pub default_usage: BufferUsage,
    pub transform: TransformType,
    pub transform_hint: TransformType,
    pub last_flushed_sequence: u32,
    pub last_flushed_fence: SyncFence,
    pub last_flushed_transform: TransformType,
    pub last_flushed_desired_present: i64,
    pub acquire_last_flushed_seq: u32,
    pub status: bool,
    pub batch_mode: bool,
    pub buffer_hold: bool,
    pub noblock_mode: bool,
    pub drop_frame_level: i32,
    pub scaling_mode: ScalingMode,
    pub source_type: SourceType,
    pub app_framework_type: String,
    pub hdr_white_point_brightness: f32,
    pub sdr_white_point_brightness: f32,
    pub alpha_type: AlphaType,
    pub frame_gravity: i32,
    pub fixed_rotation: i32,
    pub rotating_buffer_count: u32,
    pub connected_pid: i32,
    pub listener_pid: i32,
    pub detach_reserved_slots: u32,
    pub allocating: bool,
    pub tunnel_handle: Option<TunnelHandle>,
    pub buffer_name: String,
    pub priority_alloc: bool,
    pub producer_cache_clean: bool,
    pub producer_cache_list: Vec<u32>,
    pub cpu_accessible: bool,
    pub last_consume_time: i64,
    pub lpp: LppState,
}

impl QueueCore {
    fn new() -> Self {
        Self {
            cache: HashMap::new(),
            free_list: VecDeque::new(),
            dirty_list: VecDeque::new(),
            deleting_list: Vec::new(),
            queue_size: DEFAULT_QUEUE_SIZE,
            max_queue_size: 0,
            default_width: 0,
            default_height: 0,
            default_usage: BufferUsage::empty(),
            transform: TransformType::RotateNone,
            transform_hint: TransformType::RotateNone,
            last_flushed_sequence: INVALID_SEQUENCE,
            last_flushed_fence: SyncFence::invalid(),
            last_flushed_transform: TransformType::RotateNone,
            last_flushed_desired_present: 0,
            acquire_last_flushed_seq: INVALID_SEQUENCE,
            status: true,
            batch_mode: false,
            buffer_hold: false,
            noblock_mode: false,
            drop_frame_level: 0,
            scaling_mode: ScalingMode::default(),
            source_type: SourceType::default(),
            app_framework_type: String::new(),
            hdr_white_point_brightness: 0.0,
            sdr_white_point_brightness: 0.0,
            alpha_type: AlphaType::default(),
            frame_gravity: MIN_FRAME_GRAVITY,
            fixed_rotation: MIN_FIXED_ROTATION,
            rotating_buffer_count: 0,
            connected_pid: 0,
            listener_pid: 0,
            detach_reserved_slots: 0,
            allocating: false,
            tunnel_handle: None,
            buffer_name: String::new(),
            priority_alloc: false,
            producer_cache_clean: false,
            producer_cache_list: Vec::new(),
            cpu_accessible: false,
            last_consume_time: 0,
            lpp: LppState::new(),
        }
    }

    pub fn used_size(&self) -> u32 {
        self.cache.len() as u32
    }

    /// Capacity actually reachable by requests
    pub fn request_capacity(&self) -> u32 {
        self.queue_size.saturating_sub(self.detach_reserved_slots)
    }

    /// True when only the pinned last-flushed slot sits in the free list
    pub fn free_list_only_pinned(&self) -> bool {
        self.free_list.len() == 1 && self.free_list[0] == self.acquire_last_flushed_seq
    }

    /// Wake predicate for a parked request
    pub fn request_can_proceed(&self) -> bool {
        (!self.free_list.is_empty() && !self.free_list_only_pinned()) ||
            self.used_size() < self.request_capacity() ||
            !self.status
    }

    pub fn remove_from_free_list(&mut self, sequence: u32) {
        self.free_list.retain(|&seq| seq != sequence);
    }

    pub fn drain_deleting(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.deleting_list)
    }
}

/// The shared buffer queue: single owner of every slot, guarded by one
/// mutex, with role-specific method groups for producer and consumer.
pub struct BufferQueue {
    name: String,
    unique_id: u64,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) core: Mutex<QueueCore>,
    /// Signalled on release, detach, queue-size growth and status flips
    pub(crate) wait_req: Condvar,
    /// Signalled on release of an explicitly attached slot
    pub(crate) wait_attach: Condvar,
    /// Signalled when an in-flight allocator call returns
    pub(crate) alloc_done: Condvar,
    pub(crate) registry: ListenerRegistry,
    global_alpha: Mutex<i32>,
}

impl BufferQueue {
    pub fn new(name: impl Into<String>, allocator: Arc<dyn Allocator>) -> Arc<Self> {
        let name = name.into();
        let unique_id = next_unique_id();
        debug!(name = %name, unique_id, "buffer queue created");
        Arc::new(Self {
            name,
            unique_id,
            allocator,
            core: Mutex::new(QueueCore::new()),
            wait_req: Condvar::new(),
            wait_attach: Condvar::new(),
            alloc_done: Condvar::new(),
            registry: ListenerRegistry::new(),
            global_alpha: Mutex::new(-1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn producer_init_info(&self) -> ProducerInitInfo {
        let core = self.core.lock();
        ProducerInitInfo {
            name: self.name.clone(),
            width: core.default_width,
            height: core.default_height,
            unique_id: self.unique_id,
            producer_id: NEXT_PRODUCER_ID.fetch_add(1, Ordering::Relaxed),
            transform_hint: core.transform_hint,
            buffer_name: core.buffer_name.clone(),
        }
    }

    // ========================================================================
    // Status & lifecycle
    // ========================================================================

    pub fn status(&self) -> bool {
        self.core.lock().status
    }

    /// Flipping the status wakes every parked waiter so it can fail with
    /// `NoConsumer` instead of riding out its timeout
    pub fn set_status(&self, status: bool) {
        let mut core = self.core.lock();
        core.status = status;
        drop(core);
        self.wait_req.notify_all();
        self.wait_attach.notify_all();
    }

    pub fn set_batch_mode(&self, batch: bool) {
        self.core.lock().batch_mode = batch;
    }

    /// Wipe all queue state without firing listener callbacks
    pub fn on_consumer_died(&self) -> Result<()> {
        let mut guard = self.core.lock();
        self.clear_locked(&mut guard);
        drop(guard);
        self.wait_req.notify_all();
        Ok(())
    }

    /// Drop every cache entry and list; waits out any in-flight allocation
    pub(crate) fn clear_locked(&self, guard: &mut MutexGuard<'_, QueueCore>) {
        self.alloc_done.wait_while(guard, |core| core.allocating);
        let sequences: Vec<u32> = guard.cache.keys().copied().collect();
        for sequence in sequences {
            self.registry.notify_deleted(sequence);
        }
        guard.cache.clear();
        guard.free_list.clear();
        guard.dirty_list.clear();
        guard.deleting_list.clear();
    }

    // ========================================================================
    // Listener registration
    // ========================================================================

    pub fn register_consumer_listener(&self, listener: Arc<dyn ConsumerListener>) {
        self.registry.set_consumer(listener);
    }

    pub fn unregister_consumer_listener(&self) {
        self.registry.clear_consumer();
    }

    pub fn register_release_listener(&self, func: OnReleaseFn) {
        self.registry.set_on_release(func);
    }

    pub fn register_producer_release_listener(
        &self,
        listener: Arc<dyn ProducerListener>,
        seq_and_fence: bool
    ) {
        self.registry.set_release_listener(listener, seq_and_fence);
    }

    pub fn unregister_producer_release_listener(&self) {
        self.registry.clear_release_listener();
        self.set_listener_pid(0);
    }

    pub fn register_producer_release_listener_with_fence(&self, listener: Arc<dyn ProducerListener>) {
        self.registry.set_release_listener_with_fence(listener);
    }

    pub fn unregister_producer_release_listener_with_fence(&self) {
        self.registry.clear_release_listener_with_fence();
    }

    pub fn register_delete_buffer_listener(&self, func: OnDeleteFn, for_redraw: bool) {
        self.registry.set_on_delete(func, for_redraw);
    }

    pub fn register_producer_property_listener(
        &self,
        listener: Arc<dyn ProducerListener>,
        producer_id: u64
    ) {
        self.registry.register_property_listener(producer_id, listener);
    }

    pub fn unregister_producer_property_listener(&self, producer_id: u64) {
        self.registry.unregister_property_listener(producer_id);
    }

    pub fn set_listener_pid(&self, pid: i32) {
        self.core.lock().listener_pid = pid;
    }

    // ========================================================================
    // Simple properties
    // ========================================================================

    pub fn queue_size(&self) -> u32 {
        self.core.lock().queue_size
    }

    pub fn set_default_size(&self, width: i32, height: i32) -> Result<()> {
        if width <= 0 || height <= 0 {
            return Err(FlipqError::invalid_args(format!("default size {width}x{height}")));
        }
        let mut core = self.core.lock();
        core.default_width = width;
        core.default_height = height;
        Ok(())
    }

    pub fn default_width(&self) -> i32 {
        self.core.lock().default_width
    }

    pub fn default_height(&self) -> i32 {
        self.core.lock().default_height
    }

    pub fn set_default_usage(&self, usage: BufferUsage) {
        self.core.lock().default_usage = usage;
    }

    pub fn default_usage(&self) -> BufferUsage {
        self.core.lock().default_usage
    }

    pub fn set_buffer_hold(&self, hold: bool) {
        self.core.lock().buffer_hold = hold;
    }

    pub fn buffer_hold(&self) -> bool {
        self.core.lock().buffer_hold
    }

    pub fn set_buffer_name(&self, buffer_name: impl Into<String>) {
        self.core.lock().buffer_name = buffer_name.into();
    }

    /// Mark every cached slot for (or against) memory-recycling realloc
    pub fn set_buffer_realloc_flag(&self, flag: bool) {
        let mut core = self.core.lock();
        for slot in core.cache.values_mut() {
            slot.needs_realloc = flag;
        }
    }

    pub fn set_noblock_mode(&self, noblock: bool) {
        self.core.lock().noblock_mode = noblock;
    }

    pub fn noblock_mode(&self) -> bool {
        self.core.lock().noblock_mode
    }

    pub fn set_priority_alloc(&self, priority: bool) {
        self.core.lock().priority_alloc = priority;
    }

    /// Consumer-side toggle for CPU access to HEBC-capable buffers
    pub fn consumer_request_cpu_access(&self, on: bool) {
        self.core.lock().cpu_accessible = on;
    }

    pub fn set_drop_frame_level(&self, level: i32) -> Result<()> {
        if level < 0 {
            return Err(FlipqError::invalid_args(format!("drop frame level {level}")));
        }
        self.core.lock().drop_frame_level = level;
        Ok(())
    }

    pub fn set_connected_pid(&self, pid: i32) {
        self.core.lock().connected_pid = pid;
    }

    pub fn connected_pid(&self) -> i32 {
        self.core.lock().connected_pid
    }

    pub fn set_source_type(&self, source_type: SourceType) {
        self.core.lock().source_type = source_type;
    }

    pub fn source_type(&self) -> SourceType {
        self.core.lock().source_type
    }

    pub fn set_app_framework_type(&self, kind: impl Into<String>) -> Result<()> {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(FlipqError::invalid_args("empty app framework type"));
        }
        if kind.len() > APP_FRAMEWORK_TYPE_MAX_LEN {
            return Err(FlipqError::out_of_range(format!("app framework type {} bytes", kind.len())));
        }
        self.core.lock().app_framework_type = kind;
        Ok(())
    }

    pub fn app_framework_type(&self) -> String {
        self.core.lock().app_framework_type.clone()
    }

    pub fn set_hdr_white_point_brightness(&self, brightness: f32) {
        self.core.lock().hdr_white_point_brightness = brightness;
    }

    pub fn set_sdr_white_point_brightness(&self, brightness: f32) {
        self.core.lock().sdr_white_point_brightness = brightness;
    }

    pub fn hdr_white_point_brightness(&self) -> f32 {
        self.core.lock().hdr_white_point_brightness
    }

    pub fn sdr_white_point_brightness(&self) -> f32 {
        self.core.lock().sdr_white_point_brightness
    }

    pub fn set_alpha_type(&self, alpha_type: AlphaType) {
        self.core.lock().alpha_type = alpha_type;
    }

    pub fn alpha_type(&self) -> AlphaType {
        self.core.lock().alpha_type
    }

    pub fn set_frame_gravity(&self, gravity: i32) -> Result<()> {
        if !(MIN_FRAME_GRAVITY..=MAX_FRAME_GRAVITY).contains(&gravity) {
            return Err(FlipqError::invalid_args(format!("frame gravity {gravity}")));
        }
        self.core.lock().frame_gravity = gravity;
        Ok(())
    }

    pub fn frame_gravity(&self) -> i32 {
        self.core.lock().frame_gravity
    }

    pub fn set_fixed_rotation(&self, rotation: i32) -> Result<()> {
        if !(MIN_FIXED_ROTATION..=MAX_FIXED_ROTATION).contains(&rotation) {
            return Err(FlipqError::invalid_args(format!("fixed rotation {rotation}")));
        }
        self.core.lock().fixed_rotation = rotation;
        Ok(())
    }

    pub fn fixed_rotation(&self) -> i32 {
        self.core.lock().fixed_rotation
    }

    pub fn set_rotating_buffer_count(&self, count: u32) -> Result<()> {
        if count == 0 || count > MAX_ROTATING_BUFFER_COUNT {
            return Err(FlipqError::invalid_args(format!("rotating buffer count {count}")));
        }
        self.core.lock().rotating_buffer_count = count;
        Ok(())
    }

    /// Effective rotating buffer count: the explicit setting, else the
    /// queue size
    pub fn rotating_buffer_count(&self) -> u32 {
        let core = self.core.lock();
        if core.rotating_buffer_count == 0 { core.queue_size } else { core.rotating_buffer_count }
    }

    pub fn set_global_alpha(&self, alpha: i32) {
        *self.global_alpha.lock() = alpha;
    }

    pub fn global_alpha(&self) -> i32 {
        *self.global_alpha.lock()
    }

    pub fn last_consume_time(&self) -> i64 {
        self.core.lock().last_consume_time
    }

    pub fn last_flushed_desired_present_timestamp(&self) -> i64 {
        self.core.lock().last_flushed_desired_present
    }

    /// Desired present timestamp of the dirty head, if any
    pub fn front_desired_present_timestamp(&self) -> Result<(i64, bool)> {
        let core = self.core.lock();
        let front = core.dirty_list.front().ok_or(FlipqError::NoBuffer)?;
        let slot = core.cache.get(front).ok_or(FlipqError::NoBuffer)?;
        Ok((slot.desired_present_timestamp, slot.is_auto_timestamp))
    }

    pub fn available_buffer_count(&self) -> u32 {
        self.core.lock().dirty_list.len() as u32
    }

    pub fn query_if_buffer_available(&self) -> bool {
        let core = self.core.lock();
        !core.free_list.is_empty() || core.used_size() < core.queue_size
    }

    pub fn is_buffer_in_cache(&self, sequence: u32) -> bool {
        self.core.lock().cache.contains_key(&sequence)
    }

    // ========================================================================
    // Transform & tunnel handle
    // ========================================================================

    /// Set the composition transform. An unchanged value short-circuits
    /// without notifying listeners.
    pub fn set_transform(&self, transform: TransformType) -> Result<()> {
        {
            let mut core = self.core.lock();
            if core.transform == transform {
                return Ok(());
            }
            core.transform = transform;
        }
        if let Some(listener) = self.registry.consumer() {
            listener.on_transform_change();
        }
        Ok(())
    }

    pub fn transform(&self) -> TransformType {
        self.core.lock().transform
    }

    /// Set the transform hint and fan it out to every registered property
    /// listener except the setter's own producer
    pub fn set_transform_hint(&self, hint: TransformType, from_producer_id: u64) -> Result<()> {
        {
            let mut core = self.core.lock();
            if core.transform_hint == hint {
                return Ok(());
            }
            core.transform_hint = hint;
        }
        let listeners = self.registry.property_listeners();
        let property = SurfaceProperty { transform_hint: hint };
        for (producer_id, listener) in listeners {
            if producer_id == from_producer_id {
                continue;
            }
            if listener.on_property_change(property).is_err() {
                warn!(unique_id = self.unique_id, producer_id, "property change listener failed");
            }
        }
        Ok(())
    }

    pub fn transform_hint(&self) -> TransformType {
        self.core.lock().transform_hint
    }

    pub fn set_tunnel_handle(&self, handle: Option<TunnelHandle>) -> Result<()> {
        {
            let mut core = self.core.lock();
            let changed = match (&core.tunnel_handle, &handle) {
                (None, None) => {
                    return Err(FlipqError::invalid_args("tunnel handle is null"));
                }
                (None, Some(_)) => true,
                (Some(old), Some(new)) => old.different(new),
                (Some(_), None) => true,
            };
            if !changed {
                debug!(unique_id = self.unique_id, "same tunnel handle, no change");
                return Ok(());
            }
            core.tunnel_handle = handle;
        }
        match self.registry.consumer() {
            Some(listener) => {
                listener.on_tunnel_handle_change();
                Ok(())
            }
            None => Err(FlipqError::ConsumerUnregisteredListener),
        }
    }

    pub fn tunnel_handle(&self) -> Option<TunnelHandle> {
        self.core.lock().tunnel_handle.clone()
    }

    // ========================================================================
    // Per-slot metadata
    // ========================================================================

    pub fn set_scaling_mode(&self, sequence: u32, mode: ScalingMode) -> Result<()> {
        let core = self.core.lock();
        let slot = core.cache.get(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        slot.buffer.set_scaling_mode(mode);
        Ok(())
    }

    /// Global variant: applies to every cached buffer and future allocations
    pub fn set_scaling_mode_all(&self, mode: ScalingMode) {
        let mut core = self.core.lock();
        for slot in core.cache.values() {
            slot.buffer.set_scaling_mode(mode);
        }
        core.scaling_mode = mode;
    }

    pub fn scaling_mode(&self, sequence: u32) -> Result<ScalingMode> {
        let core = self.core.lock();
        let slot = core.cache.get(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        Ok(slot.buffer.scaling_mode())
    }

    pub fn set_metadata(&self, sequence: u32, metadata: Vec<HdrMetaDataRecord>) -> Result<()> {
        if metadata.is_empty() {
            return Err(FlipqError::invalid_args("empty metadata"));
        }
        let mut core = self.core.lock();
        let slot = core.cache.get_mut(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        slot.hdr_meta = metadata;
        slot.hdr_meta_type = HdrMetaDataType::MetaData;
        Ok(())
    }

    pub fn set_metadata_set(&self, sequence: u32, key: u32, metadata: Vec<u8>) -> Result<()> {
        if metadata.is_empty() {
            return Err(FlipqError::invalid_args("empty metadata set"));
        }
        let mut core = self.core.lock();
        let slot = core.cache.get_mut(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        slot.hdr_meta_key = key;
        slot.hdr_meta_set = metadata;
        slot.hdr_meta_type = HdrMetaDataType::MetaDataSet;
        Ok(())
    }

    pub fn metadata_type(&self, sequence: u32) -> Result<HdrMetaDataType> {
        let core = self.core.lock();
        let slot = core.cache.get(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        Ok(slot.hdr_meta_type)
    }

    pub fn metadata(&self, sequence: u32) -> Result<Vec<HdrMetaDataRecord>> {
        let core = self.core.lock();
        let slot = core.cache.get(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        Ok(slot.hdr_meta.clone())
    }

    pub fn metadata_set(&self, sequence: u32) -> Result<(u32, Vec<u8>)> {
        let core = self.core.lock();
        let slot = core.cache.get(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        Ok((slot.hdr_meta_key, slot.hdr_meta_set.clone()))
    }

    pub fn set_present_timestamp(&self, sequence: u32, timestamp: PresentTimestamp) -> Result<()> {
        let mut core = self.core.lock();
        let slot = core.cache.get_mut(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        slot.present_timestamp = timestamp;
        Ok(())
    }

    pub fn present_timestamp(
        &self,
        sequence: u32,
        kind: PresentTimestampType
    ) -> Result<i64> {
        let core = self.core.lock();
        let slot = core.cache.get(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        if kind != slot.present_timestamp.kind {
            return Err(
                FlipqError::not_support(format!("present timestamp type {kind:?} not recorded"))
            );
        }
        match kind {
            PresentTimestampType::Delay => Ok(slot.present_timestamp.time),
            PresentTimestampType::Timestamp => Ok(slot.present_timestamp.time - slot.ui_timestamp),
            PresentTimestampType::Unsupported =>
                Err(FlipqError::not_support("unsupported present timestamp type")),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Snapshot of the bookkeeping, taken under the mutex and handed out
    /// by value so dump paths never hold the queue lock
    pub fn snapshot(&self) -> QueueSnapshot {
        let core = self.core.lock();
        QueueSnapshot {
            cache: core.cache.iter().map(|(&seq, slot)| (seq, slot.state)).collect(),
            free: core.free_list.iter().copied().collect(),
            dirty: core.dirty_list.iter().copied().collect(),
            deleting: core.deleting_list.clone(),
            queue_size: core.queue_size,
        }
    }

    /// Append a human-readable cache dump. The memory total is per call;
    /// nothing global accumulates.
    pub fn dump(&self, result: &mut String) {
        use std::fmt::Write as _;

        let mut guard = self.core.lock();
        self.alloc_done.wait_while(&mut guard, |core| core.allocating);

        let mut total_bytes: u64 = 0;
        let _ = writeln!(
            result,
            "surface {} id {} queueSize {} free {} dirty {}:",
            self.name,
            self.unique_id,
            guard.queue_size,
            guard.free_list.len(),
            guard.dirty_list.len()
        );
        let mut sequences: Vec<&u32> = guard.cache.keys().collect();
        sequences.sort();
        for sequence in sequences {
            let slot = &guard.cache[sequence];
            total_bytes += slot.buffer.size() as u64;
            let _ = writeln!(
                result,
                "  seq {} state {:?} config {}x{} fmt {:?} usage {:#x} ts {} desired {} auto {} memSize {:.2} KiB",
                sequence,
                slot.state,
                slot.config.width,
                slot.config.height,
                slot.config.format,
                slot.config.usage.bits(),
                slot.ui_timestamp,
                slot.desired_present_timestamp,
                slot.is_auto_timestamp,
                (slot.buffer.size() as f64) / 1024.0
            );
        }
        let _ = writeln!(result, "  total {:.2} KiB", (total_bytes as f64) / 1024.0);
    }

    /// Label a buffer through the allocator capability (fd tagging)
    pub fn allocator_tag(&self, buffer: &SurfaceBuffer, label: &str) {
        self.allocator.tag_buffer(buffer, label);
    }

    /// Dispatch `on_buffer_available` outside the queue mutex
    pub(crate) fn call_consumer_listener(&self) {
        if let Some(listener) = self.registry.consumer() {
            listener.on_buffer_available();
        }
    }

    /// Stamp HEBC access type and forced global alpha onto a buffer about
    /// to be handed to the producer
    pub(crate) fn stamp_buffer_metadata(&self, buffer: &SurfaceBuffer, cpu_accessible: bool) {
        use crate::types::MetadataKey;

        if buffer.usage().contains(BufferUsage::CPU_HW_BOTH) {
            let access: u8 = if cpu_accessible { 1 } else { 2 };
            buffer.set_metadata(MetadataKey::RequestAccessType, vec![access]);
        }

        let alpha = *self.global_alpha.lock();
        if (GLOBAL_ALPHA_MIN..=GLOBAL_ALPHA_MAX).contains(&alpha) && alpha >= 0 {
            buffer.set_metadata(MetadataKey::ForceGlobalAlpha, alpha.to_le_bytes().to_vec());
        }
    }
}

impl std::fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueue")
            .field("name", &self.name)
            .field("unique_id", &self.unique_id)
            .finish()
    }
}
