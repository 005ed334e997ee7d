//! Slot records: one cached buffer plus its per-request state.

use std::sync::Arc;

use crate::buffer::SurfaceBuffer;
use crate::fence::SyncFence;
use crate::types::{
    BufferFlushConfig,
    BufferRequestConfig,
    HdrMetaDataRecord,
    HdrMetaDataType,
    PresentTimestamp,
    Rect,
};

/// Lifecycle state of a cached slot. A slot is always in exactly one
/// state, and on exactly one list when the state demands it:
/// `Released` ⇔ free list, `Flushed` ⇔ dirty list, all others off-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Idle, reusable, parked on the free list
    Released,
    /// Held by the producer for drawing
    Requested,
    /// Drawn, parked on the dirty list awaiting acquire
    Flushed,
    /// Held by the consumer for composition
    Acquired,
    /// Externally injected; behaves as Released on exit
    Attached,
}

/// One entry of the queue cache
pub struct BufferSlot {
    pub buffer: Arc<SurfaceBuffer>,
    pub state: BufferState,
    /// Tombstone: reap the slot as soon as it comes back to the queue
    pub is_deleting: bool,
    /// Installed by `pre_alloc_buffers`; first request clears it
    pub is_pre_alloc: bool,
    /// Reuse with a different config must recycle the backing memory
    pub needs_realloc: bool,
    pub config: BufferRequestConfig,
    /// Release fence while Released, flush fence while Flushed
    pub fence: SyncFence,
    pub ui_timestamp: i64,
    pub desired_present_timestamp: i64,
    pub is_auto_timestamp: bool,
    pub damages: Vec<Rect>,
    pub hdr_meta_type: HdrMetaDataType,
    pub hdr_meta: Vec<HdrMetaDataRecord>,
    pub hdr_meta_key: u32,
    pub hdr_meta_set: Vec<u8>,
    pub present_timestamp: PresentTimestamp,
    /// Pid stamped when the slot was pre-handed to a release listener
    pub listener_client_pid: i32,
    /// Monotonic nanos of the most recent acquire, for consume telemetry
    pub last_acquire_time: i64,
}

impl BufferSlot {
    pub fn new(buffer: Arc<SurfaceBuffer>, state: BufferState, config: BufferRequestConfig) -> Self {
        Self {
            buffer,
            state,
            is_deleting: false,
            is_pre_alloc: false,
            needs_realloc: false,
            config,
            fence: SyncFence::invalid(),
            ui_timestamp: 0,
            desired_present_timestamp: 0,
            is_auto_timestamp: false,
            damages: Vec::new(),
            hdr_meta_type: HdrMetaDataType::None,
            hdr_meta: Vec::new(),
            hdr_meta_key: 0,
            hdr_meta_set: Vec::new(),
            present_timestamp: PresentTimestamp::default(),
            listener_client_pid: 0,
            last_acquire_time: 0,
        }
    }

    /// Record the flush-side fields in one step
    pub fn record_flush(&mut self, fence: SyncFence, config: &BufferFlushConfig) {
        self.state = BufferState::Flushed;
        self.fence = fence;
        self.damages = config.damages.clone();
        self.listener_client_pid = 0;
    }
}
