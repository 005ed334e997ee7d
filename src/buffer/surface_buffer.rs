//! The shared buffer object handed between producer and consumer.

use std::collections::BTreeMap;
use std::sync::atomic::{ AtomicU32, Ordering };

use parking_lot::Mutex;

use crate::error::Result;
use crate::fence::SyncFence;
use crate::types::{
    BufferRequestConfig,
    BufferUsage,
    ColorGamut,
    ExtraData,
    MetadataKey,
    PixelFormat,
    ScalingMode,
    TransformType,
};

use super::BufferHandle;

static NEXT_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Mutable bookkeeping riding with a buffer across the queue boundary
struct BufferMeta {
    request_config: BufferRequestConfig,
    color_gamut: ColorGamut,
    transform: TransformType,
    scaling_mode: ScalingMode,
    extra: ExtraData,
    metadata: BTreeMap<MetadataKey, Vec<u8>>,
    sync_fence: Option<SyncFence>,
    consumer_attach: bool,
    flush_timestamp: i64,
    surface_width: i32,
    surface_height: i32,
}

/// One fd-backed image allocation plus its per-buffer sideband state.
///
/// Always handled as `Arc<SurfaceBuffer>`; the sequence number is unique
/// across the process and identifies the buffer in every cache.
pub struct SurfaceBuffer {
    sequence: u32,
    handle: BufferHandle,
    meta: Mutex<BufferMeta>,
}

impl SurfaceBuffer {
    pub fn new(handle: BufferHandle, config: BufferRequestConfig) -> Self {
        let surface_width = handle.width();
        let surface_height = handle.height();
        Self {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            handle,
            meta: Mutex::new(BufferMeta {
                color_gamut: config.color_gamut,
                transform: config.transform,
                scaling_mode: ScalingMode::default(),
                request_config: config,
                extra: ExtraData::new(),
                metadata: BTreeMap::new(),
                sync_fence: None,
                consumer_attach: false,
                flush_timestamp: 0,
                surface_width,
                surface_height,
            }),
        }
    }

    /// Rebuild a buffer around an existing sequence number (wire path:
    /// the peer's descriptor names the buffer, identity must survive)
    pub(crate) fn with_sequence(
        handle: BufferHandle,
        config: BufferRequestConfig,
        sequence: u32
    ) -> Self {
        let mut buffer = Self::new(handle, config);
        buffer.sequence = sequence;
        buffer
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    pub fn width(&self) -> i32 {
        self.handle.width()
    }

    pub fn height(&self) -> i32 {
        self.handle.height()
    }

    pub fn stride(&self) -> i32 {
        self.handle.stride()
    }

    pub fn format(&self) -> PixelFormat {
        self.handle.format()
    }

    pub fn usage(&self) -> BufferUsage {
        self.handle.usage()
    }

    pub fn size(&self) -> usize {
        self.handle.len()
    }

    pub fn is_protected(&self) -> bool {
        self.usage().contains(BufferUsage::PROTECTED)
    }

    pub fn map(&self) -> Result<()> {
        self.handle.map()
    }

    pub fn flush_cache(&self) -> Result<()> {
        self.handle.flush_cache()
    }

    /// Request config the buffer was allocated (or last realloc'd) under
    pub fn request_config(&self) -> BufferRequestConfig {
        self.meta.lock().request_config.clone()
    }

    pub fn set_request_config(&self, config: BufferRequestConfig) {
        self.meta.lock().request_config = config;
    }

    pub fn set_color_gamut(&self, gamut: ColorGamut) {
        self.meta.lock().color_gamut = gamut;
    }

    pub fn color_gamut(&self) -> ColorGamut {
        self.meta.lock().color_gamut
    }

    pub fn set_transform(&self, transform: TransformType) {
        self.meta.lock().transform = transform;
    }

    pub fn transform(&self) -> TransformType {
        self.meta.lock().transform
    }

    pub fn set_scaling_mode(&self, mode: ScalingMode) {
        self.meta.lock().scaling_mode = mode;
    }

    pub fn scaling_mode(&self) -> ScalingMode {
        self.meta.lock().scaling_mode
    }

    pub fn extra_data(&self) -> ExtraData {
        self.meta.lock().extra.clone()
    }

    pub fn set_extra_data(&self, extra: ExtraData) {
        self.meta.lock().extra = extra;
    }

    pub fn set_metadata(&self, key: MetadataKey, value: Vec<u8>) {
        self.meta.lock().metadata.insert(key, value);
    }

    pub fn metadata(&self, key: MetadataKey) -> Option<Vec<u8>> {
        self.meta.lock().metadata.get(&key).cloned()
    }

    /// Fence attached by the consumer pipeline, merged into the release
    /// fence when the buffer comes back ([queue release path])
    pub fn take_sync_fence(&self) -> Option<SyncFence> {
        self.meta.lock().sync_fence.take()
    }

    pub fn set_sync_fence(&self, fence: Option<SyncFence>) {
        self.meta.lock().sync_fence = fence;
    }

    pub fn set_consumer_attach_flag(&self, flag: bool) {
        self.meta.lock().consumer_attach = flag;
    }

    pub fn consumer_attach_flag(&self) -> bool {
        self.meta.lock().consumer_attach
    }

    pub fn set_flush_timestamp(&self, timestamp: i64) {
        self.meta.lock().flush_timestamp = timestamp;
    }

    pub fn flush_timestamp(&self) -> i64 {
        self.meta.lock().flush_timestamp
    }

    /// Logical surface size, refreshed when the buffer migrates queues
    pub fn refresh_surface_size(&self) {
        let mut meta = self.meta.lock();
        meta.surface_width = self.handle.width();
        meta.surface_height = self.handle.height();
    }

    pub fn surface_size(&self) -> (i32, i32) {
        let meta = self.meta.lock();
        (meta.surface_width, meta.surface_height)
    }
}

impl std::fmt::Debug for SurfaceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceBuffer")
            .field("sequence", &self.sequence)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemfdAllocator;
    use crate::buffer::Allocator;
    use crate::types::ExtraValue;

    fn test_config() -> BufferRequestConfig {
        BufferRequestConfig { width: 64, height: 64, ..Default::default() }
    }

    #[test]
    fn test_sequences_are_unique() {
        let alloc = MemfdAllocator::default();
        let a = alloc.allocate(&test_config(), None).unwrap();
        let b = alloc.allocate(&test_config(), None).unwrap();
        assert_ne!(a.sequence(), b.sequence());
    }

    #[test]
    fn test_extra_data_round_trip() {
        let alloc = MemfdAllocator::default();
        let buffer = alloc.allocate(&test_config(), None).unwrap();
        let mut extra = ExtraData::new();
        extra.set("frame", ExtraValue::I32(7)).unwrap();
        buffer.set_extra_data(extra.clone());
        assert_eq!(buffer.extra_data(), extra);
    }

    #[test]
    fn test_sync_fence_take_clears() {
        let alloc = MemfdAllocator::default();
        let buffer = alloc.allocate(&test_config(), None).unwrap();
        buffer.set_sync_fence(Some(SyncFence::new("hw")));
        assert!(buffer.take_sync_fence().is_some());
        assert!(buffer.take_sync_fence().is_none());
    }
}
