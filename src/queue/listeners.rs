//! Listener traits and the registry living inside the queue.
//!
//! Registration locks are distinct from the queue mutex so a callback may
//! freely call back into the queue: the dispatch path copies the listener
//! reference under the registration lock, releases it, then invokes.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::buffer::SurfaceBuffer;
use crate::error::Result;
use crate::fence::SyncFence;
use crate::types::TransformType;

/// Consumer-side event sink, dispatched on the producer's thread after
/// the queue mutex is released
pub trait ConsumerListener: Send + Sync {
    /// A slot entered the dirty list
    fn on_buffer_available(&self);

    /// The cache is about to be wiped; `pre_cache_sequence` names the one
    /// slot the display pipeline may keep presenting
    fn on_clean_cache(&self, pre_cache_sequence: Option<u32>) {
        let _ = pre_cache_sequence;
    }

    /// The surface went to the background; detach all consumer references
    fn on_go_background(&self) {}

    fn on_transform_change(&self) {}

    fn on_tunnel_handle_change(&self) {}
}

/// Producer-side release notifications, dispatched on the consumer's
/// thread after the queue mutex is released
pub trait ProducerListener: Send + Sync {
    fn on_buffer_released(&self) -> Result<()> {
        Ok(())
    }

    fn on_buffer_released_with_fence(
        &self,
        buffer: &Arc<SurfaceBuffer>,
        fence: &SyncFence
    ) -> Result<()> {
        let _ = (buffer, fence);
        Ok(())
    }

    /// Seq-and-fence variant, paired with the free-slot pre-hand-out
    fn on_buffer_released_with_sequence_and_fence(
        &self,
        sequence: u32,
        fence: &SyncFence
    ) -> Result<()> {
        let _ = (sequence, fence);
        Ok(())
    }

    fn on_property_change(&self, property: SurfaceProperty) -> Result<()> {
        let _ = property;
        Ok(())
    }
}

/// Property snapshot fanned out to registered producers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceProperty {
    pub transform_hint: TransformType,
}

/// Release closure registered by a local consumer
pub type OnReleaseFn = Box<dyn Fn(&Arc<SurfaceBuffer>) -> Result<()> + Send + Sync>;

/// Cache-eviction callback; runs under the queue mutex and must not call
/// back into the queue
pub type OnDeleteFn = Box<dyn Fn(u32) + Send + Sync>;

pub(crate) struct ProducerListenerSlot {
    pub release: Option<Arc<dyn ProducerListener>>,
    /// The with-fence variant registered alongside the simple one
    pub release_backup: Option<Arc<dyn ProducerListener>>,
    /// Whether `release` expects the seq-and-fence delivery
    pub seq_and_fence: bool,
}

/// All listener slots of one queue, each behind its own lock
pub(crate) struct ListenerRegistry {
    consumer: Mutex<Option<Arc<dyn ConsumerListener>>>,
    producer: Mutex<ProducerListenerSlot>,
    on_release: Mutex<Option<OnReleaseFn>>,
    property: Mutex<HashMap<u64, Arc<dyn ProducerListener>>>,
    on_delete_main: OnceCell<OnDeleteFn>,
    on_delete_redraw: OnceCell<OnDeleteFn>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            consumer: Mutex::new(None),
            producer: Mutex::new(ProducerListenerSlot {
                release: None,
                release_backup: None,
                seq_and_fence: false,
            }),
            on_release: Mutex::new(None),
            property: Mutex::new(HashMap::new()),
            on_delete_main: OnceCell::new(),
            on_delete_redraw: OnceCell::new(),
        }
    }

    pub fn set_consumer(&self, listener: Arc<dyn ConsumerListener>) {
        *self.consumer.lock() = Some(listener);
    }

    pub fn clear_consumer(&self) {
        *self.consumer.lock() = None;
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer.lock().is_some()
    }

    pub fn consumer(&self) -> Option<Arc<dyn ConsumerListener>> {
        self.consumer.lock().clone()
    }

    pub fn set_release_listener(&self, listener: Arc<dyn ProducerListener>, seq_and_fence: bool) {
        let mut slot = self.producer.lock();
        slot.release = Some(listener);
        slot.seq_and_fence = seq_and_fence;
    }

    pub fn clear_release_listener(&self) {
        let mut slot = self.producer.lock();
        slot.release = None;
        slot.seq_and_fence = false;
    }

    pub fn set_release_listener_with_fence(&self, listener: Arc<dyn ProducerListener>) {
        self.producer.lock().release_backup = Some(listener);
    }

    pub fn clear_release_listener_with_fence(&self) {
        self.producer.lock().release_backup = None;
    }

    pub fn seq_and_fence_active(&self) -> bool {
        let slot = self.producer.lock();
        slot.release.is_some() && slot.seq_and_fence
    }

    pub fn release_listeners(
        &self
    ) -> (Option<Arc<dyn ProducerListener>>, Option<Arc<dyn ProducerListener>>, bool) {
        let slot = self.producer.lock();
        (slot.release.clone(), slot.release_backup.clone(), slot.seq_and_fence)
    }

    pub fn set_on_release(&self, func: OnReleaseFn) {
        *self.on_release.lock() = Some(func);
    }

    pub fn call_on_release(&self, buffer: &Arc<SurfaceBuffer>) {
        let guard = self.on_release.lock();
        if let Some(func) = guard.as_ref() {
            let _ = func(buffer);
        }
    }

    pub fn register_property_listener(&self, producer_id: u64, listener: Arc<dyn ProducerListener>) {
        self.property.lock().insert(producer_id, listener);
    }

    pub fn unregister_property_listener(&self, producer_id: u64) {
        self.property.lock().remove(&producer_id);
    }

    pub fn property_listeners(&self) -> HashMap<u64, Arc<dyn ProducerListener>> {
        self.property.lock().clone()
    }

    /// Latched once; later registrations are ignored
    pub fn set_on_delete(&self, func: OnDeleteFn, for_redraw: bool) {
        let cell = if for_redraw { &self.on_delete_redraw } else { &self.on_delete_main };
        let _ = cell.set(func);
    }

    /// Fire both delete callbacks for an evicted sequence. Runs under the
    /// queue mutex; the callbacks must not re-enter the queue.
    pub fn notify_deleted(&self, sequence: u32) {
        if let Some(func) = self.on_delete_main.get() {
            func(sequence);
        }
        if let Some(func) = self.on_delete_redraw.get() {
            func(sequence);
        }
    }

    /// Redraw-thread callback alone, for a release that missed the cache
    pub fn notify_deleted_redraw(&self, sequence: u32) {
        if let Some(func) = self.on_delete_redraw.get() {
            func(sequence);
        }
    }
}
