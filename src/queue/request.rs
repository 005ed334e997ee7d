//! Producer-side queue operations: request, cancel, flush, pre-alloc.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;
use tracing::{ debug, error, warn };

use crate::buffer::SurfaceBuffer;
use crate::constants::REALLOC_FENCE_WAIT_MS;
use crate::error::{ FlipqError, Result };
use crate::fence::{ monotonic_nanos, SyncFence };
use crate::types::{ BufferFlushConfig, BufferRequestConfig, BufferUsage, ExtraData };

use super::slot::{ BufferSlot, BufferState };
use super::{ BufferQueue, InvokerType, QueueCore, RequestBufferReply };

impl BufferQueue {
    // ========================================================================
    // RequestBuffer
    // ========================================================================

    /// Hand a slot to the producer for drawing.
    ///
    /// Prefers an exact config match from the free list (the buffer field
    /// of the reply stays `None`, the producer already caches it), then
    /// the oldest free slot via the realloc path, then a fresh allocation.
    /// With a full cache the call parks on `wait_req` up to the config
    /// timeout, or steals the oldest dirty frame in noblock mode.
    pub fn request_buffer(&self, config: &BufferRequestConfig) -> Result<RequestBufferReply> {
        let mut guard = self.core.lock();
        self.request_buffer_locked(&mut guard, config, false)
    }

    /// Batch variant: keeps requesting until the first non-OK reply
    pub fn request_buffers(
        &self,
        config: &BufferRequestConfig,
        count: u32
    ) -> Result<Vec<RequestBufferReply>> {
        let count = count.min(self.queue_size());
        let mut replies = Vec::new();
        let mut guard = self.core.lock();
        guard.batch_mode = true;
        for _ in 0..count {
            match self.request_buffer_locked(&mut guard, config, false) {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    guard.batch_mode = false;
                    if replies.is_empty() {
                        return Err(err);
                    }
                    return Ok(replies);
                }
            }
        }
        guard.batch_mode = false;
        Ok(replies)
    }

    /// Request and immediately detach, for producers migrating buffers
    /// between queues in one round-trip
    pub fn request_and_detach(&self, config: &BufferRequestConfig) -> Result<RequestBufferReply> {
        let mut guard = self.core.lock();
        let reply = self.request_buffer_locked(&mut guard, config, false)?;
        self.detach_from_queue_locked(&mut guard, reply.sequence, InvokerType::Producer, false)?;
        Ok(reply)
    }

    pub(crate) fn request_buffer_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        config: &BufferRequestConfig,
        for_listener: bool
    ) -> Result<RequestBufferReply> {
        if !guard.batch_mode && !guard.status {
            return Err(FlipqError::NoConsumer);
        }
        if !self.registry.has_consumer() {
            return Err(FlipqError::ConsumerUnregisteredListener);
        }

        let mut updated = config.clone();
        updated.usage |= guard.default_usage;
        if updated.width <= 0 || updated.height <= 0 {
            return Err(FlipqError::invalid_args(format!("request size {}x{}", updated.width, updated.height)));
        }

        // a single in-flight allocation excludes all cache mutation
        self.alloc_done.wait_while(guard, |core| core.allocating);

        let prefer_alloc =
            guard.priority_alloc && guard.used_size() < guard.request_capacity() && !for_listener;
        if !prefer_alloc {
            if let Some(sequence) = self.pop_from_free_list_locked(guard, &updated) {
                return self.reuse_buffer(guard, sequence, updated, for_listener);
            }
            if for_listener {
                return Err(FlipqError::NoBuffer);
            }
            if guard.used_size() >= guard.request_capacity() {
                return if guard.noblock_mode {
                    self.request_noblock_mode(guard, updated)
                } else {
                    self.request_block_mode(guard, updated)
                };
            }
        }

        self.setup_new_buffer_locked(guard, updated)
    }

    /// Free-list dequeue. An exact config match wins regardless of age;
    /// otherwise the oldest free slot is taken only when the cache has no
    /// room to grow. The pinned last-flushed slot is never handed out and
    /// rotates to the back instead of blocking the head.
    fn pop_from_free_list_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        config: &BufferRequestConfig
    ) -> Option<u32> {
        let pinned = guard.acquire_last_flushed_seq;

        let matching = guard.free_list.iter().position(|&seq| {
            seq != pinned &&
                guard.cache
                    .get(&seq)
                    .map(|slot| slot.config.matches(config))
                    .unwrap_or(false)
        });
        if let Some(index) = matching {
            return guard.free_list.remove(index);
        }

        if
            guard.free_list.is_empty() ||
            guard.used_size() < guard.request_capacity() ||
            guard.free_list_only_pinned()
        {
            return None;
        }

        if guard.free_list.front() == Some(&pinned) {
            if let Some(front) = guard.free_list.pop_front() {
                guard.free_list.push_back(front);
            }
        }
        let sequence = guard.free_list.pop_front()?;
        if let Some(slot) = guard.cache.get(&sequence) {
            slot.buffer.set_color_gamut(config.color_gamut);
            slot.buffer.set_transform(config.transform);
        }
        Some(sequence)
    }

    /// Full cache, blocking mode: park on `wait_req` and retry once
    fn request_block_mode(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        config: BufferRequestConfig
    ) -> Result<RequestBufferReply> {
        let timeout = Duration::from_millis(config.timeout_ms as u64);
        self.wait_req.wait_while_for(guard, |core| !core.request_can_proceed(), timeout);

        if !guard.status && !guard.batch_mode {
            return Err(FlipqError::NoConsumer);
        }
        if let Some(sequence) = self.pop_from_free_list_locked(guard, &config) {
            return self.reuse_buffer(guard, sequence, config, false);
        }
        if guard.used_size() >= guard.request_capacity() {
            self.log_cache_states(guard, "all buffers in use after wait");
            return Err(FlipqError::NoBuffer);
        }
        self.setup_new_buffer_locked(guard, config)
    }

    /// Full cache, noblock mode: steal the oldest dirty frame
    fn request_noblock_mode(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        config: BufferRequestConfig
    ) -> Result<RequestBufferReply> {
        match guard.dirty_list.pop_front() {
            Some(sequence) => {
                if let Some(slot) = guard.cache.get(&sequence) {
                    slot.buffer.set_color_gamut(config.color_gamut);
                    slot.buffer.set_transform(config.transform);
                }
                debug!(unique_id = self.unique_id(), sequence, "noblock request drops dirty frame");
                self.reuse_buffer(guard, sequence, config, false)
            }
            None => {
                self.log_cache_states(guard, "noblock request found no dirty buffer");
                Err(FlipqError::NoBuffer)
            }
        }
    }

    /// Turn a dequeued slot into a Requested reply, reallocating when the
    /// cached config no longer satisfies the request
    fn reuse_buffer(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        sequence: u32,
        config: BufferRequestConfig,
        for_listener: bool
    ) -> Result<RequestBufferReply> {
        let needs_realloc = {
            let slot = guard.cache
                .get(&sequence)
                .ok_or_else(|| FlipqError::unknown(format!("reuse lost slot {sequence}")))?;
            !slot.config.matches(&config)
        };

        let mut sequence = sequence;
        if needs_realloc {
            if for_listener {
                // pre-hand-out never reallocates; put the slot back
                guard.free_list.push_back(sequence);
                return Err(FlipqError::NoBuffer);
            }
            sequence = self.realloc_buffer_locked(guard, sequence, &config)?;
        }

        let deleting_buffers = guard.drain_deleting();
        let cpu_accessible = guard.cpu_accessible;
        let producer_cache_clean = guard.producer_cache_clean;

        let (buffer, fence, was_pre_alloc) = {
            let slot = guard.cache
                .get_mut(&sequence)
                .ok_or_else(|| FlipqError::unknown(format!("reuse lost slot {sequence}")))?;
            slot.state = BufferState::Requested;
            slot.config = config;
            let was_pre_alloc = slot.is_pre_alloc;
            slot.is_pre_alloc = false;
            (slot.buffer.clone(), slot.fence.clone(), was_pre_alloc)
        };

        let consumer_attached = buffer.consumer_attach_flag();
        let include_buffer =
            needs_realloc || producer_cache_clean || consumer_attached || was_pre_alloc;

        if include_buffer && for_listener {
            // the listener fast path cannot ship buffer handles
            let slot = guard.cache
                .get_mut(&sequence)
                .ok_or_else(|| FlipqError::unknown(format!("reuse lost slot {sequence}")))?;
            slot.state = BufferState::Released;
            guard.free_list.push_back(sequence);
            return Err(FlipqError::NoBuffer);
        }

        if producer_cache_clean {
            guard.producer_cache_list.push(sequence);
            let all_resent = guard.cache.keys().all(|seq| guard.producer_cache_list.contains(seq));
            if all_resent {
                guard.producer_cache_clean = false;
                guard.producer_cache_list.clear();
            }
        }
        buffer.set_consumer_attach_flag(false);
        self.stamp_buffer_metadata(&buffer, cpu_accessible);

        Ok(RequestBufferReply {
            sequence,
            extra_data: buffer.extra_data(),
            buffer: include_buffer.then_some(buffer),
            fence,
            deleting_buffers,
        })
    }

    /// Replace a free slot's allocation because its config changed. Honors
    /// the realloc flag: when set, the previous buffer's release fence is
    /// awaited (bounded) and its memory offered back to the allocator.
    fn realloc_buffer_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        sequence: u32,
        config: &BufferRequestConfig
    ) -> Result<u32> {
        let (mut reuse_memory, prev_fence, prev_buffer) = match guard.cache.get(&sequence) {
            Some(slot) => (slot.needs_realloc, slot.fence.clone(), Some(slot.buffer.clone())),
            None => (false, SyncFence::invalid(), None),
        };
        if reuse_memory && prev_fence.is_valid() && !prev_fence.wait(REALLOC_FENCE_WAIT_MS as i32) {
            warn!(unique_id = self.unique_id(), sequence, "realloc fence wait timed out");
            reuse_memory = false;
        }

        self.delete_buffer_in_cache_nowait(guard, sequence);

        let previous = if reuse_memory { prev_buffer } else { None };
        let buffer = self.alloc_buffer(guard, config, previous)?;
        Ok(buffer.sequence())
    }

    fn setup_new_buffer_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        config: BufferRequestConfig
    ) -> Result<RequestBufferReply> {
        let buffer = self.alloc_buffer(guard, &config, None)?;
        let deleting_buffers = guard.drain_deleting();
        self.stamp_buffer_metadata(&buffer, guard.cpu_accessible);
        Ok(RequestBufferReply {
            sequence: buffer.sequence(),
            extra_data: buffer.extra_data(),
            fence: SyncFence::invalid(),
            buffer: Some(buffer),
            deleting_buffers,
        })
    }

    /// Invoke the allocator with the queue mutex released; the allocating
    /// flag queues every other cache-mutating operation behind the call
    pub(crate) fn alloc_buffer(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        config: &BufferRequestConfig,
        previous: Option<Arc<SurfaceBuffer>>
    ) -> Result<Arc<SurfaceBuffer>> {
        let scaling_mode = guard.scaling_mode;
        let connected_pid = guard.connected_pid;

        guard.allocating = true;
        let allocator = Arc::clone(&self.allocator);
        let config_for_alloc = config.clone();
        let result = MutexGuard::unlocked(guard, move ||
            allocator.allocate(&config_for_alloc, previous.as_ref())
        );
        guard.allocating = false;
        self.alloc_done.notify_all();

        let buffer = match result {
            Ok(buffer) => buffer,
            Err(err) => {
                error!(
                    unique_id = self.unique_id(),
                    width = config.width,
                    height = config.height,
                    %err,
                    "buffer allocation failed"
                );
                return Err(err);
            }
        };

        buffer.set_scaling_mode(scaling_mode);
        if connected_pid != 0 {
            self.allocator.tag_buffer(&buffer, &connected_pid.to_string());
        }

        let slot = BufferSlot::new(buffer.clone(), BufferState::Requested, config.clone());
        guard.cache.insert(buffer.sequence(), slot);
        Ok(buffer)
    }

    // ========================================================================
    // CancelBuffer
    // ========================================================================

    pub fn cancel_buffer(&self, sequence: u32, extra_data: ExtraData) -> Result<()> {
        let mut guard = self.core.lock();
        self.cancel_buffer_locked(&mut guard, sequence, extra_data)?;
        drop(guard);
        self.wait_req.notify_all();
        self.wait_attach.notify_all();
        Ok(())
    }

    pub(crate) fn cancel_buffer_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        sequence: u32,
        extra_data: ExtraData
    ) -> Result<()> {
        let slot = guard.cache
            .get_mut(&sequence)
            .ok_or(FlipqError::BufferNotInCache { sequence })?;
        if slot.state != BufferState::Requested && slot.state != BufferState::Attached {
            return Err(FlipqError::bad_state(format!("cancel in state {:?}", slot.state)));
        }
        slot.state = BufferState::Released;
        slot.listener_client_pid = 0;
        slot.buffer.set_extra_data(extra_data);
        guard.free_list.push_back(sequence);
        Ok(())
    }

    // ========================================================================
    // FlushBuffer
    // ========================================================================

    /// Move a Requested (or Attached) slot onto the dirty list.
    ///
    /// The consumer listener fires after the mutex is released; a missing
    /// listener cancels the flush so the slot is not lost.
    pub fn flush_buffer(
        &self,
        sequence: u32,
        extra_data: ExtraData,
        fence: SyncFence,
        config: &BufferFlushConfig
    ) -> Result<()> {
        {
            let guard = self.core.lock();
            if !guard.status {
                return Err(FlipqError::NoConsumer);
            }
        }
        Self::check_flush_config(config)?;
        {
            let guard = self.core.lock();
            Self::check_flushable_locked(&guard, sequence)?;
        }
        if !self.registry.has_consumer() {
            warn!(unique_id = self.unique_id(), sequence, "flush without consumer listener");
            self.cancel_buffer(sequence, extra_data)?;
            return Err(FlipqError::ConsumerUnregisteredListener);
        }

        {
            let mut guard = self.core.lock();
            self.do_flush_locked(&mut guard, sequence, extra_data, fence, config)?;
        }
        self.call_consumer_listener();
        Ok(())
    }

    fn check_flush_config(config: &BufferFlushConfig) -> Result<()> {
        for (index, damage) in config.damages.iter().enumerate() {
            if damage.w < 0 || damage.h < 0 {
                return Err(
                    FlipqError::invalid_args(
                        format!("damage[{index}] is {}x{}", damage.w, damage.h)
                    )
                );
            }
        }
        Ok(())
    }

    fn check_flushable_locked(guard: &QueueCore, sequence: u32) -> Result<()> {
        let slot = guard.cache.get(&sequence).ok_or(FlipqError::BufferNotInCache { sequence })?;
        if slot.state != BufferState::Requested && slot.state != BufferState::Attached {
            return Err(FlipqError::bad_state(format!("flush in state {:?}", slot.state)));
        }
        Ok(())
    }

    pub(crate) fn do_flush_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        sequence: u32,
        extra_data: ExtraData,
        fence: SyncFence,
        config: &BufferFlushConfig
    ) -> Result<()> {
        let transform = guard.transform;
        if !guard.cache.contains_key(&sequence) {
            return Err(FlipqError::BufferNotInCache { sequence });
        }
        if guard.cache[&sequence].is_deleting {
            self.delete_buffer_in_cache(guard, sequence);
            debug!(unique_id = self.unique_id(), sequence, "flush reaped tombstoned slot");
            return Ok(());
        }

        let desired_present;
        {
            let slot = guard.cache
                .get_mut(&sequence)
                .ok_or(FlipqError::BufferNotInCache { sequence })?;
            slot.buffer.set_extra_data(extra_data);
            slot.buffer.set_transform(transform);
            if slot.config.usage.contains(BufferUsage::CPU_WRITE) {
                slot.buffer.flush_cache()?;
            }
            // no state rollback past this point
            slot.record_flush(fence.clone(), config);
            slot.buffer.set_flush_timestamp(monotonic_nanos());
            Self::resolve_desired_present(slot, config);
            desired_present = slot.desired_present_timestamp;
        }

        guard.dirty_list.push_back(sequence);
        guard.last_flushed_sequence = sequence;
        guard.last_flushed_fence = fence;
        guard.last_flushed_transform = transform;
        guard.last_flushed_desired_present = desired_present;
        Ok(())
    }

    /// Desired-present precedence: explicit positive value wins, then a
    /// nonzero UI timestamp that fits i64, then the current steady clock
    /// (marking the slot auto-timestamped)
    fn resolve_desired_present(slot: &mut BufferSlot, config: &BufferFlushConfig) {
        slot.is_auto_timestamp = false;
        if config.desired_present_timestamp <= 0 {
            if
                config.desired_present_timestamp == 0 &&
                config.ui_timestamp != 0 &&
                config.ui_timestamp <= (i64::MAX as u64)
            {
                slot.desired_present_timestamp = config.ui_timestamp as i64;
            } else {
                slot.desired_present_timestamp = monotonic_nanos();
                slot.is_auto_timestamp = true;
            }
        } else {
            slot.desired_present_timestamp = config.desired_present_timestamp;
        }
        slot.ui_timestamp = config.ui_timestamp as i64;
    }

    /// Single-lock flush used by the attach-and-flush round-trip
    pub(crate) fn flush_improved_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        sequence: u32,
        extra_data: ExtraData,
        fence: SyncFence,
        config: &BufferFlushConfig
    ) -> Result<()> {
        if !guard.status {
            return Err(FlipqError::NoConsumer);
        }
        Self::check_flush_config(config)?;
        Self::check_flushable_locked(guard, sequence)?;
        if !self.registry.has_consumer() {
            return Err(FlipqError::ConsumerUnregisteredListener);
        }
        self.do_flush_locked(guard, sequence, extra_data, fence, config)
    }

    /// Attach a caller-allocated buffer and flush it in one round-trip.
    /// A failed flush rolls the attach back so the buffer is not stranded.
    pub fn attach_and_flush(
        &self,
        buffer: Arc<SurfaceBuffer>,
        extra_data: ExtraData,
        fence: SyncFence,
        config: &BufferFlushConfig,
        need_map: bool
    ) -> Result<()> {
        let sequence = buffer.sequence();
        {
            let mut guard = self.core.lock();
            self.attach_to_queue_locked(&mut guard, buffer, InvokerType::Producer, need_map)?;
            if let Err(err) = self.flush_improved_locked(&mut guard, sequence, extra_data, fence, config) {
                guard.dirty_list.retain(|&seq| seq != sequence);
                guard.cache.remove(&sequence);
                return Err(err);
            }
        }
        self.call_consumer_listener();
        Ok(())
    }

    // ========================================================================
    // PreAllocBuffers
    // ========================================================================

    /// Warm the cache with Released slots so first-frame requests skip the
    /// allocator
    pub fn pre_alloc_buffers(&self, config: &BufferRequestConfig, count: u32) -> Result<()> {
        if config.width <= 0 || config.height <= 0 || count == 0 {
            return Err(
                FlipqError::invalid_args(
                    format!("pre-alloc {}x{} count {count}", config.width, config.height)
                )
            );
        }
        let allowed = {
            let guard = self.core.lock();
            count.min(guard.request_capacity().saturating_sub(guard.used_size()))
        };
        if allowed == 0 {
            return Err(FlipqError::BufferQueueFull);
        }

        // allocation happens unlocked; installation re-checks the room
        let mut buffers = Vec::with_capacity(allowed as usize);
        for _ in 0..allowed {
            match self.allocator.allocate(config, None) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    warn!(unique_id = self.unique_id(), %err, "pre-alloc allocation failed");
                }
            }
        }

        let mut guard = self.core.lock();
        for buffer in buffers {
            if guard.used_size() >= guard.request_capacity() {
                return Err(FlipqError::BufferQueueFull);
            }
            let sequence = buffer.sequence();
            buffer.set_scaling_mode(guard.scaling_mode);
            let mut slot = BufferSlot::new(buffer, BufferState::Released, config.clone());
            slot.is_pre_alloc = true;
            guard.cache.insert(sequence, slot);
            guard.free_list.push_back(sequence);
        }
        Ok(())
    }

    // ========================================================================
    // Cache eviction helpers
    // ========================================================================

    /// Evict one cache entry; pre-alloc slots vanish silently, everything
    /// else notifies the delete listeners and joins the deleting list so
    /// the producer invalidates its own cache
    pub(crate) fn delete_buffer_in_cache_nowait(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        sequence: u32
    ) {
        if let Some(slot) = guard.cache.remove(&sequence) {
            if slot.is_pre_alloc {
                guard.remove_from_free_list(sequence);
                return;
            }
            self.registry.notify_deleted(sequence);
            guard.deleting_list.push(sequence);
        }
    }

    pub(crate) fn delete_buffer_in_cache(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        sequence: u32
    ) {
        self.alloc_done.wait_while(guard, |core| core.allocating);
        self.delete_buffer_in_cache_nowait(guard, sequence);
    }

    /// Invalidate the producer-side cache: every slot must ship its buffer
    /// handle again until the whole cache has been re-sent
    pub fn set_producer_cache_clean_flag(&self, flag: bool) {
        let mut guard = self.core.lock();
        self.alloc_done.wait_while(&mut guard, |core| core.allocating);
        guard.producer_cache_clean = flag;
        guard.producer_cache_list.clear();
    }

    pub(crate) fn log_cache_states(&self, guard: &MutexGuard<'_, QueueCore>, reason: &str) {
        let mut released = 0;
        let mut requested = 0;
        let mut flushed = 0;
        let mut acquired = 0;
        for slot in guard.cache.values() {
            match slot.state {
                BufferState::Released => released += 1,
                BufferState::Requested => requested += 1,
                BufferState::Flushed => flushed += 1,
                BufferState::Acquired => acquired += 1,
                BufferState::Attached => {}
            }
        }
        debug!(
            unique_id = self.unique_id(),
            released,
            requested,
            flushed,
            acquired,
            reason,
            "cache state"
        );
    }
}
