//! Consumer-side queue operations: acquire, release, attach/detach,
//! last-flushed pinning, cache lifecycle and queue sizing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;
use tracing::{ debug, warn };

use crate::buffer::SurfaceBuffer;
use crate::constants::{ INVALID_SEQUENCE, MAX_QUEUE_SIZE, ONE_SECOND_NANOS };
use crate::error::{ FlipqError, Result };
use crate::fence::{ monotonic_nanos, SyncFence };
use crate::matrix::{ compute_transform_matrix, compute_transform_matrix_v2 };
use crate::types::{ BufferRequestConfig, BufferUsage, Rect };

use super::slot::{ BufferSlot, BufferState };
use super::{ AcquireReply, BufferQueue, InvokerType, LastFlushedReply, QueueCore };

impl BufferQueue {
    // ========================================================================
    // AcquireBuffer
    // ========================================================================

    /// Pop the oldest flushed slot for composition
    pub fn acquire_buffer(&self) -> Result<AcquireReply> {
        let mut guard = self.core.lock();
        let sequence = match guard.dirty_list.pop_front() {
            Some(sequence) => sequence,
            None => {
                self.log_cache_states(&guard, "acquire found no dirty buffer");
                return Err(FlipqError::NoBuffer);
            }
        };
        let slot = guard.cache
            .get_mut(&sequence)
            .ok_or_else(|| FlipqError::unknown(format!("dirty list held unknown slot {sequence}")))?;
        slot.state = BufferState::Acquired;
        slot.last_acquire_time = monotonic_nanos();
        Ok(AcquireReply {
            buffer: slot.buffer.clone(),
            fence: slot.fence.clone(),
            ui_timestamp: slot.ui_timestamp,
            damages: slot.damages.clone(),
        })
    }

    /// Acquire the frame that should be on screen at `expect_present`.
    ///
    /// Applies the backlog cap first (drop-by-level), then walks the dirty
    /// list dropping frames whose successor is also due (drop-by-
    /// timestamp). A manual-timestamp head due within the next second
    /// stays queued and the call reports `NoBufferReady`.
    pub fn acquire_buffer_expect_present(
        &self,
        expect_present: i64,
        is_using_auto_timestamp: bool
    ) -> Result<AcquireReply> {
        if expect_present <= 0 {
            return self.acquire_buffer();
        }

        let mut drops: Vec<Arc<SurfaceBuffer>> = Vec::new();
        {
            let mut guard = self.core.lock();
            if guard.dirty_list.is_empty() {
                self.log_cache_states(&guard, "acquire with timestamp found no dirty buffer");
                return Err(FlipqError::NoBuffer);
            }
            self.drop_buffers_by_level(&mut guard, &mut drops);
        }
        self.release_dropped_buffers(&mut drops);

        {
            let mut guard = self.core.lock();
            let mut front = match self.dirty_front(&guard) {
                Some(front) => front,
                None => {
                    self.log_cache_states(&guard, "dirty list drained by level drop");
                    return Err(FlipqError::NoBuffer);
                }
            };

            if !front.auto && !present_timestamp_ready(front.desired, expect_present) {
                self.log_cache_states(&guard, "front frame is for the future");
                return Err(FlipqError::NoBufferReady);
            }

            while !(front.auto && !is_using_auto_timestamp) && front.desired <= expect_present {
                let second = match guard.dirty_list.get(1).copied() {
                    Some(sequence) => sequence,
                    None => {
                        debug!(sequence = front.sequence, "last dirty buffer, acquiring");
                        break;
                    }
                };
                let (second_desired, second_auto) = match guard.cache.get(&second) {
                    Some(slot) => (slot.desired_present_timestamp, slot.is_auto_timestamp),
                    None => {
                        break;
                    }
                };
                if (second_auto && !is_using_auto_timestamp) || second_desired > expect_present {
                    break;
                }

                // the successor is also due: this frame will never show
                guard.dirty_list.pop_front();
                if let Some(slot) = guard.cache.get_mut(&front.sequence) {
                    slot.state = BufferState::Acquired;
                    slot.last_acquire_time = monotonic_nanos();
                    drops.push(slot.buffer.clone());
                }
                front = DirtyFront {
                    sequence: second,
                    desired: second_desired,
                    auto: second_auto,
                };
            }

            if !front.auto && !present_timestamp_ready(front.desired, expect_present) {
                self.log_cache_states(&guard, "remaining front frame is for the future");
                return Err(FlipqError::NoBufferReady);
            }
        }
        self.release_dropped_buffers(&mut drops);
        self.acquire_buffer()
    }

    fn dirty_front(&self, guard: &MutexGuard<'_, QueueCore>) -> Option<DirtyFront> {
        let sequence = *guard.dirty_list.front()?;
        let slot = guard.cache.get(&sequence)?;
        Some(DirtyFront {
            sequence,
            desired: slot.desired_present_timestamp,
            auto: slot.is_auto_timestamp,
        })
    }

    /// Cap the dirty backlog at the configured drop-frame level, moving
    /// the oldest frames through Acquired so the normal release path keeps
    /// the invariants whole
    fn drop_buffers_by_level(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        drops: &mut Vec<Arc<SurfaceBuffer>>
    ) {
        let level = guard.drop_frame_level;
        if level <= 0 || guard.dirty_list.len() <= (level as usize) {
            return;
        }
        let now = monotonic_nanos();
        let drop_count = guard.dirty_list.len() - (level as usize);
        for _ in 0..drop_count {
            let Some(sequence) = guard.dirty_list.pop_front() else {
                break;
            };
            if let Some(slot) = guard.cache.get_mut(&sequence) {
                slot.state = BufferState::Acquired;
                slot.last_acquire_time = now;
                drops.push(slot.buffer.clone());
                debug!(unique_id = self.unique_id(), sequence, level, "dropped frame by level");
            }
        }
    }

    /// Dropped frames go through the normal release path with the invalid
    /// fence so listeners fire exactly once per buffer
    fn release_dropped_buffers(&self, drops: &mut Vec<Arc<SurfaceBuffer>>) {
        for buffer in drops.drain(..) {
            if let Err(err) = self.release_buffer(&buffer, SyncFence::invalid()) {
                warn!(
                    unique_id = self.unique_id(),
                    sequence = buffer.sequence(),
                    %err,
                    "drop release failed"
                );
            }
        }
    }

    // ========================================================================
    // ReleaseBuffer
    // ========================================================================

    /// Return an acquired slot to the free list and wake waiting
    /// producers. Release listeners run after the mutex is dropped; with a
    /// seq-and-fence listener bound to the connected pid, as many free
    /// slots as possible are pre-handed to the producer in the same pass.
    pub fn release_buffer(&self, buffer: &Arc<SurfaceBuffer>, fence: SyncFence) -> Result<()> {
        let mut handouts: Vec<(u32, SyncFence)> = Vec::new();
        let seq_and_fence;
        {
            let mut guard = self.core.lock();
            self.release_buffer_locked(&mut guard, buffer, &fence)?;
            seq_and_fence = self.registry.seq_and_fence_active() &&
                guard.listener_pid != 0 &&
                guard.connected_pid == guard.listener_pid;
            if seq_and_fence {
                self.request_buffers_for_listener_locked(&mut guard, &mut handouts);
            }
        }
        self.wait_req.notify_all();
        self.wait_attach.notify_all();
        self.dispatch_release_listeners(buffer, &fence, seq_and_fence, handouts);
        Ok(())
    }

    fn release_buffer_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        buffer: &Arc<SurfaceBuffer>,
        fence: &SyncFence
    ) -> Result<()> {
        let sequence = buffer.sequence();
        if !guard.cache.contains_key(&sequence) {
            // the slot may have been detached while acquired; still tell
            // the redraw thread to drop its reference
            self.registry.notify_deleted_redraw(sequence);
            return Err(FlipqError::BufferNotInCache { sequence });
        }

        let is_deleting;
        let last_acquire_time;
        {
            let slot = guard.cache
                .get_mut(&sequence)
                .ok_or(FlipqError::BufferNotInCache { sequence })?;
            if slot.state != BufferState::Acquired && slot.state != BufferState::Attached {
                return Err(FlipqError::bad_state(format!("release in state {:?}", slot.state)));
            }
            slot.state = BufferState::Released;

            let own = buffer.take_sync_fence().unwrap_or_else(SyncFence::invalid);
            slot.fence = SyncFence::merge("SurfaceReleaseFence", &own, fence);

            last_acquire_time = slot.last_acquire_time;
            is_deleting = slot.is_deleting;
        }
        guard.last_consume_time = monotonic_nanos() - last_acquire_time;
        if is_deleting {
            self.delete_buffer_in_cache(guard, sequence);
        } else {
            guard.free_list.push_back(sequence);
        }
        Ok(())
    }

    /// Pre-hand free slots to the seq-and-fence listener: one request per
    /// distinct cached config, repeated until the queue runs dry
    fn request_buffers_for_listener_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        handouts: &mut Vec<(u32, SyncFence)>
    ) {
        if guard.free_list.is_empty() {
            return;
        }
        let mut configs: Vec<BufferRequestConfig> = Vec::new();
        for &sequence in guard.free_list.iter() {
            if let Some(slot) = guard.cache.get(&sequence) {
                let mut config = slot.buffer.request_config();
                config.timeout_ms = 0;
                if !configs.contains(&config) {
                    configs.push(config);
                }
            }
        }

        let listener_pid = guard.listener_pid;
        let mut index = 0;
        while index < configs.len() {
            match self.request_buffer_locked(guard, &configs[index], true) {
                Ok(reply) => {
                    if let Some(slot) = guard.cache.get_mut(&reply.sequence) {
                        slot.listener_client_pid = listener_pid;
                    }
                    handouts.push((reply.sequence, reply.fence));
                }
                Err(_) => {
                    index += 1;
                }
            }
        }
    }

    fn dispatch_release_listeners(
        &self,
        buffer: &Arc<SurfaceBuffer>,
        fence: &SyncFence,
        seq_and_fence: bool,
        handouts: Vec<(u32, SyncFence)>
    ) {
        self.registry.call_on_release(buffer);

        let (listener, backup, _) = self.registry.release_listeners();
        if let Some(listener) = listener {
            if seq_and_fence {
                for (sequence, handout_fence) in handouts {
                    let delivered = listener
                        .on_buffer_released_with_sequence_and_fence(sequence, &handout_fence)
                        .is_ok();
                    if !delivered {
                        // take the pre-handed slot back
                        let mut guard = self.core.lock();
                        let extra = guard.cache
                            .get(&sequence)
                            .map(|slot| slot.buffer.extra_data())
                            .unwrap_or_default();
                        let _ = self.cancel_buffer_locked(&mut guard, sequence, extra);
                        drop(guard);
                        self.wait_req.notify_all();
                        self.wait_attach.notify_all();
                    }
                }
            } else if listener.on_buffer_released().is_err() {
                warn!(
                    unique_id = self.unique_id(),
                    sequence = buffer.sequence(),
                    "release listener failed"
                );
            }
        }
        if let Some(backup) = backup {
            if backup.on_buffer_released_with_fence(buffer, fence).is_err() {
                warn!(
                    unique_id = self.unique_id(),
                    sequence = buffer.sequence(),
                    "release-with-fence listener failed"
                );
            }
        }
    }

    // ========================================================================
    // Explicit attach / detach
    // ========================================================================

    /// Install an externally allocated buffer as an Attached slot, waiting
    /// up to `timeout_ms` for a known sequence to become Released
    pub fn attach_buffer(&self, buffer: &Arc<SurfaceBuffer>, timeout_ms: i32) -> Result<()> {
        {
            let guard = self.core.lock();
            if !guard.status {
                return Err(FlipqError::NoConsumer);
            }
        }
        if !self.registry.has_consumer() {
            return Err(FlipqError::ConsumerUnregisteredListener);
        }

        let sequence = buffer.sequence();
        let mut guard = self.core.lock();
        if guard.cache.contains_key(&sequence) {
            return self.attach_buffer_update_status(&mut guard, sequence, timeout_ms);
        }

        buffer.set_scaling_mode(guard.scaling_mode);
        if !buffer.is_protected() {
            buffer.map()?;
        }
        buffer.refresh_surface_size();

        let config = BufferRequestConfig {
            width: buffer.width(),
            height: buffer.height(),
            format: buffer.format(),
            usage: buffer.usage(),
            timeout_ms: timeout_ms.max(0) as u32,
            ..Default::default()
        };
        let mut slot = BufferSlot::new(buffer.clone(), BufferState::Attached, config);
        slot.damages = vec![Rect::new(0, 0, buffer.width(), buffer.height())];

        let used = guard.used_size() as i32;
        let queue_size = guard.queue_size as i32;
        if used >= queue_size {
            let reclaimable = (guard.dirty_list.len() + guard.free_list.len()) as i32;
            let needed = used - queue_size + 1;
            if reclaimable < needed {
                return Err(FlipqError::out_of_range("attach exceeds queue size"));
            }
            self.delete_buffers_locked(&mut guard, needed);
        }
        guard.cache.insert(sequence, slot);
        Ok(())
    }

    fn attach_buffer_update_status(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        sequence: u32,
        timeout_ms: i32
    ) -> Result<()> {
        let state = guard.cache
            .get(&sequence)
            .map(|slot| slot.state)
            .ok_or(FlipqError::BufferNotInCache { sequence })?;
        if state != BufferState::Released {
            self.wait_attach.wait_while_for(
                guard,
                |core|
                    core.cache
                        .get(&sequence)
                        .map(|slot| slot.state != BufferState::Released)
                        .unwrap_or(true),
                Duration::from_millis(timeout_ms.max(0) as u64)
            );
        }
        let slot = guard.cache
            .get_mut(&sequence)
            .ok_or(FlipqError::BufferNotInCache { sequence })?;
        if slot.state != BufferState::Released {
            return Err(FlipqError::bad_state(format!("attach wait ended in {:?}", slot.state)));
        }
        slot.state = BufferState::Attached;
        guard.remove_from_free_list(sequence);
        Ok(())
    }

    /// Remove a Requested or Acquired slot; the caller keeps the buffer
    pub fn detach_buffer(&self, buffer: &Arc<SurfaceBuffer>) -> Result<()> {
        let sequence = buffer.sequence();
        let mut guard = self.core.lock();
        let state = guard.cache
            .get(&sequence)
            .map(|slot| slot.state)
            .ok_or(FlipqError::BufferNotInCache { sequence })?;
        match state {
            BufferState::Requested | BufferState::Acquired => {
                self.registry.notify_deleted(sequence);
                guard.cache.remove(&sequence);
                Ok(())
            }
            other => Err(FlipqError::bad_state(format!("detach in state {other:?}"))),
        }
    }

    /// Surface-migration attach: producer side enters Requested, consumer
    /// side enters Acquired (consuming one reserved slot if present)
    pub fn attach_to_queue(&self, buffer: Arc<SurfaceBuffer>, invoker: InvokerType) -> Result<()> {
        let mut guard = self.core.lock();
        self.attach_to_queue_locked(&mut guard, buffer, invoker, true)
    }

    pub(crate) fn attach_to_queue_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        buffer: Arc<SurfaceBuffer>,
        invoker: InvokerType,
        need_map: bool
    ) -> Result<()> {
        let sequence = buffer.sequence();
        let seq_and_fence = self.registry.seq_and_fence_active() &&
            guard.listener_pid != 0 &&
            guard.connected_pid == guard.listener_pid;
        if invoker == InvokerType::Consumer && seq_and_fence {
            return Err(
                FlipqError::not_support("consumer attach while a seq-and-fence listener is bound")
            );
        }
        if guard.used_size() >= guard.queue_size {
            return Err(FlipqError::BufferQueueFull);
        }
        if guard.cache.contains_key(&sequence) {
            return Err(FlipqError::BufferIsInCache { sequence });
        }

        buffer.set_scaling_mode(guard.scaling_mode);
        if need_map && !buffer.is_protected() {
            buffer.map()?;
        }
        buffer.refresh_surface_size();

        let state = match invoker {
            InvokerType::Producer => BufferState::Requested,
            InvokerType::Consumer => {
                if guard.detach_reserved_slots > 0 {
                    guard.detach_reserved_slots -= 1;
                }
                BufferState::Acquired
            }
        };
        let config = buffer.request_config();
        guard.cache.insert(sequence, BufferSlot::new(buffer, state, config));
        Ok(())
    }

    /// Surface-migration detach, optionally reserving the freed capacity
    /// so the producer cannot race-fill it before a re-attach
    pub fn detach_from_queue(
        &self,
        buffer: &Arc<SurfaceBuffer>,
        invoker: InvokerType,
        reserve_slot: bool
    ) -> Result<()> {
        let mut guard = self.core.lock();
        self.detach_from_queue_locked(&mut guard, buffer.sequence(), invoker, reserve_slot)
    }

    pub(crate) fn detach_from_queue_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        sequence: u32,
        invoker: InvokerType,
        reserve_slot: bool
    ) -> Result<()> {
        let state = guard.cache
            .get(&sequence)
            .map(|slot| slot.state)
            .ok_or(FlipqError::BufferNotInCache { sequence })?;
        match invoker {
            InvokerType::Producer => {
                if state != BufferState::Requested {
                    return Err(FlipqError::bad_state(format!("producer detach in state {state:?}")));
                }
                self.registry.notify_deleted(sequence);
                guard.cache.remove(&sequence);
            }
            InvokerType::Consumer => {
                if state != BufferState::Acquired {
                    return Err(FlipqError::bad_state(format!("consumer detach in state {state:?}")));
                }
                self.delete_buffer_in_cache(guard, sequence);
                if reserve_slot {
                    guard.detach_reserved_slots += 1;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Last-flushed buffer
    // ========================================================================

    /// Fetch the most recently flushed buffer with its transform matrix.
    /// `record_sequence` pins the slot against being handed to requests
    /// until [`release_last_flushed_buffer`](Self::release_last_flushed_buffer).
    pub fn get_last_flushed_buffer(
        &self,
        use_new_matrix: bool,
        record_sequence: bool
    ) -> Result<LastFlushedReply> {
        let mut guard = self.core.lock();
        if record_sequence && guard.acquire_last_flushed_seq != INVALID_SEQUENCE {
            return Err(
                FlipqError::bad_state(
                    format!("last flushed {} is already pinned", guard.acquire_last_flushed_seq)
                )
            );
        }
        let sequence = guard.last_flushed_sequence;
        let slot = guard.cache
            .get(&sequence)
            .ok_or_else(|| FlipqError::unknown(format!("last flushed {sequence} not cached")))?;
        if slot.state == BufferState::Requested {
            return Err(FlipqError::bad_state("last flushed buffer is requested"));
        }
        let buffer = slot.buffer.clone();
        if buffer.usage().contains(BufferUsage::PROTECTED) {
            return Err(FlipqError::not_support("last flushed buffer is protected"));
        }

        let damage = Rect::new(0, 0, buffer.width(), buffer.height());
        let matrix = if use_new_matrix {
            compute_transform_matrix_v2(
                guard.last_flushed_transform,
                buffer.width(),
                buffer.height(),
                &damage
            )
        } else {
            compute_transform_matrix(guard.last_flushed_transform)
        };
        let fence = guard.last_flushed_fence.clone();
        if record_sequence {
            guard.acquire_last_flushed_seq = sequence;
        }
        Ok(LastFlushedReply { buffer, fence, matrix })
    }

    pub fn acquire_last_flushed_buffer(&self, use_new_matrix: bool) -> Result<LastFlushedReply> {
        self.get_last_flushed_buffer(use_new_matrix, true)
    }

    pub fn release_last_flushed_buffer(&self, sequence: u32) -> Result<()> {
        let mut guard = self.core.lock();
        if
            guard.acquire_last_flushed_seq == INVALID_SEQUENCE ||
            guard.acquire_last_flushed_seq != sequence
        {
            return Err(
                FlipqError::bad_state(
                    format!("pinned {} does not match {sequence}", guard.acquire_last_flushed_seq)
                )
            );
        }
        guard.acquire_last_flushed_seq = INVALID_SEQUENCE;
        drop(guard);
        self.wait_req.notify_all();
        Ok(())
    }

    // ========================================================================
    // Queue sizing & cache lifecycle
    // ========================================================================

    pub fn set_queue_size(&self, queue_size: u32) -> Result<()> {
        if queue_size == 0 || queue_size > MAX_QUEUE_SIZE {
            return Err(FlipqError::invalid_args(format!("queue size {queue_size}")));
        }
        let mut guard = self.core.lock();
        self.set_queue_size_locked(&mut guard, queue_size)
    }

    fn set_queue_size_locked(
        &self,
        guard: &mut MutexGuard<'_, QueueCore>,
        queue_size: u32
    ) -> Result<()> {
        let mut queue_size = queue_size;
        if guard.max_queue_size != 0 && queue_size > guard.max_queue_size {
            debug!(
                unique_id = self.unique_id(),
                queue_size,
                max = guard.max_queue_size,
                "queue size clamped to max"
            );
            queue_size = guard.max_queue_size;
        }
        if queue_size < guard.detach_reserved_slots {
            return Err(
                FlipqError::invalid_args(
                    format!("queue size {queue_size} below {} reserved slots", guard.detach_reserved_slots)
                )
            );
        }
        let shrink_by = guard.queue_size.saturating_sub(queue_size);
        if shrink_by > 0 {
            self.delete_buffers_locked(guard, shrink_by as i32);
        }
        let grew = queue_size > guard.queue_size;
        guard.queue_size = queue_size;
        if grew {
            self.wait_req.notify_all();
        }
        Ok(())
    }

    pub fn set_max_queue_size(&self, max_queue_size: u32) -> Result<()> {
        if max_queue_size == 0 || max_queue_size > MAX_QUEUE_SIZE {
            return Err(FlipqError::invalid_args(format!("max queue size {max_queue_size}")));
        }
        let mut guard = self.core.lock();
        guard.max_queue_size = max_queue_size;
        if guard.queue_size > max_queue_size {
            return self.set_queue_size_locked(&mut guard, max_queue_size);
        }
        Ok(())
    }

    pub fn max_queue_size(&self) -> u32 {
        self.core.lock().max_queue_size
    }

    /// Shrink the cache by `count` slots: free list first, then dirty,
    /// then tombstones reaped as the remaining slots come back
    pub(crate) fn delete_buffers_locked(&self, guard: &mut MutexGuard<'_, QueueCore>, count: i32) {
        if count <= 0 {
            return;
        }
        self.alloc_done.wait_while(guard, |core| core.allocating);

        let mut remaining = count;
        while remaining > 0 {
            let Some(sequence) = guard.free_list.pop_front() else {
                break;
            };
            self.delete_buffer_in_cache_nowait(guard, sequence);
            remaining -= 1;
        }
        while remaining > 0 {
            let Some(sequence) = guard.dirty_list.pop_front() else {
                break;
            };
            self.delete_buffer_in_cache_nowait(guard, sequence);
            remaining -= 1;
        }
        for slot in guard.cache.values_mut() {
            if remaining <= 0 {
                break;
            }
            if !slot.is_deleting {
                slot.is_deleting = true;
                remaining -= 1;
            }
        }
    }

    /// Wipe the cache. With `clean_all == false` the most recently flushed
    /// slot is reported (and tagged reclaimable) so the display pipeline
    /// can finish presenting it; with `clean_all == true` nothing is
    /// preserved.
    pub fn clean_cache(&self, clean_all: bool) -> Result<Option<u32>> {
        let pre_cache = if clean_all {
            None
        } else {
            let guard = self.core.lock();
            let sequence = guard.last_flushed_sequence;
            guard.cache.contains_key(&sequence).then_some(sequence)
        };

        if let Some(listener) = self.registry.consumer() {
            if clean_all {
                listener.on_go_background();
            } else {
                listener.on_clean_cache(pre_cache);
            }
        }

        let mut guard = self.core.lock();
        if let Some(sequence) = pre_cache {
            if let Some(slot) = guard.cache.get(&sequence) {
                self.allocator.tag_buffer(&slot.buffer, "last_buffer");
            }
        }
        self.clear_locked(&mut guard);
        drop(guard);
        self.wait_req.notify_all();
        Ok(pre_cache)
    }

    /// CleanCache(clean_all) plus the semantic that the consumer side
    /// should drop all of its references
    pub fn go_background(&self) -> Result<()> {
        if let Some(listener) = self.registry.consumer() {
            listener.on_go_background();
        }
        let mut guard = self.core.lock();
        self.clear_locked(&mut guard);
        guard.producer_cache_clean = false;
        guard.producer_cache_list.clear();
        drop(guard);
        self.wait_req.notify_all();
        Ok(())
    }
}

struct DirtyFront {
    sequence: u32,
    desired: i64,
    auto: bool,
}

/// A manual-timestamp frame is ready when it is due, or when its deadline
/// is so far out (over a second) that holding it back would stall playback
fn present_timestamp_ready(desired: i64, expect: i64) -> bool {
    desired <= expect || desired - ONE_SECOND_NANOS > expect
}
