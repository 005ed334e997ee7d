//! Low-power playback slot mirror.
//!
//! When the surface source is [`SourceType::LowPowerVideo`] the video
//! pipeline publishes frame descriptors through a fixed shared-memory
//! ring instead of the RPC path; the consumer reads descriptors straight
//! out of the mapping.
//!
//! ## Memory layout (bit-exact, little-endian hosts)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Shared region (12 KiB)                                  │
//! ├──────────────────────────────────────────────────────────┤
//! │  Header (16 bytes)                                       │
//! │  ├─ read_offset:  i32                                    │
//! │  ├─ write_offset: i32                                    │
//! │  └─ is_stop_shb_draw: u8 (+7 pad)                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  8 x slot entry (40 bytes each)                          │
//! │  { seq_id: u32, timestamp: i64, crop: [i32;4],           │
//! │    is_rs_using: u8 }                                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Fields are accessed with atomic load/store only; no fence fd lives in
//! the ring. Fences are tracked in a side map keyed by sequence.

use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{ AtomicI32, AtomicI64, AtomicU32, AtomicU8, Ordering };

use memmap2::{ MmapMut, MmapOptions };
use static_assertions::const_assert;
use tracing::{ debug, warn };

use crate::constants::{
    LPP_SHARED_MEM_SIZE,
    LPP_SLOT_COUNT,
    MAX_LPP_IN_FLIGHT,
    MAX_LPP_SKIP_COUNT,
};
use crate::error::{ FlipqError, Result };
use crate::fence::{ monotonic_nanos, SyncFence };
use crate::types::{ BufferFlushConfig, MetadataKey, Rect, SourceType };

use super::slot::{ BufferSlot, BufferState };
use super::{ AcquireReply, BufferQueue, QueueCore };

/// Ring header at offset zero of the shared region
#[repr(C)]
pub struct LppSharedHeader {
    pub read_offset: AtomicI32,
    pub write_offset: AtomicI32,
    pub is_stop_shb_draw: AtomicU8,
    _pad: [u8; 7],
}

/// One descriptor of the 8-entry ring
#[repr(C)]
pub struct LppSlotEntry {
    pub seq_id: AtomicU32,
    _pad0: [u8; 4],
    pub timestamp: AtomicI64,
    pub crop: [AtomicI32; 4],
    pub is_rs_using: AtomicU8,
    _pad1: [u8; 7],
}

const_assert!(std::mem::size_of::<LppSharedHeader>() == 16);
const_assert!(std::mem::size_of::<LppSlotEntry>() == 40);
const_assert!(
    std::mem::size_of::<LppSharedHeader>() +
        LPP_SLOT_COUNT * std::mem::size_of::<LppSlotEntry>() <= LPP_SHARED_MEM_SIZE
);

/// Mapped view of the shared descriptor ring
pub struct LppRegion {
    map: MmapMut,
    _file: File,
}

impl LppRegion {
    /// Map a region received from the video pipeline
    pub fn map_file(file: File) -> Result<Self> {
        let len = file
            .metadata()
            .map_err(|e| FlipqError::invalid_args(format!("lpp fd stat failed: {e}")))?
            .len() as usize;
        if len < LPP_SHARED_MEM_SIZE {
            return Err(FlipqError::invalid_args(format!("lpp region is {len} bytes")));
        }
        let map = unsafe {
            MmapOptions::new()
                .len(LPP_SHARED_MEM_SIZE)
                .map_mut(&file)
                .map_err(|e| FlipqError::invalid_args(format!("lpp mmap failed: {e}")))?
        };
        Ok(Self { map, _file: file })
    }

    /// Create a fresh memfd-backed region; the returned file is the
    /// handle to pass to the other process
    pub fn create_anonymous() -> Result<(Self, File)> {
        let name = std::ffi::CString::new("flipq-lpp").expect("static name");
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(
                FlipqError::unknown(format!("memfd_create failed: {}", std::io::Error::last_os_error()))
            );
        }
        let file = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        file
            .set_len(LPP_SHARED_MEM_SIZE as u64)
            .map_err(|e| FlipqError::unknown(format!("ftruncate failed: {e}")))?;
        let peer = file
            .try_clone()
            .map_err(|e| FlipqError::unknown(format!("fd dup failed: {e}")))?;
        let region = Self::map_file(file)?;
        Ok((region, peer))
    }

    pub fn header(&self) -> &LppSharedHeader {
        // the mapping is at least LPP_SHARED_MEM_SIZE and page aligned
        unsafe { &*(self.map.as_ptr() as *const LppSharedHeader) }
    }

    pub fn slot(&self, index: usize) -> &LppSlotEntry {
        debug_assert!(index < LPP_SLOT_COUNT);
        let base = std::mem::size_of::<LppSharedHeader>();
        let offset = base + index * std::mem::size_of::<LppSlotEntry>();
        unsafe { &*(self.map.as_ptr().add(offset) as *const LppSlotEntry) }
    }
}

/// Queue-side LPP bookkeeping (lives behind the queue mutex)
pub(crate) struct LppState {
    pub region: Option<LppRegion>,
    /// Side map of acquired ring slots, keyed by buffer sequence
    pub fence_map: HashMap<u32, usize>,
    pub last_write_offset: i32,
    pub last_write_timestamp: i64,
    pub skip_count: u32,
    pub last_rs_to_shb_write_offset: i32,
    pub is_rs_draw: bool,
}

impl LppState {
    pub fn new() -> Self {
        Self {
            region: None,
            fence_map: HashMap::new(),
            last_write_offset: 0,
            last_write_timestamp: 0,
            skip_count: 0,
            last_rs_to_shb_write_offset: -1,
            is_rs_draw: false,
        }
    }
}

/// Unmark ring slots whose buffer has come back with a signalled (or
/// absent) release fence, then enforce the in-flight cap
fn check_lpp_fences(
    region: &LppRegion,
    fence_map: &mut HashMap<u32, usize>,
    cache: &HashMap<u32, BufferSlot>
) -> bool {
    fence_map.retain(|sequence, &mut index| {
        let Some(slot) = cache.get(sequence) else {
            return false;
        };
        let in_flight = slot.state == BufferState::Acquired ||
            (slot.state == BufferState::Released &&
                slot.fence.is_valid() &&
                !slot.fence.is_signalled());
        if !in_flight {
            region.slot(index).is_rs_using.store(0, Ordering::Release);
        }
        in_flight
    });

    for index in 0..LPP_SLOT_COUNT {
        let entry = region.slot(index);
        let sequence = entry.seq_id.load(Ordering::Acquire);
        if !fence_map.contains_key(&sequence) && entry.is_rs_using.load(Ordering::Acquire) != 0 {
            entry.is_rs_using.store(0, Ordering::Release);
        }
    }
    fence_map.len() <= MAX_LPP_IN_FLIGHT
}

impl BufferQueue {
    /// Claim the most recently written ring descriptor and return its
    /// buffer as if acquired through the queue
    pub fn acquire_lpp_buffer(&self) -> Result<AcquireReply> {
        let mut guard = self.core.lock();
        let QueueCore { lpp, cache, source_type, transform, .. } = &mut *guard;
        if *source_type != SourceType::LowPowerVideo {
            return Err(FlipqError::not_support("surface source is not low-power video"));
        }
        let Some(region) = lpp.region.as_ref() else {
            return Err(FlipqError::not_support("no lpp region attached"));
        };

        let slot_count = LPP_SLOT_COUNT as i32;
        let header = region.header();
        let read_offset = header.read_offset.load(Ordering::Acquire);
        let write_offset = header.write_offset.load(Ordering::Acquire);
        if
            read_offset < 0 ||
            read_offset >= slot_count ||
            write_offset < 0 ||
            write_offset >= slot_count
        {
            warn!(unique_id = self.unique_id(), read_offset, write_offset, "lpp offsets invalid");
            return Err(FlipqError::invalid_args("lpp ring offsets out of range"));
        }

        if !check_lpp_fences(region, &mut lpp.fence_map, cache) {
            debug!(unique_id = self.unique_id(), "lpp in-flight cap reached");
            return Err(FlipqError::NoBuffer);
        }

        // claim the slot just behind the write cursor
        let claim = (write_offset + slot_count - 1) % slot_count;
        let last_index = lpp.last_write_offset.rem_euclid(slot_count) as usize;
        let no_update = write_offset == lpp.last_write_offset &&
            read_offset == claim &&
            region.slot(last_index).timestamp.load(Ordering::Acquire) == lpp.last_write_timestamp;
        if no_update {
            return Err(FlipqError::NoBuffer);
        }

        let entry = region.slot(claim as usize);
        entry.is_rs_using.store(1, Ordering::Release);
        lpp.skip_count = 0;

        let sequence = entry.seq_id.load(Ordering::Acquire);
        let timestamp = entry.timestamp.load(Ordering::Acquire);
        let crop = Rect::new(
            entry.crop[0].load(Ordering::Acquire),
            entry.crop[1].load(Ordering::Acquire),
            entry.crop[2].load(Ordering::Acquire),
            entry.crop[3].load(Ordering::Acquire)
        );
        header.read_offset.store(claim, Ordering::Release);
        lpp.last_write_offset = write_offset;
        lpp.last_write_timestamp = region
            .slot(write_offset as usize)
            .timestamp.load(Ordering::Acquire);

        let Some(slot) = cache.get_mut(&sequence) else {
            entry.is_rs_using.store(0, Ordering::Release);
            debug!(unique_id = self.unique_id(), sequence, "lpp descriptor names unknown buffer");
            return Err(FlipqError::NoBuffer);
        };
        lpp.fence_map.insert(sequence, claim as usize);
        slot.state = BufferState::Acquired;
        slot.last_acquire_time = monotonic_nanos();
        let buffer = slot.buffer.clone();

        let mut crop_bytes = Vec::with_capacity(16);
        for value in [crop.x, crop.y, crop.w, crop.h] {
            crop_bytes.extend_from_slice(&value.to_le_bytes());
        }
        buffer.set_metadata(MetadataKey::CropRegion, crop_bytes);
        buffer.set_transform(*transform);

        Ok(AcquireReply {
            damages: vec![Rect::new(0, 0, buffer.width(), buffer.height())],
            buffer,
            fence: SyncFence::invalid(),
            ui_timestamp: timestamp,
        })
    }

    /// Attach (`Some`) or tear down (`None`) the shared descriptor ring
    pub fn set_lpp_share_fd(&self, file: Option<File>) -> Result<()> {
        match file {
            Some(file) => {
                let mut guard = self.core.lock();
                if guard.source_type != SourceType::LowPowerVideo {
                    return Err(FlipqError::not_support("surface source is not low-power video"));
                }
                let region = LppRegion::map_file(file)?;
                guard.lpp.region = Some(region);
                guard.lpp.fence_map.clear();
                debug!(unique_id = self.unique_id(), "lpp region attached");
            }
            None => {
                // hand the pending frame to the normal path before teardown
                self.flush_lpp_buffer();
                let mut guard = self.core.lock();
                if guard.lpp.region.take().is_some() {
                    debug!(unique_id = self.unique_id(), "lpp region detached");
                }
                guard.lpp.fence_map.clear();
            }
        }
        Ok(())
    }

    /// Route the latest ring descriptor through the ordinary flush path
    pub(crate) fn flush_lpp_buffer(&self) {
        let Ok(reply) = self.acquire_lpp_buffer() else {
            return;
        };
        let config = BufferFlushConfig {
            damages: reply.damages.clone(),
            ui_timestamp: reply.ui_timestamp.max(0) as u64,
            desired_present_timestamp: -1,
        };
        let extra = reply.buffer.extra_data();
        if let Err(err) = self.flush_buffer(reply.buffer.sequence(), extra, reply.fence, &config) {
            debug!(unique_id = self.unique_id(), %err, "lpp flush skipped");
        }
    }

    /// Switch between the direct-draw (SHB) and composite-draw (RS)
    /// paths. The fence map is only torn down after the direct path has
    /// produced more than the in-flight cap of frames, so a source flips
    /// within the two-frame cooldown report `NoBufferReady`.
    pub fn set_lpp_draw_source(&self, is_shb_source: bool, is_rs_source: bool) -> Result<()> {
        let mut guard = self.core.lock();
        let QueueCore { lpp, cache, source_type, .. } = &mut *guard;
        if *source_type != SourceType::LowPowerVideo || lpp.region.is_none() {
            lpp.is_rs_draw = false;
            return Err(FlipqError::not_support("surface source is not low-power video"));
        }
        let Some(region) = lpp.region.as_ref() else {
            return Err(FlipqError::not_support("no lpp region attached"));
        };
        let header = region.header();

        if lpp.skip_count >= MAX_LPP_SKIP_COUNT {
            header.is_stop_shb_draw.store(1, Ordering::Release);
            return Err(FlipqError::out_of_range("lpp skip count exceeded"));
        }

        let was_direct = header.is_stop_shb_draw.load(Ordering::Acquire) == 0;
        header.is_stop_shb_draw.store(u8::from(!is_shb_source), Ordering::Release);
        lpp.is_rs_draw = is_rs_source;

        if !is_shb_source {
            // composite path takes over
            lpp.last_rs_to_shb_write_offset = -1;
            return Ok(());
        }

        if !was_direct {
            // first direct frame after a composite stretch
            lpp.last_rs_to_shb_write_offset = lpp.last_write_offset;
            return Err(FlipqError::NoBufferReady);
        }

        let slot_count = LPP_SLOT_COUNT as i32;
        let direct_frames = if lpp.last_rs_to_shb_write_offset == -1 {
            0
        } else {
            (lpp.last_write_offset - lpp.last_rs_to_shb_write_offset + slot_count) % slot_count
        };
        if direct_frames <= (MAX_LPP_IN_FLIGHT as i32) {
            return Err(FlipqError::NoBufferReady);
        }

        // past the cooldown: forcibly release tracked fences
        lpp.fence_map.clear();
        check_lpp_fences(region, &mut lpp.fence_map, cache);
        Ok(())
    }

    /// Record that the compositor skipped an LPP frame
    pub fn mark_lpp_frame_skipped(&self) {
        self.core.lock().lpp.skip_count += 1;
    }

    /// Whether the composite-draw path currently owns LPP frames
    pub fn is_lpp_rs_draw(&self) -> bool {
        self.core.lock().lpp.is_rs_draw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_layout() {
        let (region, _peer) = LppRegion::create_anonymous().unwrap();
        let header = region.header();
        header.write_offset.store(3, Ordering::Release);
        assert_eq!(header.write_offset.load(Ordering::Acquire), 3);

        let entry = region.slot(2);
        entry.seq_id.store(42, Ordering::Release);
        entry.timestamp.store(1234, Ordering::Release);
        assert_eq!(entry.seq_id.load(Ordering::Acquire), 42);
        assert_eq!(entry.timestamp.load(Ordering::Acquire), 1234);
    }

    #[test]
    fn test_peer_sees_writes() {
        let (region, peer) = LppRegion::create_anonymous().unwrap();
        region.header().write_offset.store(5, Ordering::Release);
        region.slot(4).seq_id.store(9, Ordering::Release);

        let view = LppRegion::map_file(peer).unwrap();
        assert_eq!(view.header().write_offset.load(Ordering::Acquire), 5);
        assert_eq!(view.slot(4).seq_id.load(Ordering::Acquire), 9);
    }
}
