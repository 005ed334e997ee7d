//! Fd-owning buffer handle with optional CPU mapping.

use std::fs::File;
use std::os::unix::io::{ AsRawFd, RawFd };

use memmap2::{ MmapMut, MmapOptions };
use parking_lot::Mutex;

use crate::error::{ FlipqError, Result };
use crate::types::{ BufferUsage, PixelFormat };

/// Owns the backing file descriptor of one image allocation.
///
/// The fd closes when the last [`SurfaceBuffer`](super::SurfaceBuffer)
/// reference drops. Mapping is lazy; protected buffers refuse it.
pub struct BufferHandle {
    file: File,
    len: usize,
    width: i32,
    height: i32,
    stride: i32,
    format: PixelFormat,
    usage: BufferUsage,
    mapping: Mutex<Option<MmapMut>>,
}

impl BufferHandle {
    pub fn new(
        file: File,
        len: usize,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
        usage: BufferUsage
    ) -> Self {
        Self {
            file,
            len,
            width,
            height,
            stride,
            format,
            usage,
            mapping: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn stride(&self) -> i32 {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Duplicate the underlying file for handle reuse during realloc
    pub fn try_clone_file(&self) -> Result<File> {
        self.file
            .try_clone()
            .map_err(|e| FlipqError::unknown(format!("fd dup failed: {e}")))
    }

    /// Map the allocation for CPU access. Idempotent.
    pub fn map(&self) -> Result<()> {
        if self.usage.contains(BufferUsage::PROTECTED) {
            return Err(FlipqError::not_support("protected buffers cannot be mapped"));
        }
        let mut mapping = self.mapping.lock();
        if mapping.is_some() {
            return Ok(());
        }
        let map = unsafe {
            MmapOptions::new()
                .len(self.len)
                .map_mut(&self.file)
                .map_err(|e| FlipqError::unknown(format!("mmap failed: {e}")))?
        };
        *mapping = Some(map);
        Ok(())
    }

    /// Drop the CPU mapping if one exists
    pub fn unmap(&self) {
        self.mapping.lock().take();
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.lock().is_some()
    }

    /// Flush CPU writes back to the backing memory (msync)
    pub fn flush_cache(&self) -> Result<()> {
        let mapping = self.mapping.lock();
        match mapping.as_ref() {
            Some(map) =>
                map.flush().map_err(|e| FlipqError::unknown(format!("cache flush failed: {e}"))),
            None => Ok(()),
        }
    }

    /// Run `f` over the mapped bytes, mapping on demand
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.map()?;
        let mut mapping = self.mapping.lock();
        let map = mapping
            .as_mut()
            .ok_or_else(|| FlipqError::unknown("mapping vanished"))?;
        Ok(f(&mut map[..]))
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("fd", &self.fd())
            .field("len", &self.len)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .finish()
    }
}
