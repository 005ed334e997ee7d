//! Allocator capability.
//!
//! The concrete gralloc / DMA-BUF ioctl allocator lives outside the core;
//! the queue only needs this trait. The in-tree [`MemfdAllocator`] backs
//! buffers with anonymous memfd regions, which is enough for local
//! rendering and for the test suite.

use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ FlipqError, Result };
use crate::types::{ BufferRequestConfig, BufferUsage };

use super::{ BufferHandle, SurfaceBuffer };

/// Allocation capability injected into the queue.
///
/// Calls can take tens of milliseconds (DMA pinning); the queue always
/// invokes them with its mutex released.
pub trait Allocator: Send + Sync {
    /// Allocate a buffer for `config`. When `previous` is given the
    /// allocator may recycle its backing memory; the caller guarantees
    /// the previous buffer has already left every cache.
    fn allocate(
        &self,
        config: &BufferRequestConfig,
        previous: Option<&Arc<SurfaceBuffer>>
    ) -> Result<Arc<SurfaceBuffer>>;

    /// Label the allocation for per-process accounting (DMA name ioctl in
    /// the kernel-backed allocator). Best effort.
    fn tag_buffer(&self, buffer: &SurfaceBuffer, label: &str) {
        let _ = (buffer, label);
    }
}

/// memfd-backed allocator for local rendering and tests
#[derive(Default)]
pub struct MemfdAllocator;

impl MemfdAllocator {
    fn create_memfd(len: usize) -> Result<File> {
        let name = std::ffi::CString::new("flipq-buffer").expect("static name");
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(FlipqError::unknown(format!("memfd_create failed: {}", std::io::Error::last_os_error())));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(len as u64).map_err(|e| FlipqError::unknown(format!("ftruncate failed: {e}")))?;
        Ok(file)
    }

    fn layout(config: &BufferRequestConfig) -> Result<(i32, usize)> {
        if config.width <= 0 || config.height <= 0 {
            return Err(FlipqError::invalid_args(format!("bad size {}x{}", config.width, config.height)));
        }
        let align = config.stride_alignment.max(1) as usize;
        let row = (config.width as usize) * config.format.bytes_per_pixel();
        let stride = row.div_ceil(align) * align;
        Ok((stride as i32, stride * (config.height as usize)))
    }
}

impl Allocator for MemfdAllocator {
    fn allocate(
        &self,
        config: &BufferRequestConfig,
        previous: Option<&Arc<SurfaceBuffer>>
    ) -> Result<Arc<SurfaceBuffer>> {
        let (stride, len) = Self::layout(config)?;

        // Recycle the previous backing memory when the byte length still
        // fits; the slot that owned it is already gone from the cache.
        let file = match previous {
            Some(prev) if prev.size() == len && prev.format() == config.format =>
                prev.handle().try_clone_file()?,
            _ => Self::create_memfd(len)?,
        };

        let handle = BufferHandle::new(
            file,
            len,
            config.width,
            config.height,
            stride,
            config.format,
            config.usage
        );
        let buffer = SurfaceBuffer::new(handle, config.clone());
        if !config.usage.contains(BufferUsage::PROTECTED) {
            buffer.map()?;
        }
        debug!(
            sequence = buffer.sequence(),
            width = config.width,
            height = config.height,
            len,
            "allocated memfd buffer"
        );
        Ok(Arc::new(buffer))
    }

    fn tag_buffer(&self, buffer: &SurfaceBuffer, label: &str) {
        // memfd has no DMA name ioctl; record the intent for diagnostics
        debug!(sequence = buffer.sequence(), fd = buffer.handle().fd(), label, "tag buffer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    #[test]
    fn test_stride_respects_alignment() {
        let config = BufferRequestConfig {
            width: 30,
            height: 2,
            stride_alignment: 64,
            format: PixelFormat::Rgb888,
            ..Default::default()
        };
        let (stride, len) = MemfdAllocator::layout(&config).unwrap();
        assert_eq!(stride, 128); // 30 * 3 = 90, rounded to 64
        assert_eq!(len, 256);
    }

    #[test]
    fn test_allocate_maps_and_is_writable() {
        let alloc = MemfdAllocator::default();
        let config = BufferRequestConfig { width: 16, height: 16, ..Default::default() };
        let buffer = alloc.allocate(&config, None).unwrap();
        assert!(buffer.handle().is_mapped());
        buffer
            .handle()
            .with_bytes_mut(|bytes| {
                bytes[0] = 0xab;
                assert_eq!(bytes.len(), (buffer.stride() * 16) as usize);
            })
            .unwrap();
        buffer.flush_cache().unwrap();
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let alloc = MemfdAllocator::default();
        let config = BufferRequestConfig { width: 0, height: 16, ..Default::default() };
        assert!(matches!(alloc.allocate(&config, None), Err(FlipqError::InvalidArguments { .. })));
    }
}
