//! Buffer objects and allocation.
//!
//! A [`SurfaceBuffer`] is the unit handed between producer and consumer:
//! an fd-backed image allocation plus the mutable bookkeeping that rides
//! with it (extra data, metadata, an optional sync fence). Ownership is
//! shared: the queue cache, the producer-side cache and an acquired
//! consumer may each hold a reference; the backing fd closes on last drop.

mod allocator;
mod handle;
mod surface_buffer;

pub use allocator::{ Allocator, MemfdAllocator };
pub use handle::BufferHandle;
pub use surface_buffer::SurfaceBuffer;
