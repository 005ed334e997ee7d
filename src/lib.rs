//! flipq - Shared graphics buffer queue
//!
//! A cross-process producer/consumer rendezvous handing GPU- or
//! DMA-backed image buffers from a drawing client to a compositor with
//! zero-copy semantics and fence synchronization.
//!
//! ```text
//! Allocator ──┐
//! Transport ──┼──► BufferQueue ──► BufferQueueConsumer ──► Compositor
//! Clock ──────┘     ▲
//!                   └── BufferQueueProducer ◄── DrawingClient
//! ```

pub mod buffer;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod fence;
pub mod matrix;
pub mod producer;
pub mod queue;
pub mod transport;
pub mod types;

// Re-export main components
pub use buffer::{ Allocator, BufferHandle, MemfdAllocator, SurfaceBuffer };
pub use consumer::BufferQueueConsumer;
pub use error::{ FlipqError, Result };
pub use fence::SyncFence;
pub use producer::{ ApsProcessor, BufferQueueProducer, ProducerRequestResult };
pub use queue::{
    AcquireReply,
    BufferQueue,
    BufferState,
    ConsumerListener,
    InvokerType,
    LastFlushedReply,
    ProducerListener,
    RequestBufferReply,
    SurfaceProperty,
};
pub use transport::{ LoopbackTransport, ProducerOp, ProducerStub, RemoteProducer, Transport };
pub use types::{ BufferFlushConfig, BufferRequestConfig, BufferUsage, PixelFormat, Rect };

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
