//! Remote-facing plumbing: the transport capability, the producer-side
//! opcode table, the dispatching stub and the client encoder.
//!
//! Serialization of requests is external to the queue core; the core
//! only sees the [`Transport`] capability. The wire format is fixed by
//! [`wire`] and the opcode table below.

mod records;
mod remote;
mod stub;
mod wire;

pub use records::*;
pub use remote::RemoteProducer;
pub use stub::ProducerStub;
pub use wire::{
    decode_frame,
    decode_payload,
    decode_reply,
    encode_error_reply,
    encode_frame,
    encode_payload,
    encode_reply,
    BufferDescriptor,
    FenceDescriptor,
    FRAME_MAGIC,
    INTERFACE_TOKEN,
};

use std::thread;
use std::time::Duration;

use crate::error::{ FlipqError, Result };

/// One round-trip over whatever carries the frames (binder-like IPC,
/// a unix socket, or the in-process loopback used by tests)
pub trait Transport: Send + Sync {
    fn call(&self, frame: &[u8]) -> Result<Vec<u8>>;
}

/// In-process transport wiring a client directly to a stub
pub struct LoopbackTransport {
    stub: ProducerStub,
}

impl LoopbackTransport {
    pub fn new(stub: ProducerStub) -> Self {
        Self { stub }
    }
}

impl Transport for LoopbackTransport {
    fn call(&self, frame: &[u8]) -> Result<Vec<u8>> {
        Ok(self.stub.dispatch(frame))
    }
}

macro_rules! producer_ops {
    ($($name:ident = $value:expr),+ $(,)?) => {
        /// Producer-side opcode table. Each opcode carries a fixed
        /// argument record and reply schema (see [`records`]).
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u32)]
        pub enum ProducerOp {
            $($name = $value),+
        }

        impl TryFrom<u32> for ProducerOp {
            type Error = FlipqError;

            fn try_from(value: u32) -> Result<Self> {
                match value {
                    $($value => Ok(Self::$name),)+
                    other => Err(FlipqError::invalid_args(format!("unknown opcode {other}"))),
                }
            }
        }
    };
}

producer_ops! {
    GetInitInfo = 1,
    RequestBuffer = 2,
    RequestBuffers = 3,
    CancelBuffer = 4,
    FlushBuffer = 5,
    FlushBuffers = 6,
    AttachToQueue = 7,
    DetachFromQueue = 8,
    AttachBuffer = 9,
    DetachBuffer = 10,
    GetQueueSize = 11,
    SetQueueSize = 12,
    GetName = 13,
    GetDefaultWidth = 14,
    GetDefaultHeight = 15,
    GetDefaultUsage = 16,
    SetDefaultUsage = 17,
    GetUniqueId = 18,
    CleanCache = 19,
    RegisterReleaseListener = 20,
    UnregisterReleaseListener = 21,
    RegisterReleaseListenerWithFence = 22,
    UnregisterReleaseListenerWithFence = 23,
    SetTransform = 24,
    GetTransform = 25,
    Connect = 26,
    Disconnect = 27,
    ConnectStrictly = 28,
    DisconnectStrictly = 29,
    SetScalingMode = 30,
    SetScalingModeAll = 31,
    SetMetadata = 32,
    SetMetadataSet = 33,
    SetTunnelHandle = 34,
    GoBackground = 35,
    GetPresentTimestamp = 36,
    GetLastFlushedBuffer = 37,
    GetTransformHint = 38,
    SetTransformHint = 39,
    SetBufferHold = 40,
    SetBufferName = 41,
    SetBufferReallocFlag = 42,
    GetSourceType = 43,
    SetSourceType = 44,
    GetAppFrameworkType = 45,
    SetAppFrameworkType = 46,
    SetHdrWhitePointBrightness = 47,
    SetSdrWhitePointBrightness = 48,
    AcquireLastFlushedBuffer = 49,
    ReleaseLastFlushedBuffer = 50,
    SetGlobalAlpha = 51,
    SetNoblockMode = 52,
    RequestAndDetachBuffer = 53,
    AttachAndFlushBuffer = 54,
    GetRotatingBufferCount = 55,
    SetRotatingBufferCount = 56,
    SetFrameGravity = 57,
    SetFixedRotation = 58,
    RegisterPropertyListener = 59,
    UnregisterPropertyListener = 60,
    PreAllocBuffers = 61,
    SetLppShareFd = 62,
    SetAlphaType = 63,
    CheckConnection = 64,
}

/// Service-side liveness probe replacing remote death recipients: polls
/// the peer and drives an automatic disconnect when it stops answering
pub struct LivenessProbe {
    shutdown: crossbeam::channel::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LivenessProbe {
    /// `probe` returns whether the peer still answers; `on_dead` fires
    /// once when it stops
    pub fn spawn(
        interval: Duration,
        probe: impl Fn() -> bool + Send + 'static,
        on_dead: impl FnOnce() + Send + 'static
    ) -> Self {
        let (shutdown, rx) = crossbeam::channel::bounded::<()>(1);
        let handle = thread::spawn(move || {
            let ticker = crossbeam::channel::tick(interval);
            let mut on_dead = Some(on_dead);
            loop {
                crossbeam::select! {
                    recv(rx) -> _ => break,
                    recv(ticker) -> _ => {
                        if !probe() {
                            if let Some(callback) = on_dead.take() {
                                callback();
                            }
                            break;
                        }
                    }
                }
            }
        });
        Self { shutdown, handle: Some(handle) }
    }
}

impl Drop for LivenessProbe {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
