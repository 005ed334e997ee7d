//! Argument and reply records for the opcode table. Fields are encoded
//! in declaration order; adding a field is a wire break.

use serde::{ Deserialize, Serialize };

use crate::types::{
    BufferFlushConfig,
    BufferRequestConfig,
    ExtraData,
    HdrMetaDataRecord,
    PresentTimestampType,
    ScalingMode,
    TunnelHandle,
};

use super::wire::{ BufferDescriptor, FenceDescriptor };

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestArgs {
    pub config: BufferRequestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBuffersArgs {
    pub config: BufferRequestConfig,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequestReply {
    pub sequence: u32,
    pub buffer: Option<BufferDescriptor>,
    pub fence: FenceDescriptor,
    pub extra: ExtraData,
    pub deleting: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelArgs {
    pub sequence: u32,
    pub extra: ExtraData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushArgs {
    pub sequence: u32,
    pub extra: ExtraData,
    pub fence: FenceDescriptor,
    pub config: BufferFlushConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushBatchArgs {
    pub items: Vec<FlushArgs>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachArgs {
    pub buffer: BufferDescriptor,
    pub timeout_ms: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachArgs {
    pub buffer: BufferDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachAndFlushArgs {
    pub buffer: BufferDescriptor,
    pub extra: ExtraData,
    pub fence: FenceDescriptor,
    pub config: BufferFlushConfig,
    pub need_map: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingModeArgs {
    pub sequence: u32,
    pub mode: ScalingMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataArgs {
    pub sequence: u32,
    pub records: Vec<HdrMetaDataRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSetArgs {
    pub sequence: u32,
    pub key: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelHandleArgs {
    pub handle: Option<TunnelHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentTimestampArgs {
    pub sequence: u32,
    pub kind: PresentTimestampType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastFlushedArgs {
    pub use_new_matrix: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLastFlushedReply {
    pub buffer: BufferDescriptor,
    pub fence: FenceDescriptor,
    pub matrix: [f32; 16],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanCacheArgs {
    pub clean_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreAllocArgs {
    pub config: BufferRequestConfig,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LppShareFdArgs {
    pub fd: i32,
    pub attach: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReleaseListenerArgs {
    pub seq_and_fence: bool,
}
