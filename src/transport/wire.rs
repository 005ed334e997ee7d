//! Wire framing and payload encoding.
//!
//! Every request frame carries a fixed 24-byte header followed by a
//! bincode-encoded argument record (fields in declaration order):
//!
//! ```text
//! ┌────────┬────────┬──────────┬─────────┬────────┬───────────┐
//! │ magic  │ opcode │  token   │ pay_len │ crc32  │  payload  │
//! │  u32   │  u32   │   u64    │   u32   │  u32   │   bytes   │
//! └────────┴────────┴──────────┴─────────┴────────┴───────────┘
//! ```
//!
//! Replies begin with a little-endian `i32` error code, zero meaning
//! success, followed by the bincode-encoded reply record.

use serde::de::DeserializeOwned;
use serde::{ Deserialize, Serialize };

use crate::buffer::{ BufferHandle, SurfaceBuffer };
use crate::error::{ FlipqError, Result };
use crate::fence::SyncFence;
use crate::types::{ BufferRequestConfig, BufferUsage, PixelFormat };

/// "FLIQ"
pub const FRAME_MAGIC: u32 = 0x464c4951;

/// Interface token validated by the stub before dispatch
pub const INTERFACE_TOKEN: u64 = 0x666c_6970_7131_2e30; // "flipq1.0"

pub const HEADER_LEN: usize = 24;

pub fn encode_frame(opcode: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    frame.extend_from_slice(&opcode.to_le_bytes());
    frame.extend_from_slice(&INTERFACE_TOKEN.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into opcode and payload, validating magic, token,
/// length and checksum
pub fn decode_frame(frame: &[u8]) -> Result<(u32, &[u8])> {
    if frame.len() < HEADER_LEN {
        return Err(FlipqError::invalid_args(format!("frame is {} bytes", frame.len())));
    }
    let magic = u32::from_le_bytes(frame[0..4].try_into().unwrap_or_default());
    if magic != FRAME_MAGIC {
        return Err(FlipqError::invalid_args(format!("bad frame magic {magic:#x}")));
    }
    let opcode = u32::from_le_bytes(frame[4..8].try_into().unwrap_or_default());
    let token = u64::from_le_bytes(frame[8..16].try_into().unwrap_or_default());
    if token != INTERFACE_TOKEN {
        return Err(FlipqError::invalid_args("interface token mismatch"));
    }
    let payload_len = u32::from_le_bytes(frame[16..20].try_into().unwrap_or_default()) as usize;
    let crc = u32::from_le_bytes(frame[20..24].try_into().unwrap_or_default());
    let payload = &frame[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(
            FlipqError::invalid_args(
                format!("payload is {} bytes, header says {payload_len}", payload.len())
            )
        );
    }
    if crc32fast::hash(payload) != crc {
        return Err(FlipqError::invalid_args("payload checksum mismatch"));
    }
    Ok((opcode, payload))
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde
        ::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| FlipqError::invalid_args(format!("encode failed: {e}")))
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::serde
        ::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| FlipqError::invalid_args(format!("decode failed: {e}")))
}

/// Build a success reply: zero error code plus the encoded record
pub fn encode_reply<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = encode_payload(value)?;
    let mut reply = Vec::with_capacity(4 + payload.len());
    reply.extend_from_slice(&0i32.to_le_bytes());
    reply.extend_from_slice(&payload);
    Ok(reply)
}

/// Build an error reply carrying only the wire code
pub fn encode_error_reply(err: &FlipqError) -> Vec<u8> {
    err.wire_code().to_le_bytes().to_vec()
}

/// Split a reply into its error (if any) and record bytes
pub fn decode_reply(reply: &[u8]) -> Result<&[u8]> {
    if reply.len() < 4 {
        return Err(FlipqError::invalid_args(format!("reply is {} bytes", reply.len())));
    }
    let code = i32::from_le_bytes(reply[0..4].try_into().unwrap_or_default());
    match FlipqError::from_wire_code(code) {
        Some(err) => Err(err),
        None => Ok(&reply[4..]),
    }
}

// ============================================================================
// Descriptors for objects that cross the wire
// ============================================================================

/// Everything needed to reopen a buffer on the peer side. The fd itself
/// travels out-of-band (dup'd over the IPC channel); here it is carried
/// as a raw descriptor number valid within the transport's domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub sequence: u32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    pub len: u64,
    pub fd: i32,
}

impl BufferDescriptor {
    pub fn from_buffer(buffer: &SurfaceBuffer) -> Self {
        Self {
            sequence: buffer.sequence(),
            width: buffer.width(),
            height: buffer.height(),
            stride: buffer.stride(),
            format: buffer.format(),
            usage: buffer.usage(),
            len: buffer.size() as u64,
            fd: buffer.handle().fd(),
        }
    }

    /// Reopen the described buffer by duplicating its descriptor,
    /// preserving the sequence so caches stay coherent across the wire
    pub fn open(&self) -> Result<std::sync::Arc<SurfaceBuffer>> {
        let dup = unsafe { libc::dup(self.fd) };
        if dup < 0 {
            return Err(
                FlipqError::unknown(format!("fd dup failed: {}", std::io::Error::last_os_error()))
            );
        }
        let file = unsafe { <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(dup) };
        let handle = BufferHandle::new(
            file,
            self.len as usize,
            self.width,
            self.height,
            self.stride,
            self.format,
            self.usage
        );
        let config = BufferRequestConfig {
            width: self.width,
            height: self.height,
            format: self.format,
            usage: self.usage,
            ..Default::default()
        };
        Ok(std::sync::Arc::new(SurfaceBuffer::with_sequence(handle, config, self.sequence)))
    }
}

/// Software fence state crossing the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FenceDescriptor {
    pub valid: bool,
    pub signalled_at: Option<i64>,
}

impl FenceDescriptor {
    pub fn from_fence(fence: &SyncFence) -> Self {
        Self {
            valid: fence.is_valid(),
            signalled_at: fence.signalled_time(),
        }
    }

    pub fn to_fence(self) -> SyncFence {
        if !self.valid {
            return SyncFence::invalid();
        }
        let fence = SyncFence::new("wire");
        if let Some(timestamp) = self.signalled_at {
            fence.signal_at(timestamp);
        }
        fence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = encode_frame(7, b"payload");
        let (opcode, payload) = decode_frame(&frame).unwrap();
        assert_eq!(opcode, 7);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_frame_rejects_corruption() {
        let mut frame = encode_frame(7, b"payload");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(decode_frame(&frame).is_err());

        let mut bad_token = encode_frame(7, b"x");
        bad_token[8] ^= 0xff;
        assert!(decode_frame(&bad_token).is_err());
    }

    #[test]
    fn test_reply_error_round_trip() {
        let reply = encode_error_reply(&FlipqError::NoBuffer);
        assert_eq!(decode_reply(&reply).unwrap_err(), FlipqError::NoBuffer);

        let ok = encode_reply(&42u32).unwrap();
        let bytes = decode_reply(&ok).unwrap();
        assert_eq!(decode_payload::<u32>(bytes).unwrap(), 42);
    }

    #[test]
    fn test_fence_descriptor_round_trip() {
        let fence = SyncFence::new("gpu");
        fence.signal_at(99);
        let descriptor = FenceDescriptor::from_fence(&fence);
        let back = descriptor.to_fence();
        assert_eq!(back.signalled_time(), Some(99));

        let invalid = FenceDescriptor::from_fence(&SyncFence::invalid());
        assert!(!invalid.to_fence().is_valid());
    }
}
