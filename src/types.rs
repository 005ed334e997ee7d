//! Core value types shared by the queue, the facades and the wire codec.

use bitflags::bitflags;
use serde::{ Deserialize, Serialize };

use crate::constants::EXTRA_DATA_MAX_BYTES;
use crate::error::{ FlipqError, Result };

bitflags! {
    /// Usage bitmask carried by every buffer allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u64 {
        /// CPU reads the mapped buffer
        const CPU_READ = 1 << 0;
        /// CPU writes the mapped buffer; flush required before handoff
        const CPU_WRITE = 1 << 1;
        /// Backed by DMA-capable memory
        const MEM_DMA = 1 << 3;
        /// Contents must never be mapped for CPU access
        const PROTECTED = 1 << 14;
        /// Buffer is shared between CPU and hardware compression paths
        const CPU_HW_BOTH = (1 << 0) | (1 << 1) | (1 << 17);
    }
}

impl Serialize for BufferUsage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BufferUsage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(BufferUsage::from_bits_retain(u64::deserialize(deserializer)?))
    }
}

/// Pixel formats the queue understands; the allocator decides bytes per pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PixelFormat {
    Rgba8888 = 12,
    Rgbx8888 = 13,
    Bgra8888 = 15,
    Rgb888 = 21,
    Rgb565 = 22,
    Ycbcr420Sp = 32,
    Ycrcb420Sp = 33,
}

impl PixelFormat {
    /// Bytes per pixel for stride computation (planar formats round up)
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8888 | Self::Rgbx8888 | Self::Bgra8888 => 4,
            Self::Rgb888 => 3,
            Self::Rgb565 | Self::Ycbcr420Sp | Self::Ycrcb420Sp => 2,
        }
    }
}

/// Color gamut requested for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ColorGamut {
    Native = 0,
    Srgb = 4,
    DisplayP3 = 6,
    Bt2020 = 8,
    DisplayBt2020 = 10,
}

/// Surface rotation / flip applied at composition time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum TransformType {
    #[default]
    RotateNone = 0,
    Rotate90 = 1,
    Rotate180 = 2,
    Rotate270 = 3,
    FlipH = 4,
    FlipV = 5,
    FlipHRotate90 = 6,
    FlipVRotate90 = 7,
}

impl TransformType {
    /// Wire validation for an untrusted discriminant
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::RotateNone),
            1 => Ok(Self::Rotate90),
            2 => Ok(Self::Rotate180),
            3 => Ok(Self::Rotate270),
            4 => Ok(Self::FlipH),
            5 => Ok(Self::FlipV),
            6 => Ok(Self::FlipHRotate90),
            7 => Ok(Self::FlipVRotate90),
            other => Err(FlipqError::invalid_args(format!("transform {other} out of range"))),
        }
    }
}

/// How an acquired buffer is fit to its display frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum ScalingMode {
    Freeze = 0,
    #[default]
    ScaleToWindow = 1,
    ScaleCrop = 2,
    NoScaleCrop = 3,
    ScaleFit = 4,
}

/// Which pipeline feeds the producer side of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum SourceType {
    #[default]
    Default = 0,
    Ui = 1,
    Video = 2,
    Camera = 3,
    Game = 4,
    LowPowerVideo = 5,
}

/// Alpha interpretation for composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum AlphaType {
    #[default]
    Unknown = 0,
    Opaque = 1,
    Premul = 2,
    Unpremul = 3,
}

/// Keys of the per-buffer metadata store stamped by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetadataKey {
    /// HEBC access type: CPU-visible vs hardware-only
    RequestAccessType,
    /// Forced global alpha riding with the buffer
    ForceGlobalAlpha,
    /// Crop region written by the low-power playback path
    CropRegion,
    /// Static HDR metadata blob
    HdrStaticMetadata,
    /// Dynamic HDR metadata blob
    HdrDynamicMetadata,
    /// HDR metadata type tag
    HdrMetadataType,
    /// Color space selected via the colorspace surface ops
    ColorSpace,
}

/// HDR metadata carried on a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HdrMetaDataType {
    #[default]
    None,
    MetaData,
    MetaDataSet,
}

/// One HDR metadata record of the legacy per-key kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HdrMetaDataRecord {
    pub key: u32,
    pub value: f32,
}

/// Axis-aligned damage rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }
}

/// Everything a producer asks for when requesting a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRequestConfig {
    pub width: i32,
    pub height: i32,
    pub stride_alignment: i32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    pub timeout_ms: u32,
    pub color_gamut: ColorGamut,
    pub transform: TransformType,
}

impl BufferRequestConfig {
    /// Slot-reuse equality: a cached buffer satisfies the request iff
    /// geometry, format and usage all match.
    pub fn matches(&self, other: &BufferRequestConfig) -> bool {
        self.width == other.width &&
            self.height == other.height &&
            self.format == other.format &&
            self.usage == other.usage
    }
}

impl Default for BufferRequestConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            stride_alignment: 8,
            format: PixelFormat::Rgba8888,
            usage: BufferUsage::CPU_READ | BufferUsage::CPU_WRITE,
            timeout_ms: 3000,
            color_gamut: ColorGamut::Srgb,
            transform: TransformType::RotateNone,
        }
    }
}

/// Everything a producer supplies when flushing a drawn slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BufferFlushConfig {
    pub damages: Vec<Rect>,
    /// UI timestamp forwarded from the toolkit, nanoseconds
    pub ui_timestamp: u64,
    /// Explicit desired present time; <= 0 selects the fallback chain
    pub desired_present_timestamp: i64,
}

impl BufferFlushConfig {
    /// Flush config covering the whole buffer with default timing
    pub fn full_damage(width: i32, height: i32) -> Self {
        Self {
            damages: vec![Rect::new(0, 0, width, height)],
            ui_timestamp: 0,
            desired_present_timestamp: 0,
        }
    }
}

/// Kinds of hardware present feedback a slot can record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PresentTimestampType {
    #[default]
    Unsupported,
    Delay,
    Timestamp,
}

/// Hardware present feedback stored on a slot by the display pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PresentTimestamp {
    pub kind: PresentTimestampType,
    pub time: i64,
}

/// A single value inside an extra-data blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtraValue {
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
}

impl ExtraValue {
    fn byte_len(&self) -> usize {
        match self {
            Self::I32(_) => 4,
            Self::I64(_) | Self::F64(_) => 8,
            Self::Str(s) => s.len(),
        }
    }
}

/// Bounded key/value blob a producer attaches to a slot for the consumer.
///
/// The byte budget covers keys and values together; exceeding it fails the
/// insert with `OutOfRange` and leaves the blob untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraData {
    entries: std::collections::BTreeMap<String, ExtraValue>,
}

impl ExtraData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one entry, enforcing the blob byte budget
    pub fn set(&mut self, key: impl Into<String>, value: ExtraValue) -> Result<()> {
        let key = key.into();
        let projected = self.byte_len() + key.len() + value.byte_len() -
            self.entries
                .get(&key)
                .map(|old| key.len() + old.byte_len())
                .unwrap_or(0);
        if projected > EXTRA_DATA_MAX_BYTES {
            return Err(FlipqError::out_of_range(format!("extra data would grow to {projected} bytes")));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&ExtraValue> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn byte_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, v)| k.len() + v.byte_len())
            .sum()
    }
}

/// Out-of-band fd carrier for sideband media content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelHandle {
    pub fds: Vec<i32>,
    pub attributes: Vec<i32>,
}

impl TunnelHandle {
    /// Two handles differ when any fd or attribute differs
    pub fn different(&self, other: &TunnelHandle) -> bool {
        self != other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_match_ignores_timing_fields() {
        let a = BufferRequestConfig { width: 256, height: 256, ..Default::default() };
        let mut b = a.clone();
        b.timeout_ms = 0;
        b.color_gamut = ColorGamut::DisplayP3;
        assert!(a.matches(&b));

        b.usage |= BufferUsage::MEM_DMA;
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_extra_data_budget() {
        let mut blob = ExtraData::new();
        blob.set("frame", ExtraValue::I64(42)).unwrap();
        assert_eq!(blob.get("frame"), Some(&ExtraValue::I64(42)));

        let huge = "x".repeat(EXTRA_DATA_MAX_BYTES);
        let err = blob.set("payload", ExtraValue::Str(huge)).unwrap_err();
        assert!(matches!(err, FlipqError::OutOfRange { .. }));
        // failed insert must not disturb existing entries
        assert_eq!(blob.get("frame"), Some(&ExtraValue::I64(42)));
    }

    #[test]
    fn test_transform_wire_validation() {
        assert_eq!(TransformType::from_wire(3).unwrap(), TransformType::Rotate270);
        assert!(TransformType::from_wire(8).is_err());
    }
}
