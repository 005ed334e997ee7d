//! Queue-wide constants and tuning knobs.

/// Default number of slots a freshly created queue may cache.
pub const DEFAULT_QUEUE_SIZE: u32 = 3;

/// Hard upper bound on the slot cache, independent of configuration.
pub const MAX_QUEUE_SIZE: u32 = 64;

/// Upper bound on the rotating (cycle) buffer count, twice the cache cap.
pub const MAX_ROTATING_BUFFER_COUNT: u32 = MAX_QUEUE_SIZE * 2;

/// Sentinel for "no sequence recorded".
pub const INVALID_SEQUENCE: u32 = u32::MAX;

/// A desired-present timestamp more than this far in the future is treated
/// as bogus and presented immediately rather than held back.
pub const ONE_SECOND_NANOS: i64 = 1_000_000_000;

/// How long the reuse path waits for the previous release fence before
/// giving up on handle reuse and allocating from scratch.
pub const REALLOC_FENCE_WAIT_MS: u64 = 3000;

/// Byte budget for a producer extra-data blob riding on a slot.
pub const EXTRA_DATA_MAX_BYTES: usize = 1024;

/// Longest accepted app framework type label.
pub const APP_FRAMEWORK_TYPE_MAX_LEN: usize = 64;

/// Global alpha is either unset (-1) or an 8-bit coverage value.
pub const GLOBAL_ALPHA_MIN: i32 = -1;
pub const GLOBAL_ALPHA_MAX: i32 = 255;

/// Frame gravity / fixed rotation value ranges, -1 meaning "unset".
pub const MIN_FRAME_GRAVITY: i32 = -1;
pub const MAX_FRAME_GRAVITY: i32 = 15;
pub const MIN_FIXED_ROTATION: i32 = -1;
pub const MAX_FIXED_ROTATION: i32 = 1;

/// Low-power playback shared region: fixed 12 KiB, an 8-entry descriptor
/// ring, at most two descriptors acquired by the consumer at once, and a
/// two-frame cooldown before the fence map is torn down on a source switch.
pub const LPP_SHARED_MEM_SIZE: usize = 12 * 1024;
pub const LPP_SLOT_COUNT: usize = 8;
pub const MAX_LPP_IN_FLIGHT: usize = 2;
pub const MAX_LPP_SKIP_COUNT: u32 = 2;
