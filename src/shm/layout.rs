//! Byte layout of the Shared Control Block
//!
//! These offsets are an ABI contract with the worker process. Any change
//! must bump [`LAYOUT_VERSION`].

/// `"SCTL"` in little-endian byte order
pub const MAGIC: u32 = u32::from_le_bytes(*b"SCTL");

/// Current layout revision
pub const LAYOUT_VERSION: u32 = 1;

/// Number of per-channel gain slots
pub const MAX_CHANNELS: usize = 32;

pub const MAGIC_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 8;
pub const TAP_OFFSET_OFFSET: usize = 12;
pub const TAP_WRITE_CURSOR_OFFSET: usize = 16;
pub const TAP_CAPACITY_OFFSET: usize = 20;
pub const MASTER_VOLUME_OFFSET: usize = 24;
pub const CHANNEL_VOLUMES_OFFSET: usize = 28;
pub const SATURATION_THRESHOLD_OFFSET: usize = CHANNEL_VOLUMES_OFFSET + 4 * MAX_CHANNELS;
pub const SILENCE_THRESHOLD_OFFSET: usize = SATURATION_THRESHOLD_OFFSET + 4;
pub const AVERAGING_WEIGHT_OFFSET: usize = SILENCE_THRESHOLD_OFFSET + 4;
pub const SATURATION_DEBOUNCE_FACTOR_OFFSET: usize = AVERAGING_WEIGHT_OFFSET + 4;
pub const SATURATION_RECOVERY_FACTOR_OFFSET: usize = SATURATION_DEBOUNCE_FACTOR_OFFSET + 4;
pub const SATURATION_DEBOUNCE_VOLUME_OFFSET: usize = SATURATION_RECOVERY_FACTOR_OFFSET + 4;
pub const SATURATION_EFFECTIVE_VOLUME_OFFSET: usize = SATURATION_DEBOUNCE_VOLUME_OFFSET + 4;
pub const SAMPLE_RATE_OFFSET: usize = SATURATION_EFFECTIVE_VOLUME_OFFSET + 4;
pub const CHANNEL_MASK_OFFSET: usize = SAMPLE_RATE_OFFSET + 4;
pub const LAST_FRAME_TICK_COUNT_OFFSET: usize = CHANNEL_MASK_OFFSET + 4;
pub const LAST_FRAME_MAX_AMPLITUDE_OFFSET: usize = LAST_FRAME_TICK_COUNT_OFFSET + 8;

/// Header size, padded so the tap region starts 8-byte aligned
pub const HEADER_SIZE: usize = 208;

/// Tap ring size requested for every new block
pub const DEFAULT_TAP_CAPACITY: usize = 8 * 1024 * 1024;

const _: () = assert!(LAST_FRAME_TICK_COUNT_OFFSET % 8 == 0);
const _: () = assert!(LAST_FRAME_MAX_AMPLITUDE_OFFSET + 4 <= HEADER_SIZE);
const _: () = assert!(HEADER_SIZE % 8 == 0);

/// Byte offset of the gain slot for a channel bit index
pub const fn channel_volume_offset(index: usize) -> usize {
    CHANNEL_VOLUMES_OFFSET + 4 * index
}

/// Host page size
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Total mapping size for a tap of `tap_capacity` bytes, rounded up to whole pages
pub fn region_size(tap_capacity: usize, page_size: usize) -> usize {
    let raw = HEADER_SIZE + tap_capacity;
    raw.div_ceil(page_size) * page_size
}
