//! Typed view over a Shared Control Block

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::channel::Channel;
use super::layout::*;
use super::region::Region;
use super::tap::{TapReader, TapWriter};
use crate::error::ShmError;

/// Status bits in the `flags` word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Flag {
    /// Controller has written the initial settings
    Initialized = 1,
    /// Worker should pass audio through (inverse of mute)
    Enabled = 2,
    /// Cooperative stop signal for the worker
    AbortRequested = 4,
}

impl Flag {
    pub fn bit(self) -> u32 {
        self as u32
    }
}

/// Worker-written fields sampled by the poller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSnapshot {
    pub sample_rate: u32,
    pub channel_mask: u32,
    pub channel_volumes: [f32; MAX_CHANNELS],
    pub master_volume: f32,
    pub saturation_effective_volume: f32,
    pub last_frame_tick_count: u64,
    pub last_frame_max_amplitude: f32,
    pub tap_write_cursor: u32,
}

macro_rules! f32_field {
    ($(#[$doc:meta])* $get:ident, $set:ident, $offset:expr) => {
        $(#[$doc])*
        pub fn $get(&self) -> f32 {
            self.load_f32($offset)
        }

        pub fn $set(&self, value: f32) {
            self.store_f32($offset, value)
        }
    };
}

/// Shared Control Block for one session
///
/// Flags and the tap write cursor are accessed atomically with
/// acquire/release ordering. Every other field is an independent
/// last-writer-wins cell.
pub struct ControlBlock {
    name: String,
    region: Region,
    /// Tap geometry as validated on attach; the header copy is worker-writable
    tap_offset: usize,
    tap_capacity: usize,
}

impl ControlBlock {
    /// Create or open the named block with the default 8 MiB tap
    pub fn create(name: &str) -> Result<Self, ShmError> {
        Self::create_with_capacity(name, DEFAULT_TAP_CAPACITY)
    }

    /// Create or open the named block with a specific tap capacity
    pub fn create_with_capacity(name: &str, tap_capacity: usize) -> Result<Self, ShmError> {
        let len = region_size(tap_capacity, page_size());
        let region = Region::create(name, len)?;
        Self::attach(name.to_string(), region, tap_capacity)
    }

    /// Open an existing named block without creating it
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let len = region_size(DEFAULT_TAP_CAPACITY, page_size());
        let region = Region::open(name, len)?;
        Self::attach(name.to_string(), region, DEFAULT_TAP_CAPACITY)
    }

    /// Block backed by an anonymous mapping, not reachable by other processes
    pub fn anonymous(tap_capacity: usize) -> Result<Self, ShmError> {
        let len = region_size(tap_capacity, page_size());
        let region = Region::anonymous(len)?;
        Self::attach(String::new(), region, tap_capacity)
    }

    /// Validate the header, writing it first if the region is fresh
    fn attach(name: String, region: Region, tap_capacity: usize) -> Result<Self, ShmError> {
        if tap_capacity == 0 || HEADER_SIZE + tap_capacity > region.len() {
            return Err(ShmError::InvalidTapCapacity(tap_capacity));
        }

        let magic = region.atomic_u32(MAGIC_OFFSET).load(Ordering::Acquire);
        let version = region.atomic_u32(VERSION_OFFSET).load(Ordering::Acquire);

        if magic == 0 && version == 0 {
            region.atomic_u32(VERSION_OFFSET).store(LAYOUT_VERSION, Ordering::Relaxed);
            region.atomic_u32(MAGIC_OFFSET).store(MAGIC, Ordering::Release);
        } else if magic != MAGIC || version != LAYOUT_VERSION {
            return Err(ShmError::LayoutMismatch {
                name,
                magic,
                version,
            });
        }

        let capacity_cell = region.atomic_u32(TAP_CAPACITY_OFFSET);
        let offset_cell = region.atomic_u32(TAP_OFFSET_OFFSET);
        let (tap_offset, tap_capacity) = match capacity_cell.load(Ordering::Acquire) as usize {
            0 => {
                offset_cell.store(HEADER_SIZE as u32, Ordering::Relaxed);
                region.atomic_u32(TAP_WRITE_CURSOR_OFFSET).store(0, Ordering::Relaxed);
                capacity_cell.store(tap_capacity as u32, Ordering::Release);
                (HEADER_SIZE, tap_capacity)
            }
            existing => {
                let offset = offset_cell.load(Ordering::Relaxed) as usize;
                let end = offset + existing;
                if offset < HEADER_SIZE || end > region.len() {
                    return Err(ShmError::TooSmall {
                        name,
                        actual: region.len(),
                        expected: end.max(HEADER_SIZE + existing),
                    });
                }
                (offset, existing)
            }
        };

        Ok(Self {
            name,
            region,
            tap_offset,
            tap_capacity,
        })
    }

    /// Name the worker uses to attach (empty for anonymous blocks)
    pub fn name(&self) -> &str {
        &self.name
    }

    fn u32_cell(&self, offset: usize) -> &AtomicU32 {
        self.region.atomic_u32(offset)
    }

    fn load_f32(&self, offset: usize) -> f32 {
        f32::from_bits(self.u32_cell(offset).load(Ordering::Relaxed))
    }

    fn store_f32(&self, offset: usize, value: f32) {
        self.u32_cell(offset).store(value.to_bits(), Ordering::Relaxed)
    }

    /// Raw flags word
    pub fn flags(&self) -> u32 {
        self.u32_cell(FLAGS_OFFSET).load(Ordering::Acquire)
    }

    pub fn flag(&self, flag: Flag) -> bool {
        self.flags() & flag.bit() != 0
    }

    /// Set or clear one flag without disturbing the others
    pub fn set_flag(&self, flag: Flag, value: bool) {
        let cell = self.u32_cell(FLAGS_OFFSET);
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = if value {
                current | flag.bit()
            } else {
                current & !flag.bit()
            };
            if next == current {
                return;
            }
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    f32_field!(
        /// Raw master gain (already scaled by the session's max master volume)
        master_volume, set_master_volume, MASTER_VOLUME_OFFSET
    );
    f32_field!(saturation_threshold, set_saturation_threshold, SATURATION_THRESHOLD_OFFSET);
    f32_field!(silence_threshold, set_silence_threshold, SILENCE_THRESHOLD_OFFSET);
    f32_field!(averaging_weight, set_averaging_weight, AVERAGING_WEIGHT_OFFSET);
    f32_field!(
        saturation_debounce_factor,
        set_saturation_debounce_factor,
        SATURATION_DEBOUNCE_FACTOR_OFFSET
    );
    f32_field!(
        saturation_recovery_factor,
        set_saturation_recovery_factor,
        SATURATION_RECOVERY_FACTOR_OFFSET
    );
    f32_field!(
        saturation_debounce_volume,
        set_saturation_debounce_volume,
        SATURATION_DEBOUNCE_VOLUME_OFFSET
    );
    f32_field!(
        /// Gain the worker currently applies after saturation handling
        saturation_effective_volume,
        set_saturation_effective_volume,
        SATURATION_EFFECTIVE_VOLUME_OFFSET
    );

    pub fn channel_volume(&self, channel: Channel) -> f32 {
        self.load_f32(channel.volume_offset())
    }

    pub fn set_channel_volume(&self, channel: Channel, value: f32) {
        self.store_f32(channel.volume_offset(), value)
    }

    pub fn sample_rate(&self) -> u32 {
        self.u32_cell(SAMPLE_RATE_OFFSET).load(Ordering::Relaxed)
    }

    pub fn channel_mask(&self) -> u32 {
        self.u32_cell(CHANNEL_MASK_OFFSET).load(Ordering::Relaxed)
    }

    pub fn last_frame_tick_count(&self) -> u64 {
        self.region
            .atomic_u64(LAST_FRAME_TICK_COUNT_OFFSET)
            .load(Ordering::Relaxed)
    }

    pub fn last_frame_max_amplitude(&self) -> f32 {
        self.load_f32(LAST_FRAME_MAX_AMPLITUDE_OFFSET)
    }

    /// Worker side: publish the negotiated stream format
    pub fn report_format(&self, sample_rate: u32, channel_mask: u32) {
        self.u32_cell(SAMPLE_RATE_OFFSET).store(sample_rate, Ordering::Relaxed);
        self.u32_cell(CHANNEL_MASK_OFFSET).store(channel_mask, Ordering::Relaxed);
    }

    /// Worker side: publish the metering result of one frame
    pub fn report_frame(&self, tick_count: u64, max_amplitude: f32) {
        self.store_f32(LAST_FRAME_MAX_AMPLITUDE_OFFSET, max_amplitude);
        self.region
            .atomic_u64(LAST_FRAME_TICK_COUNT_OFFSET)
            .store(tick_count, Ordering::Relaxed);
    }

    /// Byte offset of the tap ring from the start of the block
    pub fn tap_offset(&self) -> usize {
        self.tap_offset
    }

    pub fn tap_capacity(&self) -> usize {
        self.tap_capacity
    }

    /// Write cursor, reduced into `0..tap_capacity`
    pub fn tap_write_cursor(&self) -> usize {
        self.u32_cell(TAP_WRITE_CURSOR_OFFSET).load(Ordering::Acquire) as usize % self.tap_capacity
    }

    pub(crate) fn publish_tap_cursor(&self, cursor: usize) {
        self.u32_cell(TAP_WRITE_CURSOR_OFFSET)
            .store(cursor as u32, Ordering::Release)
    }

    pub(crate) fn read_tap(&self, position: usize, dst: &mut [u8]) {
        self.region.read_bytes(self.tap_offset() + position, dst)
    }

    pub(crate) fn write_tap(&self, position: usize, src: &[u8]) {
        self.region.write_bytes(self.tap_offset() + position, src)
    }

    /// Reader positioned at the current write cursor
    pub fn open_tap_stream(self: &Arc<Self>) -> TapReader {
        TapReader::new(Arc::clone(self))
    }

    /// Writer for the worker side of the tap contract
    pub fn tap_writer(self: &Arc<Self>) -> TapWriter {
        TapWriter::new(Arc::clone(self))
    }

    /// Sample every worker-written field in one pass
    pub fn snapshot(&self) -> ControlSnapshot {
        let mut channel_volumes = [0.0; MAX_CHANNELS];
        for (index, volume) in channel_volumes.iter_mut().enumerate() {
            *volume = self.load_f32(channel_volume_offset(index));
        }
        ControlSnapshot {
            sample_rate: self.sample_rate(),
            channel_mask: self.channel_mask(),
            channel_volumes,
            master_volume: self.master_volume(),
            saturation_effective_volume: self.saturation_effective_volume(),
            last_frame_tick_count: self.last_frame_tick_count(),
            last_frame_max_amplitude: self.last_frame_max_amplitude(),
            tap_write_cursor: self.tap_write_cursor() as u32,
        }
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("name", &self.name)
            .field("flags", &self.flags())
            .field("tap_capacity", &self.tap_capacity())
            .finish()
    }
}
