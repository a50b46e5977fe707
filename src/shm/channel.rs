//! Speaker channel identifiers
//!
//! A channel is a single bit of the worker's channel mask. Its gain slot in
//! the control block is found through the bit index (trailing zero count).

use serde::{Deserialize, Serialize};

use super::layout::{channel_volume_offset, MAX_CHANNELS};

/// One speaker position, as a single-bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(u32);

impl Channel {
    pub const FRONT_LEFT: Channel = Channel(0x1);
    pub const FRONT_RIGHT: Channel = Channel(0x2);
    pub const FRONT_CENTER: Channel = Channel(0x4);
    pub const LOW_FREQUENCY: Channel = Channel(0x8);
    pub const BACK_LEFT: Channel = Channel(0x10);
    pub const BACK_RIGHT: Channel = Channel(0x20);
    pub const FRONT_LEFT_OF_CENTER: Channel = Channel(0x40);
    pub const FRONT_RIGHT_OF_CENTER: Channel = Channel(0x80);
    pub const BACK_CENTER: Channel = Channel(0x100);
    pub const SIDE_LEFT: Channel = Channel(0x200);
    pub const SIDE_RIGHT: Channel = Channel(0x400);
    pub const TOP_CENTER: Channel = Channel(0x800);
    pub const TOP_FRONT_LEFT: Channel = Channel(0x1000);
    pub const TOP_FRONT_CENTER: Channel = Channel(0x2000);
    pub const TOP_FRONT_RIGHT: Channel = Channel(0x4000);
    pub const TOP_BACK_LEFT: Channel = Channel(0x8000);
    pub const TOP_BACK_CENTER: Channel = Channel(0x10000);
    pub const TOP_BACK_RIGHT: Channel = Channel(0x20000);

    /// Build from a raw mask; `None` unless exactly one bit is set
    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits.count_ones() == 1).then_some(Channel(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Position of the bit, which is also the gain slot index
    pub fn index(self) -> usize {
        self.0.trailing_zeros() as usize
    }

    /// Byte offset of this channel's gain in the control block
    pub fn volume_offset(self) -> usize {
        VOLUME_OFFSETS[self.index()]
    }

    /// Display name, or `None` for bits without a named speaker position
    pub fn name(self) -> Option<&'static str> {
        NAMES.get(self.index()).copied()
    }

    /// Channels present in `mask`, lowest bit first
    pub fn iter_mask(mask: u32) -> impl Iterator<Item = Channel> {
        (0..MAX_CHANNELS as u32)
            .map(|bit| 1u32 << bit)
            .filter(move |bit| mask & bit != 0)
            .map(Channel)
    }
}

const NAMES: [&str; 18] = [
    "Front Left",
    "Front Right",
    "Front Center",
    "Low Frequency",
    "Back Left",
    "Back Right",
    "Front Left of Center",
    "Front Right of Center",
    "Back Center",
    "Side Left",
    "Side Right",
    "Top Center",
    "Top Front Left",
    "Top Front Center",
    "Top Front Right",
    "Top Back Left",
    "Top Back Center",
    "Top Back Right",
];

const fn volume_offsets() -> [usize; MAX_CHANNELS] {
    let mut table = [0; MAX_CHANNELS];
    let mut i = 0;
    while i < MAX_CHANNELS {
        table[i] = channel_volume_offset(i);
        i += 1;
    }
    table
}

static VOLUME_OFFSETS: [usize; MAX_CHANNELS] = volume_offsets();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_bit_required() {
        assert_eq!(Channel::from_bits(0x4), Some(Channel::FRONT_CENTER));
        assert_eq!(Channel::from_bits(0), None);
        assert_eq!(Channel::from_bits(0x3), None);
    }

    #[test]
    fn test_index_and_offset() {
        assert_eq!(Channel::FRONT_LEFT.index(), 0);
        assert_eq!(Channel::SIDE_RIGHT.index(), 10);
        assert_eq!(Channel::FRONT_RIGHT.volume_offset(), channel_volume_offset(1));
        assert_eq!(Channel::TOP_BACK_RIGHT.name(), Some("Top Back Right"));
        assert_eq!(Channel::from_bits(1 << 31).unwrap().name(), None);
    }

    #[test]
    fn test_iter_mask() {
        let channels: Vec<_> = Channel::iter_mask(0x3 | 0x600).collect();
        assert_eq!(
            channels,
            vec![
                Channel::FRONT_LEFT,
                Channel::FRONT_RIGHT,
                Channel::SIDE_LEFT,
                Channel::SIDE_RIGHT
            ]
        );
    }
}
