//! Measurement quality flags and packet flag bytes

use serde::{Deserialize, Serialize};

/// 32-bit measurement quality bitset
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct StateFlags(pub u32);

impl StateFlags {
    pub const NORMAL: StateFlags = StateFlags(0x0000_0000);
    pub const BAD_DATA: StateFlags = StateFlags(0x0000_0001);
    pub const SUSPECT_DATA: StateFlags = StateFlags(0x0000_0002);
    pub const OVER_RANGE_ERROR: StateFlags = StateFlags(0x0000_0004);
    pub const UNDER_RANGE_ERROR: StateFlags = StateFlags(0x0000_0008);
    pub const ALARM_HIGH: StateFlags = StateFlags(0x0000_0010);
    pub const ALARM_LOW: StateFlags = StateFlags(0x0000_0020);
    pub const WARNING_HIGH: StateFlags = StateFlags(0x0000_0040);
    pub const WARNING_LOW: StateFlags = StateFlags(0x0000_0080);
    pub const FLATLINE_ALARM: StateFlags = StateFlags(0x0000_0100);
    pub const COMPARISON_ALARM: StateFlags = StateFlags(0x0000_0200);
    pub const ROC_ALARM: StateFlags = StateFlags(0x0000_0400);
    pub const RECEIVED_AS_BAD: StateFlags = StateFlags(0x0000_0800);
    pub const CALCULATED_VALUE: StateFlags = StateFlags(0x0000_1000);
    pub const CALCULATION_ERROR: StateFlags = StateFlags(0x0000_2000);
    pub const CALCULATION_WARNING: StateFlags = StateFlags(0x0000_4000);
    pub const RESERVED_QUALITY: StateFlags = StateFlags(0x0000_8000);
    pub const BAD_TIME: StateFlags = StateFlags(0x0001_0000);
    pub const SUSPECT_TIME: StateFlags = StateFlags(0x0002_0000);
    pub const LATE_TIME_ALARM: StateFlags = StateFlags(0x0004_0000);
    pub const FUTURE_TIME_ALARM: StateFlags = StateFlags(0x0008_0000);
    pub const UP_SAMPLED: StateFlags = StateFlags(0x0010_0000);
    pub const DOWN_SAMPLED: StateFlags = StateFlags(0x0020_0000);
    pub const DISCARDED_VALUE: StateFlags = StateFlags(0x0040_0000);
    pub const RESERVED_TIME: StateFlags = StateFlags(0x0080_0000);
    pub const USER_DEFINED_1: StateFlags = StateFlags(0x0100_0000);
    pub const USER_DEFINED_2: StateFlags = StateFlags(0x0200_0000);
    pub const USER_DEFINED_3: StateFlags = StateFlags(0x0400_0000);
    pub const USER_DEFINED_4: StateFlags = StateFlags(0x0800_0000);
    pub const USER_DEFINED_5: StateFlags = StateFlags(0x1000_0000);
    pub const SYSTEM_ERROR: StateFlags = StateFlags(0x2000_0000);
    pub const SYSTEM_WARNING: StateFlags = StateFlags(0x4000_0000);
    pub const MEASUREMENT_ERROR: StateFlags = StateFlags(0x8000_0000);

    pub fn contains(self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: StateFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_normal(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for StateFlags {
    type Output = StateFlags;
    fn bitor(self, rhs: StateFlags) -> StateFlags {
        StateFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StateFlags {
    fn bitor_assign(&mut self, rhs: StateFlags) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for StateFlags {
    type Output = StateFlags;
    fn bitand(self, rhs: StateFlags) -> StateFlags {
        StateFlags(self.0 & rhs.0)
    }
}

/// Data-packet header flags (one byte per packet)
pub mod data_packet_flags {
    /// Measurements carry synchronized (frame-aligned) timestamps
    pub const SYNCHRONIZED: u8 = 0x01;
    /// Payload uses the compact measurement format
    pub const COMPACT: u8 = 0x02;
    /// Odd cipher key selector for encrypted data channels
    pub const CIPHER_INDEX: u8 = 0x04;
    /// Payload is a compressed measurement block
    pub const COMPRESSED: u8 = 0x08;
    /// Selects the second of the two active signal-index caches
    pub const CACHE_INDEX: u8 = 0x10;
}

/// Per-measurement compact flags (one byte per measurement)
pub mod compact_flags {
    /// Value is outside its reasonable measurement range
    pub const DATA_RANGE: u8 = 0x01;
    /// Value quality is bad or suspect
    pub const DATA_QUALITY: u8 = 0x02;
    /// Time quality is bad or suspect
    pub const TIME_QUALITY: u8 = 0x04;
    /// An upstream system issue affects this value
    pub const SYSTEM_ISSUE: u8 = 0x08;
    /// Value was calculated rather than measured
    pub const CALCULATED: u8 = 0x10;
    /// Value was discarded from a processing window
    pub const DISCARDED: u8 = 0x20;
    /// Selects the second shared base timestamp
    pub const TIME_INDEX: u8 = 0x40;
    /// Measurement was routed through a buffer-block byte channel
    pub const BYTE_CHANNEL: u8 = 0x80;
}

const DATA_RANGE_MASK: StateFlags = StateFlags(
    StateFlags::OVER_RANGE_ERROR.0
        | StateFlags::UNDER_RANGE_ERROR.0
        | StateFlags::ALARM_HIGH.0
        | StateFlags::ALARM_LOW.0
        | StateFlags::WARNING_HIGH.0
        | StateFlags::WARNING_LOW.0,
);

const DATA_QUALITY_MASK: StateFlags = StateFlags(
    StateFlags::BAD_DATA.0
        | StateFlags::SUSPECT_DATA.0
        | StateFlags::FLATLINE_ALARM.0
        | StateFlags::COMPARISON_ALARM.0
        | StateFlags::ROC_ALARM.0
        | StateFlags::RECEIVED_AS_BAD.0
        | StateFlags::CALCULATION_ERROR.0
        | StateFlags::CALCULATION_WARNING.0
        | StateFlags::RESERVED_QUALITY.0,
);

const TIME_QUALITY_MASK: StateFlags = StateFlags(
    StateFlags::BAD_TIME.0
        | StateFlags::SUSPECT_TIME.0
        | StateFlags::LATE_TIME_ALARM.0
        | StateFlags::FUTURE_TIME_ALARM.0
        | StateFlags::UP_SAMPLED.0
        | StateFlags::DOWN_SAMPLED.0
        | StateFlags::RESERVED_TIME.0,
);

const SYSTEM_ISSUE_MASK: StateFlags = StateFlags(
    StateFlags::SYSTEM_ERROR.0 | StateFlags::SYSTEM_WARNING.0 | StateFlags::MEASUREMENT_ERROR.0,
);

/// Collapse full quality flags into the compact per-measurement summary.
///
/// The mapping is many-to-one; [`expand_compact_flags`] restores a
/// representative member of each collapsed group.
pub fn summarize_state_flags(flags: StateFlags) -> u8 {
    let mut compact = 0u8;
    if flags.intersects(DATA_RANGE_MASK) {
        compact |= compact_flags::DATA_RANGE;
    }
    if flags.intersects(DATA_QUALITY_MASK) {
        compact |= compact_flags::DATA_QUALITY;
    }
    if flags.intersects(TIME_QUALITY_MASK) {
        compact |= compact_flags::TIME_QUALITY;
    }
    if flags.intersects(SYSTEM_ISSUE_MASK) {
        compact |= compact_flags::SYSTEM_ISSUE;
    }
    if flags.contains(StateFlags::CALCULATED_VALUE) {
        compact |= compact_flags::CALCULATED;
    }
    if flags.contains(StateFlags::DISCARDED_VALUE) {
        compact |= compact_flags::DISCARDED;
    }
    compact
}

/// Expand a compact quality summary back into representative full flags
pub fn expand_compact_flags(compact: u8) -> StateFlags {
    let mut flags = StateFlags::NORMAL;
    if compact & compact_flags::DATA_RANGE != 0 {
        flags |= StateFlags::OVER_RANGE_ERROR;
    }
    if compact & compact_flags::DATA_QUALITY != 0 {
        flags |= StateFlags::BAD_DATA;
    }
    if compact & compact_flags::TIME_QUALITY != 0 {
        flags |= StateFlags::BAD_TIME;
    }
    if compact & compact_flags::SYSTEM_ISSUE != 0 {
        flags |= StateFlags::SYSTEM_ERROR;
    }
    if compact & compact_flags::CALCULATED != 0 {
        flags |= StateFlags::CALCULATED_VALUE;
    }
    if compact & compact_flags::DISCARDED != 0 {
        flags |= StateFlags::DISCARDED_VALUE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representative_flags_survive_summary_round_trip() {
        let representatives = [
            StateFlags::NORMAL,
            StateFlags::OVER_RANGE_ERROR,
            StateFlags::BAD_DATA,
            StateFlags::BAD_TIME,
            StateFlags::SYSTEM_ERROR,
            StateFlags::CALCULATED_VALUE,
            StateFlags::DISCARDED_VALUE,
            StateFlags::BAD_DATA | StateFlags::BAD_TIME | StateFlags::CALCULATED_VALUE,
        ];
        for flags in representatives {
            assert_eq!(expand_compact_flags(summarize_state_flags(flags)), flags);
        }
    }

    #[test]
    fn related_flags_collapse_to_same_summary() {
        assert_eq!(
            summarize_state_flags(StateFlags::ALARM_LOW),
            summarize_state_flags(StateFlags::UNDER_RANGE_ERROR)
        );
        assert_eq!(
            summarize_state_flags(StateFlags::SUSPECT_TIME),
            summarize_state_flags(StateFlags::BAD_TIME)
        );
    }
}
