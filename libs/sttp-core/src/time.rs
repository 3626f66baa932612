//! Tick time model
//!
//! A tick is a 64-bit count of 100-nanosecond intervals since
//! 0001-01-01 00:00:00 UTC. Bit 63 flags an active leap second and bit 62 its
//! direction; the remaining bits carry the time value itself.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// 100-nanosecond intervals since 0001-01-01 00:00:00 UTC
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ticks(pub u64);

/// Ticks between 0001-01-01 and the Unix epoch
const UNIX_EPOCH_TICKS: u64 = 621_355_968_000_000_000;

impl Ticks {
    /// Ticks in one second
    pub const PER_SECOND: u64 = 10_000_000;
    /// Ticks in one millisecond
    pub const PER_MILLISECOND: u64 = Self::PER_SECOND / 1000;
    /// Flag marking a leap second in progress
    pub const LEAP_SECOND_FLAG: u64 = 1 << 63;
    /// Flag marking leap second direction (set = negative)
    pub const LEAP_SECOND_DIRECTION: u64 = 1 << 62;
    /// Mask selecting the time value without leap-second metadata
    pub const VALUE_MASK: u64 = !(Self::LEAP_SECOND_FLAG | Self::LEAP_SECOND_DIRECTION);

    /// Time value with leap-second bits stripped
    pub fn timestamp_value(self) -> u64 {
        self.0 & Self::VALUE_MASK
    }

    /// Whether a leap second is in progress for this timestamp
    pub fn is_leap_second(self) -> bool {
        self.0 & Self::LEAP_SECOND_FLAG != 0
    }

    /// Whether an in-progress leap second is negative
    pub fn is_negative_leap_second(self) -> bool {
        self.is_leap_second() && self.0 & Self::LEAP_SECOND_DIRECTION != 0
    }

    /// Flag this timestamp as occurring during a leap second
    pub fn set_leap_second(self) -> Self {
        Ticks(self.0 | Self::LEAP_SECOND_FLAG)
    }

    /// Flag this timestamp as occurring during a negative leap second
    pub fn set_negative_leap_second(self) -> Self {
        Ticks(self.0 | Self::LEAP_SECOND_FLAG | Self::LEAP_SECOND_DIRECTION)
    }

    /// Current system time as ticks
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert a calendar time to ticks (leap bits clear)
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let micros = dt.timestamp_micros();
        Ticks(UNIX_EPOCH_TICKS.wrapping_add((micros * 10) as u64) & Self::VALUE_MASK)
    }

    /// Convert the time value to a calendar time.
    ///
    /// Resolution is limited to microseconds by the conversion; sub-microsecond
    /// tick remainders are truncated.
    pub fn to_datetime(self) -> DateTime<Utc> {
        let micros = (self.timestamp_value().wrapping_sub(UNIX_EPOCH_TICKS)) as i64 / 10;
        match Utc.timestamp_micros(micros) {
            chrono::LocalResult::Single(dt) => dt,
            // Out-of-range ticks clamp to the epoch
            _ => chrono::DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl From<u64> for Ticks {
    fn from(value: u64) -> Self {
        Ticks(value)
    }
}

impl From<Ticks> for u64 {
    fn from(value: Ticks) -> Self {
        value.0
    }
}

impl std::fmt::Display for Ticks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.6f"))
    }
}
