//! Measurement sample type

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flags::StateFlags;
use crate::time::Ticks;

/// A single time-series sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// 128-bit identity of the time series this sample belongs to
    pub signal_id: Uuid,
    /// Sample value
    pub value: f64,
    /// Sample timestamp
    pub timestamp: Ticks,
    /// Quality flags
    pub flags: StateFlags,
}

impl Measurement {
    pub fn new(signal_id: Uuid, value: f64, timestamp: Ticks) -> Self {
        Self {
            signal_id,
            value,
            timestamp,
            flags: StateFlags::NORMAL,
        }
    }

    pub fn with_flags(mut self, flags: StateFlags) -> Self {
        self.flags = flags;
        self
    }
}
