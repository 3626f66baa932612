//! Compact measurement codec
//!
//! Per-measurement wire layout: `[1 byte flags][2 bytes runtime index]
//! [4- or 8-byte value][2-byte time offset, 0xFFFF escaping to a full 8-byte
//! tick]`. Two shared base timestamps travel out-of-band so most samples need
//! only a 16-bit time delta.

use bytes::BufMut;

use crate::error::Result;
use crate::flags::{compact_flags, expand_compact_flags, summarize_state_flags, StateFlags};
use crate::time::Ticks;
use crate::wire::WireReader;

/// Escape value: offset field is followed by the full 8-byte timestamp
pub const FULL_TIME_SENTINEL: u16 = 0xFFFF;

/// A decoded compact record, not yet resolved against a signal-index cache
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactRecord {
    pub runtime_index: u32,
    pub value: f64,
    pub timestamp: Ticks,
    pub flags: StateFlags,
}

/// Layout switches negotiated at subscribe time
#[derive(Debug, Clone, Copy)]
pub struct CompactCodec {
    /// Whether measurements carry a timestamp at all
    pub include_time: bool,
    /// Time offsets count milliseconds instead of 100-ns ticks
    pub millisecond_resolution: bool,
    /// Values are 64-bit floats instead of 32-bit
    pub double_precision: bool,
}

impl Default for CompactCodec {
    fn default() -> Self {
        Self {
            include_time: true,
            millisecond_resolution: false,
            double_precision: false,
        }
    }
}

impl CompactCodec {
    fn offset_unit(&self) -> u64 {
        if self.millisecond_resolution {
            Ticks::PER_MILLISECOND
        } else {
            1
        }
    }

    /// Encoded size of one measurement with the current layout
    pub fn record_len(&self, full_time: bool) -> usize {
        let value_len = if self.double_precision { 8 } else { 4 };
        let time_len = if !self.include_time {
            0
        } else if full_time {
            2 + 8
        } else {
            2
        };
        1 + 2 + value_len + time_len
    }

    /// Offset of `timestamp` from `base` in offset units, when representable
    fn time_offset(&self, timestamp: Ticks, base: Ticks) -> Option<u16> {
        if timestamp.is_leap_second() {
            return None;
        }
        let unit = self.offset_unit();
        let value = timestamp.timestamp_value();
        let base = base.timestamp_value();
        if value < base {
            return None;
        }
        let delta = value - base;
        if delta % unit != 0 {
            return None;
        }
        let offset = delta / unit;
        if offset >= u64::from(FULL_TIME_SENTINEL) {
            return None;
        }
        Some(offset as u16)
    }

    /// Append one measurement, using the base time selected by `time_index`
    pub fn encode(
        &self,
        out: &mut Vec<u8>,
        runtime_index: u32,
        value: f64,
        timestamp: Ticks,
        flags: StateFlags,
        base_times: &[Ticks; 2],
        time_index: u8,
    ) {
        let time_index = time_index & 1;
        let mut compact = summarize_state_flags(flags);
        if time_index == 1 {
            compact |= compact_flags::TIME_INDEX;
        }
        out.push(compact);
        out.put_u16(runtime_index as u16);

        if self.double_precision {
            out.put_u64(value.to_bits());
        } else {
            out.put_u32((value as f32).to_bits());
        }

        if self.include_time {
            match self.time_offset(timestamp, base_times[usize::from(time_index)]) {
                Some(offset) => out.put_u16(offset),
                None => {
                    out.put_u16(FULL_TIME_SENTINEL);
                    out.put_u64(timestamp.0);
                }
            }
        }
    }

    /// Read one measurement record
    pub fn decode(&self, reader: &mut WireReader<'_>, base_times: &[Ticks; 2]) -> Result<CompactRecord> {
        let compact = reader.read_u8()?;
        let runtime_index = u32::from(reader.read_u16()?);

        let value = if self.double_precision {
            reader.read_f64()?
        } else {
            f64::from(reader.read_f32()?)
        };

        let timestamp = if self.include_time {
            let offset = reader.read_u16()?;
            if offset == FULL_TIME_SENTINEL {
                Ticks(reader.read_u64()?)
            } else {
                let time_index = usize::from(compact & compact_flags::TIME_INDEX != 0);
                let base = base_times[time_index].timestamp_value();
                Ticks(base + u64::from(offset) * self.offset_unit())
            }
        } else {
            Ticks::default()
        };

        Ok(CompactRecord {
            runtime_index,
            value,
            timestamp,
            flags: expand_compact_flags(compact),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CompactCodec {
        CompactCodec::default()
    }

    fn round_trip(codec: CompactCodec, record: CompactRecord, bases: &[Ticks; 2], time_index: u8) -> CompactRecord {
        let mut out = Vec::new();
        codec.encode(
            &mut out,
            record.runtime_index,
            record.value,
            record.timestamp,
            record.flags,
            bases,
            time_index,
        );
        let mut reader = WireReader::new(&out);
        let decoded = codec.decode(&mut reader, bases).unwrap();
        assert!(reader.is_empty());
        decoded
    }

    #[test]
    fn in_window_tick_round_trips_exactly() {
        let base = Ticks(640_000_000_000_000_000);
        let bases = [base, Ticks(base.0 + 60 * Ticks::PER_SECOND)];
        for delta in [0u64, 1, 9999, 65_534] {
            let record = CompactRecord {
                runtime_index: 7,
                value: 60.01_f32 as f64,
                timestamp: Ticks(base.0 + delta),
                flags: StateFlags::NORMAL,
            };
            let decoded = round_trip(codec(), record, &bases, 0);
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn out_of_window_tick_uses_full_encoding() {
        let base = Ticks(640_000_000_000_000_000);
        let bases = [base, base];
        let far = Ticks(base.0 + 86_400 * Ticks::PER_SECOND);
        let record = CompactRecord {
            runtime_index: 1,
            value: -0.23_f32 as f64,
            timestamp: far,
            flags: StateFlags::OVER_RANGE_ERROR,
        };

        let mut out = Vec::new();
        codec().encode(&mut out, 1, record.value, far, record.flags, &bases, 0);
        assert_eq!(out.len(), codec().record_len(true));

        let decoded = round_trip(codec(), record, &bases, 0);
        assert_eq!(decoded, record);
    }

    #[test]
    fn second_base_time_is_selected_by_flag() {
        let bases = [Ticks(1_000_000), Ticks(2_000_000)];
        let record = CompactRecord {
            runtime_index: 3,
            value: 1.0,
            timestamp: Ticks(2_000_500),
            flags: StateFlags::NORMAL,
        };
        let decoded = round_trip(codec(), record, &bases, 1);
        assert_eq!(decoded.timestamp, record.timestamp);
    }

    #[test]
    fn millisecond_resolution_widens_the_window() {
        let codec = CompactCodec {
            millisecond_resolution: true,
            ..CompactCodec::default()
        };
        let base = Ticks(640_000_000_000_000_000);
        let bases = [base, base];
        // 60 s ahead but on a millisecond boundary: fits in 16 bits of ms
        let ts = Ticks(base.0 + 60_000 * Ticks::PER_MILLISECOND);
        let record = CompactRecord {
            runtime_index: 0,
            value: 218.07_f32 as f64,
            timestamp: ts,
            flags: StateFlags::NORMAL,
        };

        let mut out = Vec::new();
        codec.encode(&mut out, 0, record.value, ts, record.flags, &bases, 0);
        assert_eq!(out.len(), codec.record_len(false));

        let mut reader = WireReader::new(&out);
        assert_eq!(codec.decode(&mut reader, &bases).unwrap(), record);
    }

    #[test]
    fn sub_millisecond_tick_escapes_to_full_time_under_ms_resolution() {
        let codec = CompactCodec {
            millisecond_resolution: true,
            ..CompactCodec::default()
        };
        let base = Ticks(640_000_000_000_000_000);
        let bases = [base, base];
        let ts = Ticks(base.0 + 1234); // not on a ms boundary

        let mut out = Vec::new();
        codec.encode(&mut out, 0, 0.0, ts, StateFlags::NORMAL, &bases, 0);
        assert_eq!(out.len(), codec.record_len(true));

        let mut reader = WireReader::new(&out);
        assert_eq!(codec.decode(&mut reader, &bases).unwrap().timestamp, ts);
    }

    #[test]
    fn double_precision_preserves_f64_values() {
        let codec = CompactCodec {
            double_precision: true,
            ..CompactCodec::default()
        };
        let bases = [Ticks(0), Ticks(0)];
        let value = 0.1f64 + 0.2f64;
        let mut out = Vec::new();
        codec.encode(&mut out, 2, value, Ticks(100), StateFlags::NORMAL, &bases, 0);
        let mut reader = WireReader::new(&out);
        assert_eq!(codec.decode(&mut reader, &bases).unwrap().value, value);
    }

    #[test]
    fn quality_summary_round_trips_representative_flags() {
        let bases = [Ticks(0), Ticks(0)];
        let flags = StateFlags::BAD_DATA | StateFlags::BAD_TIME;
        let record = CompactRecord {
            runtime_index: 5,
            value: 0.0,
            timestamp: Ticks(500),
            flags,
        };
        assert_eq!(round_trip(codec(), record, &bases, 0).flags, flags);
    }
}
