//! Stream compressor
//!
//! Codes travel through a bit stream interleaved with the byte stream: the
//! first bit written after a flush reserves the byte at the current output
//! position, so residual payload bytes and prefix codes stay positionally
//! aligned with the decoder, which refills its bit cache from the byte it is
//! standing on whenever the cache runs dry.

use ahash::AHashMap;
use bytes::BufMut;

use crate::flags::StateFlags;
use crate::time::Ticks;
use crate::wire::{write_7bit_u32, write_7bit_u64};

use super::codes;
use super::point::PointMetadata;
use super::TSSC_VERSION;

pub struct TsscEncoder {
    data: Vec<u8>,
    bit_buffer_index: Option<usize>,
    bit_cache: u32,
    bit_count: u32,

    prev_timestamp1: i64,
    prev_timestamp2: i64,
    prev_time_delta1: i64,
    prev_time_delta2: i64,
    prev_time_delta3: i64,
    prev_time_delta4: i64,

    // Slot 0 is the synthetic starting point; real points map via index_map
    points: Vec<PointMetadata>,
    index_map: AHashMap<u32, usize>,
    last_slot: usize,

    sequence: u16,
    pending: usize,
}

impl TsscEncoder {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            bit_buffer_index: None,
            bit_cache: 0,
            bit_count: 0,
            prev_timestamp1: 0,
            prev_timestamp2: 0,
            prev_time_delta1: i64::MAX,
            prev_time_delta2: i64::MAX,
            prev_time_delta3: i64::MAX,
            prev_time_delta4: i64::MAX,
            points: vec![PointMetadata::new()],
            index_map: AHashMap::new(),
            last_slot: 0,
            sequence: 0,
            pending: 0,
        }
    }

    /// Drop all residual state and restart the block sequence at zero.
    /// Must coincide with a decoder reset on the other end.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Measurements added since the last [`finish`](Self::finish)
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Bytes accumulated for the current block, excluding the header
    pub fn block_len(&self) -> usize {
        self.data.len()
    }

    /// Seal the current block: `[version][sequence][payload]`. Per-point
    /// residual state carries over to the next block; only the bit stream
    /// and payload buffer restart.
    pub fn finish(&mut self) -> Vec<u8> {
        self.flush_bit_stream();
        let mut block = Vec::with_capacity(self.data.len() + 3);
        block.push(TSSC_VERSION);
        block.put_u16(self.sequence);
        block.extend_from_slice(&self.data);
        self.sequence = self.sequence.wrapping_add(1);
        self.data.clear();
        self.bit_buffer_index = None;
        self.bit_cache = 0;
        self.bit_count = 0;
        self.pending = 0;
        block
    }

    /// Append one measurement to the current block
    pub fn add_measurement(&mut self, id: u32, timestamp: Ticks, flags: StateFlags, value: f32) {
        let ts = timestamp.0 as i64;
        let quality = flags.0;

        let slot = match self.index_map.get(&id) {
            Some(&slot) => slot,
            None => {
                let mut point = PointMetadata::new();
                point.prev_next_point_id = id.wrapping_add(1);
                let slot = self.points.len();
                self.points.push(point);
                self.index_map.insert(id, slot);
                slot
            }
        };

        if self.points[self.last_slot].prev_next_point_id != id {
            self.write_point_id_change(id);
            self.points[self.last_slot].prev_next_point_id = id;
        }

        if self.prev_timestamp1 != ts {
            self.write_timestamp_change(ts);
        }

        if self.points[slot].prev_quality1 != quality {
            self.write_quality_change(slot, quality);
            let point = &mut self.points[slot];
            point.prev_quality2 = point.prev_quality1;
            point.prev_quality1 = quality;
        }

        let raw = value.to_bits();
        let (prev1, prev2, prev3) = {
            let point = &self.points[slot];
            (point.prev_value1, point.prev_value2, point.prev_value3)
        };

        if raw == prev1 {
            self.write_code(codes::VALUE1);
        } else if raw == prev2 {
            self.write_code(codes::VALUE2);
            let point = &mut self.points[slot];
            point.prev_value2 = prev1;
            point.prev_value1 = raw;
        } else if raw == prev3 {
            self.write_code(codes::VALUE3);
            let point = &mut self.points[slot];
            point.prev_value3 = prev2;
            point.prev_value2 = prev1;
            point.prev_value1 = raw;
        } else if raw == 0 {
            self.write_code(codes::VALUE_ZERO);
            let point = &mut self.points[slot];
            point.prev_value3 = prev2;
            point.prev_value2 = prev1;
            point.prev_value1 = 0;
        } else {
            let xor = raw ^ prev1;
            if xor <= 0xF {
                self.write_code(codes::VALUE_XOR4);
                self.write_bits(xor & 15, 4);
            } else if xor <= 0xFF {
                self.write_code(codes::VALUE_XOR8);
                self.data.push(xor as u8);
            } else if xor <= 0xFFF {
                self.write_code(codes::VALUE_XOR12);
                self.write_bits(xor & 15, 4);
                self.data.push((xor >> 4) as u8);
            } else if xor <= 0xFFFF {
                self.write_code(codes::VALUE_XOR16);
                self.data.push(xor as u8);
                self.data.push((xor >> 8) as u8);
            } else if xor <= 0xF_FFFF {
                self.write_code(codes::VALUE_XOR20);
                self.write_bits(xor & 15, 4);
                self.data.push((xor >> 4) as u8);
                self.data.push((xor >> 12) as u8);
            } else if xor <= 0xFF_FFFF {
                self.write_code(codes::VALUE_XOR24);
                self.data.push(xor as u8);
                self.data.push((xor >> 8) as u8);
                self.data.push((xor >> 16) as u8);
            } else if xor <= 0xFFF_FFFF {
                self.write_code(codes::VALUE_XOR28);
                self.write_bits(xor & 15, 4);
                self.data.push((xor >> 4) as u8);
                self.data.push((xor >> 12) as u8);
                self.data.push((xor >> 20) as u8);
            } else {
                self.write_code(codes::VALUE_XOR32);
                self.data.push(xor as u8);
                self.data.push((xor >> 8) as u8);
                self.data.push((xor >> 16) as u8);
                self.data.push((xor >> 24) as u8);
            }
            let point = &mut self.points[slot];
            point.prev_value3 = prev2;
            point.prev_value2 = prev1;
            point.prev_value1 = raw;
        }

        self.last_slot = slot;
        self.pending += 1;
    }

    fn write_point_id_change(&mut self, id: u32) {
        let xor = id ^ self.points[self.last_slot].prev_next_point_id;

        if xor <= 0xF {
            self.write_code(codes::POINT_ID_XOR4);
            self.write_bits(xor & 15, 4);
        } else if xor <= 0xFF {
            self.write_code(codes::POINT_ID_XOR8);
            self.data.push(xor as u8);
        } else if xor <= 0xFFF {
            self.write_code(codes::POINT_ID_XOR12);
            self.write_bits(xor & 15, 4);
            self.data.push((xor >> 4) as u8);
        } else if xor <= 0xFFFF {
            self.write_code(codes::POINT_ID_XOR16);
            self.data.push(xor as u8);
            self.data.push((xor >> 8) as u8);
        } else if xor <= 0xF_FFFF {
            self.write_code(codes::POINT_ID_XOR20);
            self.write_bits(xor & 15, 4);
            self.data.push((xor >> 4) as u8);
            self.data.push((xor >> 12) as u8);
        } else if xor <= 0xFF_FFFF {
            self.write_code(codes::POINT_ID_XOR24);
            self.data.push(xor as u8);
            self.data.push((xor >> 8) as u8);
            self.data.push((xor >> 16) as u8);
        } else {
            self.write_code(codes::POINT_ID_XOR32);
            self.data.push(xor as u8);
            self.data.push((xor >> 8) as u8);
            self.data.push((xor >> 16) as u8);
            self.data.push((xor >> 24) as u8);
        }
    }

    fn write_timestamp_change(&mut self, ts: i64) {
        if self.prev_timestamp2 == ts {
            self.write_code(codes::TIMESTAMP2);
        } else if self.prev_timestamp1 < ts {
            if self.prev_timestamp1.wrapping_add(self.prev_time_delta1) == ts {
                self.write_code(codes::TIME_DELTA1_FORWARD);
            } else if self.prev_timestamp1.wrapping_add(self.prev_time_delta2) == ts {
                self.write_code(codes::TIME_DELTA2_FORWARD);
            } else if self.prev_timestamp1.wrapping_add(self.prev_time_delta3) == ts {
                self.write_code(codes::TIME_DELTA3_FORWARD);
            } else if self.prev_timestamp1.wrapping_add(self.prev_time_delta4) == ts {
                self.write_code(codes::TIME_DELTA4_FORWARD);
            } else {
                self.write_code(codes::TIME_XOR_7BIT);
                write_7bit_u64(&mut self.data, (ts ^ self.prev_timestamp1) as u64);
            }
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta1) == ts {
            self.write_code(codes::TIME_DELTA1_REVERSE);
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta2) == ts {
            self.write_code(codes::TIME_DELTA2_REVERSE);
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta3) == ts {
            self.write_code(codes::TIME_DELTA3_REVERSE);
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta4) == ts {
            self.write_code(codes::TIME_DELTA4_REVERSE);
        } else {
            self.write_code(codes::TIME_XOR_7BIT);
            write_7bit_u64(&mut self.data, (ts ^ self.prev_timestamp1) as u64);
        }

        // Keep the four smallest distinct deltas seen, ordered ascending
        let min_delta = self.prev_timestamp1.wrapping_sub(ts).wrapping_abs();
        if min_delta < self.prev_time_delta4
            && min_delta != self.prev_time_delta1
            && min_delta != self.prev_time_delta2
            && min_delta != self.prev_time_delta3
        {
            if min_delta < self.prev_time_delta1 {
                self.prev_time_delta4 = self.prev_time_delta3;
                self.prev_time_delta3 = self.prev_time_delta2;
                self.prev_time_delta2 = self.prev_time_delta1;
                self.prev_time_delta1 = min_delta;
            } else if min_delta < self.prev_time_delta2 {
                self.prev_time_delta4 = self.prev_time_delta3;
                self.prev_time_delta3 = self.prev_time_delta2;
                self.prev_time_delta2 = min_delta;
            } else if min_delta < self.prev_time_delta3 {
                self.prev_time_delta4 = self.prev_time_delta3;
                self.prev_time_delta3 = min_delta;
            } else {
                self.prev_time_delta4 = min_delta;
            }
        }

        self.prev_timestamp2 = self.prev_timestamp1;
        self.prev_timestamp1 = ts;
    }

    fn write_quality_change(&mut self, slot: usize, quality: u32) {
        if self.points[slot].prev_quality2 == quality {
            self.write_code(codes::QUALITY2);
        } else {
            self.write_code(codes::QUALITY_7BIT32);
            write_7bit_u32(&mut self.data, quality);
        }
    }

    fn write_code(&mut self, code: u8) {
        let (bits, len) = self.points[self.last_slot].emission(code);
        self.write_bits(bits, len);
        self.points[self.last_slot].note_code(code);
    }

    fn write_bits(&mut self, bits: u32, len: u32) {
        if self.bit_buffer_index.is_none() {
            self.bit_buffer_index = Some(self.data.len());
            self.data.push(0);
        }

        self.bit_cache = (self.bit_cache << len) | bits;
        self.bit_count += len;

        if self.bit_count > 7 {
            if let Some(index) = self.bit_buffer_index.take() {
                self.bit_count -= 8;
                self.data[index] = (self.bit_cache >> self.bit_count) as u8;
            }
        }
    }

    fn flush_bit_stream(&mut self) {
        if self.bit_count > 0 {
            let index = match self.bit_buffer_index.take() {
                Some(index) => index,
                None => {
                    self.data.push(0);
                    self.data.len() - 1
                }
            };
            // Zero-pad the final partial byte
            self.data[index] = (self.bit_cache << (8 - self.bit_count)) as u8;
            self.bit_cache = 0;
            self.bit_count = 0;
        }
        self.bit_buffer_index = None;
    }
}

impl Default for TsscEncoder {
    fn default() -> Self {
        Self::new()
    }
}
