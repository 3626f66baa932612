//! Stream decompressor
//!
//! Mirrors the encoder state transition for state transition: the same point
//! metadata, the same adaptive code tables, the same delta bookkeeping. Any
//! divergence leaves the stream unrecoverable, which the sequence number in
//! each block header surfaces as an explicit error.

use ahash::AHashMap;

use crate::error::{CodecError, Result};
use crate::flags::StateFlags;
use crate::time::Ticks;
use crate::wire::{read_7bit_u32, read_7bit_u64};

use super::codes;
use super::point::{BitSource, PointMetadata};
use super::TSSC_VERSION;

/// Byte stream with an interleaved bit cache, mirroring the encoder layout
#[derive(Debug, Default)]
struct ByteStream {
    data: Vec<u8>,
    position: usize,
    bit_cache: u32,
    bit_count: u32,
}

impl ByteStream {
    fn set(&mut self, payload: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(payload);
        self.position = 0;
        self.bit_cache = 0;
        self.bit_count = 0;
    }

    fn exhausted(&self) -> bool {
        self.position >= self.data.len() && self.bit_count == 0
    }

    fn read_byte(&mut self) -> Result<u32> {
        let byte = *self
            .data
            .get(self.position)
            .ok_or_else(|| CodecError::StreamCorrupt("byte stream exhausted".to_string()))?;
        self.position += 1;
        Ok(u32::from(byte))
    }

    fn read_bits4(&mut self) -> Result<u32> {
        Ok(self.read_bit()? << 3 | self.read_bit()? << 2 | self.read_bit()? << 1 | self.read_bit()?)
    }

    fn read_7bit_u32(&mut self) -> Result<u32> {
        read_7bit_u32(&self.data, &mut self.position)
    }

    fn read_7bit_u64(&mut self) -> Result<u64> {
        read_7bit_u64(&self.data, &mut self.position)
    }
}

impl BitSource for ByteStream {
    fn read_bit(&mut self) -> Result<u32> {
        if self.bit_count == 0 {
            let byte = *self
                .data
                .get(self.position)
                .ok_or_else(|| CodecError::StreamCorrupt("bit stream exhausted".to_string()))?;
            self.position += 1;
            self.bit_cache = u32::from(byte);
            self.bit_count = 8;
        }
        self.bit_count -= 1;
        Ok((self.bit_cache >> self.bit_count) & 1)
    }

    fn read_bits5(&mut self) -> Result<u32> {
        Ok(self.read_bit()? << 4
            | self.read_bit()? << 3
            | self.read_bit()? << 2
            | self.read_bit()? << 1
            | self.read_bit()?)
    }
}

pub struct TsscDecoder {
    stream: ByteStream,

    prev_timestamp1: i64,
    prev_timestamp2: i64,
    prev_time_delta1: i64,
    prev_time_delta2: i64,
    prev_time_delta3: i64,
    prev_time_delta4: i64,

    points: Vec<PointMetadata>,
    index_map: AHashMap<u32, usize>,
    last_slot: usize,

    expected_sequence: u16,
}

impl TsscDecoder {
    pub fn new() -> Self {
        Self {
            stream: ByteStream::default(),
            prev_timestamp1: 0,
            prev_timestamp2: 0,
            prev_time_delta1: i64::MAX,
            prev_time_delta2: i64::MAX,
            prev_time_delta3: i64::MAX,
            prev_time_delta4: i64::MAX,
            points: vec![PointMetadata::new()],
            index_map: AHashMap::new(),
            last_slot: 0,
            expected_sequence: 0,
        }
    }

    /// Drop all residual state, matching an encoder reset
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Install the next block after validating version and sequence
    pub fn set_block(&mut self, block: &[u8]) -> Result<()> {
        if block.len() < 3 {
            return Err(CodecError::BufferUnderrun {
                needed: 3,
                remaining: block.len(),
            });
        }
        if block[0] != TSSC_VERSION {
            return Err(CodecError::UnknownCompressionVersion(block[0]));
        }
        let sequence = u16::from_be_bytes([block[1], block[2]]);
        if sequence != self.expected_sequence {
            return Err(CodecError::SequenceMismatch {
                expected: self.expected_sequence,
                actual: sequence,
            });
        }
        self.expected_sequence = sequence.wrapping_add(1);
        self.stream.set(&block[3..]);
        Ok(())
    }

    /// Decode the next measurement from the current block, `None` at end
    pub fn next_measurement(&mut self) -> Result<Option<(u32, Ticks, StateFlags, f32)>> {
        if self.stream.exhausted() {
            return Ok(None);
        }

        let mut code = self.points[self.last_slot].read_code(&mut self.stream)?;
        if code == codes::END_OF_STREAM {
            return Ok(None);
        }

        if code <= codes::POINT_ID_XOR32 {
            self.decode_point_id(code)?;
            code = self.points[self.last_slot].read_code(&mut self.stream)?;
            if code < codes::TIME_DELTA1_FORWARD {
                return Err(CodecError::StreamCorrupt(format!(
                    "expected a time, quality or value code after a point-id change, got {code}"
                )));
            }
        }

        let id = self.points[self.last_slot].prev_next_point_id;
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

        let timestamp = if code <= codes::TIME_XOR_7BIT {
            let ts = self.decode_timestamp(code)?;
            code = self.points[self.last_slot].read_code(&mut self.stream)?;
            if code < codes::QUALITY2 {
                return Err(CodecError::StreamCorrupt(format!(
                    "expected a quality or value code after a time change, got {code}"
                )));
            }
            ts
        } else {
            self.prev_timestamp1
        };

        let quality = if code <= codes::QUALITY_7BIT32 {
            let quality = self.decode_quality(code, slot)?;
            code = self.points[self.last_slot].read_code(&mut self.stream)?;
            if code < codes::VALUE1 {
                return Err(CodecError::StreamCorrupt(format!(
                    "expected a value code after a quality change, got {code}"
                )));
            }
            quality
        } else {
            self.points[slot].prev_quality1
        };

        let (prev1, prev2, prev3) = {
            let point = &self.points[slot];
            (point.prev_value1, point.prev_value2, point.prev_value3)
        };

        let raw = match code {
            codes::VALUE1 => prev1,
            codes::VALUE2 => {
                let point = &mut self.points[slot];
                point.prev_value2 = prev1;
                point.prev_value1 = prev2;
                prev2
            }
            codes::VALUE3 => {
                let point = &mut self.points[slot];
                point.prev_value3 = prev2;
                point.prev_value2 = prev1;
                point.prev_value1 = prev3;
                prev3
            }
            codes::VALUE_ZERO => {
                let point = &mut self.points[slot];
                point.prev_value3 = prev2;
                point.prev_value2 = prev1;
                point.prev_value1 = 0;
                0
            }
            _ => {
                let xor = match code {
                    codes::VALUE_XOR4 => self.stream.read_bits4()?,
                    codes::VALUE_XOR8 => self.stream.read_byte()?,
                    codes::VALUE_XOR12 => {
                        self.stream.read_bits4()? | self.stream.read_byte()? << 4
                    }
                    codes::VALUE_XOR16 => self.stream.read_byte()? | self.stream.read_byte()? << 8,
                    codes::VALUE_XOR20 => {
                        self.stream.read_bits4()?
                            | self.stream.read_byte()? << 4
                            | self.stream.read_byte()? << 12
                    }
                    codes::VALUE_XOR24 => {
                        self.stream.read_byte()?
                            | self.stream.read_byte()? << 8
                            | self.stream.read_byte()? << 16
                    }
                    codes::VALUE_XOR28 => {
                        self.stream.read_bits4()?
                            | self.stream.read_byte()? << 4
                            | self.stream.read_byte()? << 12
                            | self.stream.read_byte()? << 20
                    }
                    codes::VALUE_XOR32 => {
                        self.stream.read_byte()?
                            | self.stream.read_byte()? << 8
                            | self.stream.read_byte()? << 16
                            | self.stream.read_byte()? << 24
                    }
                    other => {
                        return Err(CodecError::StreamCorrupt(format!(
                            "unexpected value code {other}"
                        )))
                    }
                };
                let raw = xor ^ prev1;
                let point = &mut self.points[slot];
                point.prev_value3 = prev2;
                point.prev_value2 = prev1;
                point.prev_value1 = raw;
                raw
            }
        };

        self.last_slot = slot;
        Ok(Some((
            id,
            Ticks(timestamp as u64),
            StateFlags(quality),
            f32::from_bits(raw),
        )))
    }

    fn decode_point_id(&mut self, code: u8) -> Result<()> {
        let xor = match code {
            codes::POINT_ID_XOR4 => self.stream.read_bits4()?,
            codes::POINT_ID_XOR8 => self.stream.read_byte()?,
            codes::POINT_ID_XOR12 => self.stream.read_bits4()? | self.stream.read_byte()? << 4,
            codes::POINT_ID_XOR16 => self.stream.read_byte()? | self.stream.read_byte()? << 8,
            codes::POINT_ID_XOR20 => {
                self.stream.read_bits4()?
                    | self.stream.read_byte()? << 4
                    | self.stream.read_byte()? << 12
            }
            codes::POINT_ID_XOR24 => {
                self.stream.read_byte()?
                    | self.stream.read_byte()? << 8
                    | self.stream.read_byte()? << 16
            }
            codes::POINT_ID_XOR32 => {
                self.stream.read_byte()?
                    | self.stream.read_byte()? << 8
                    | self.stream.read_byte()? << 16
                    | self.stream.read_byte()? << 24
            }
            other => {
                return Err(CodecError::StreamCorrupt(format!(
                    "unexpected point-id code {other}"
                )))
            }
        };
        self.points[self.last_slot].prev_next_point_id ^= xor;
        Ok(())
    }

    fn decode_timestamp(&mut self, code: u8) -> Result<i64> {
        let ts = match code {
            codes::TIME_DELTA1_FORWARD => self.prev_timestamp1.wrapping_add(self.prev_time_delta1),
            codes::TIME_DELTA2_FORWARD => self.prev_timestamp1.wrapping_add(self.prev_time_delta2),
            codes::TIME_DELTA3_FORWARD => self.prev_timestamp1.wrapping_add(self.prev_time_delta3),
            codes::TIME_DELTA4_FORWARD => self.prev_timestamp1.wrapping_add(self.prev_time_delta4),
            codes::TIME_DELTA1_REVERSE => self.prev_timestamp1.wrapping_sub(self.prev_time_delta1),
            codes::TIME_DELTA2_REVERSE => self.prev_timestamp1.wrapping_sub(self.prev_time_delta2),
            codes::TIME_DELTA3_REVERSE => self.prev_timestamp1.wrapping_sub(self.prev_time_delta3),
            codes::TIME_DELTA4_REVERSE => self.prev_timestamp1.wrapping_sub(self.prev_time_delta4),
            codes::TIMESTAMP2 => self.prev_timestamp2,
            codes::TIME_XOR_7BIT => self.prev_timestamp1 ^ self.stream.read_7bit_u64()? as i64,
            other => {
                return Err(CodecError::StreamCorrupt(format!(
                    "unexpected time code {other}"
                )))
            }
        };

        // Same smallest-distinct-delta bookkeeping as the encoder
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
        Ok(ts)
    }

    fn decode_quality(&mut self, code: u8, slot: usize) -> Result<u32> {
        let quality = if code == codes::QUALITY2 {
            self.points[slot].prev_quality2
        } else {
            self.stream.read_7bit_u32()?
        };
        let point = &mut self.points[slot];
        point.prev_quality2 = point.prev_quality1;
        point.prev_quality1 = quality;
        Ok(quality)
    }
}

impl Default for TsscDecoder {
    fn default() -> Self {
        Self::new()
    }
}
