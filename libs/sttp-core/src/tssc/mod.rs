//! Time-series special compression
//!
//! Stateful stream codec for `(index, timestamp, value, flags)` tuples.
//! Each runtime index keeps a residual model (previous timestamps, qualities
//! and the last three values); a shared bit stream carries one of 32 opcodes
//! per field change followed by the minimal residual bits. Opcode prefixes
//! adapt per point from running usage statistics, so encoder and decoder must
//! track state in lockstep: both sides reset together on every signal-index
//! cache rotation, and a mid-stream divergence is unrecoverable.
//!
//! Block framing: `[1 byte version][2 bytes sequence][payload]`.

mod decoder;
mod encoder;
mod point;

pub use decoder::TsscDecoder;
pub use encoder::TsscEncoder;

/// Version byte carried by every compressed block
pub const TSSC_VERSION: u8 = 1;

/// Opcodes shared by encoder and decoder.
///
/// Layout mirrors field order in a measurement: point-id codes lowest, then
/// time, quality and value codes; decode guards rely on that ordering.
pub(crate) mod codes {
    pub const END_OF_STREAM: u8 = 0;

    pub const POINT_ID_XOR4: u8 = 1;
    pub const POINT_ID_XOR8: u8 = 2;
    pub const POINT_ID_XOR12: u8 = 3;
    pub const POINT_ID_XOR16: u8 = 4;
    pub const POINT_ID_XOR20: u8 = 5;
    pub const POINT_ID_XOR24: u8 = 6;
    pub const POINT_ID_XOR32: u8 = 7;

    pub const TIME_DELTA1_FORWARD: u8 = 8;
    pub const TIME_DELTA2_FORWARD: u8 = 9;
    pub const TIME_DELTA3_FORWARD: u8 = 10;
    pub const TIME_DELTA4_FORWARD: u8 = 11;
    pub const TIME_DELTA1_REVERSE: u8 = 12;
    pub const TIME_DELTA2_REVERSE: u8 = 13;
    pub const TIME_DELTA3_REVERSE: u8 = 14;
    pub const TIME_DELTA4_REVERSE: u8 = 15;
    pub const TIMESTAMP2: u8 = 16;
    pub const TIME_XOR_7BIT: u8 = 17;

    pub const QUALITY2: u8 = 18;
    pub const QUALITY_7BIT32: u8 = 19;

    pub const VALUE1: u8 = 20;
    pub const VALUE2: u8 = 21;
    pub const VALUE3: u8 = 22;
    pub const VALUE_ZERO: u8 = 23;
    pub const VALUE_XOR4: u8 = 24;
    pub const VALUE_XOR8: u8 = 25;
    pub const VALUE_XOR12: u8 = 26;
    pub const VALUE_XOR16: u8 = 27;
    pub const VALUE_XOR20: u8 = 28;
    pub const VALUE_XOR24: u8 = 29;
    pub const VALUE_XOR28: u8 = 30;
    pub const VALUE_XOR32: u8 = 31;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::StateFlags;
    use crate::time::Ticks;

    type Point = (u32, Ticks, StateFlags, f32);

    fn round_trip(points: &[Point]) -> Vec<Point> {
        let mut encoder = TsscEncoder::new();
        for &(id, ts, flags, value) in points {
            encoder.add_measurement(id, ts, flags, value);
        }
        let block = encoder.finish();

        let mut decoder = TsscDecoder::new();
        decoder.set_block(&block).expect("block header");
        let mut out = Vec::with_capacity(points.len());
        for _ in 0..points.len() {
            let m = decoder
                .next_measurement()
                .expect("decode")
                .expect("stream ended early");
            out.push(m);
        }
        out
    }

    #[test]
    fn identity_for_steady_stream() {
        let base = Ticks(640_000_000_000_000_000);
        let points: Vec<Point> = (0..1000)
            .map(|i| {
                (
                    (i % 3) as u32,
                    Ticks(base.0 + (i / 3) as u64 * 100_000),
                    StateFlags::NORMAL,
                    60.0 + (i as f32) * 0.001,
                )
            })
            .collect();
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn identity_for_repeated_and_zero_values() {
        let base = Ticks(640_000_000_000_000_000);
        let values = [0.0f32, 1.5, 1.5, 0.0, -1.5, 1.5, 0.0, 0.0, 299.25];
        let points: Vec<Point> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| (0, Ticks(base.0 + i as u64 * 333_333), StateFlags::NORMAL, v))
            .collect();
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn identity_with_quality_changes_and_irregular_time() {
        let base = Ticks(640_000_000_000_000_000);
        let mut points: Vec<Point> = Vec::new();
        let mut ts = base.0;
        for i in 0u32..500 {
            // Jittered timestamps, occasional repeats and one step backwards
            ts = match i % 7 {
                0 => ts + 100_000,
                1 => ts,
                2 => ts + 99_997,
                3 => ts.saturating_sub(50),
                _ => ts + 100_003,
            };
            let flags = if i % 11 == 0 {
                StateFlags::SUSPECT_DATA
            } else {
                StateFlags::NORMAL
            };
            points.push((i % 5, Ticks(ts), flags, (i as f32).sin()));
        }
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn identity_with_sparse_point_ids() {
        let base = Ticks(640_000_000_000_000_000);
        let ids = [0u32, 40_000, 3, 70_000, 3, 0, 40_000, 1_000_000];
        let points: Vec<Point> = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                (
                    id,
                    Ticks(base.0 + i as u64 * 10_000),
                    StateFlags::NORMAL,
                    f32::from_bits(0x3F80_0000 | (i as u32) << 3),
                )
            })
            .collect();
        assert_eq!(round_trip(&points), points);
    }

    #[test]
    fn values_are_bit_exact() {
        let base = Ticks(640_000_000_000_000_000);
        let specials = [
            f32::MIN_POSITIVE,
            f32::MAX,
            -0.0,
            f32::INFINITY,
            f32::NEG_INFINITY,
            1.0e-38,
            f32::from_bits(0x0000_0001),
        ];
        let points: Vec<Point> = specials
            .iter()
            .enumerate()
            .map(|(i, &v)| (2, Ticks(base.0 + i as u64), StateFlags::NORMAL, v))
            .collect();
        let decoded = round_trip(&points);
        for ((_, _, _, a), (_, _, _, b)) in points.iter().zip(decoded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn state_survives_block_boundaries() {
        let base = Ticks(640_000_000_000_000_000);
        let mut encoder = TsscEncoder::new();
        let mut decoder = TsscDecoder::new();
        let mut expected = Vec::new();
        let mut actual = Vec::new();

        for block_no in 0u64..4 {
            for i in 0u64..100 {
                let m = (
                    (i % 2) as u32,
                    Ticks(base.0 + (block_no * 100 + i) * 200_000),
                    StateFlags::NORMAL,
                    (block_no * 100 + i) as f32 * 0.5,
                );
                encoder.add_measurement(m.0, m.1, m.2, m.3);
                expected.push(m);
            }
            let block = encoder.finish();
            decoder.set_block(&block).unwrap();
            for _ in 0..100 {
                actual.push(decoder.next_measurement().unwrap().unwrap());
            }
        }
        assert_eq!(actual, expected);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut encoder = TsscEncoder::new();
        encoder.add_measurement(0, Ticks(1000), StateFlags::NORMAL, 1.0);
        let _ = encoder.finish();
        encoder.reset();
        encoder.add_measurement(0, Ticks(1000), StateFlags::NORMAL, 1.0);
        let block = encoder.finish();

        let mut decoder = TsscDecoder::new();
        decoder.set_block(&block).unwrap();
        let (id, ts, flags, value) = decoder.next_measurement().unwrap().unwrap();
        assert_eq!((id, ts, flags, value), (0, Ticks(1000), StateFlags::NORMAL, 1.0));
    }

    #[test]
    fn sequence_gap_is_detected() {
        let mut encoder = TsscEncoder::new();
        encoder.add_measurement(0, Ticks(1000), StateFlags::NORMAL, 1.0);
        let _lost = encoder.finish();
        encoder.add_measurement(0, Ticks(2000), StateFlags::NORMAL, 2.0);
        let second = encoder.finish();

        let mut decoder = TsscDecoder::new();
        let err = decoder.set_block(&second).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CodecError::SequenceMismatch { expected: 0, actual: 1 }
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut decoder = TsscDecoder::new();
        let err = decoder.set_block(&[9, 0, 0]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CodecError::UnknownCompressionVersion(9)
        ));
    }

    #[test]
    fn steady_stream_compresses_well() {
        let base = Ticks(640_000_000_000_000_000);
        let mut encoder = TsscEncoder::new();
        let count = 10_000u64;
        for i in 0..count {
            encoder.add_measurement(
                0,
                Ticks(base.0 + i * 100_000),
                StateFlags::NORMAL,
                60.0 + (i % 10) as f32 * 0.001,
            );
        }
        let block = encoder.finish();
        // Uncompressed compact form is 9 bytes per measurement without time,
        // 11+ with; steady telemetry should land well under 35% of that.
        let compact_bytes = count as usize * 11;
        assert!(
            block.len() * 100 < compact_bytes * 35,
            "compressed {} bytes vs compact {} bytes",
            block.len(),
            compact_bytes
        );
    }
}
