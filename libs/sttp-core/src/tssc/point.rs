//! Per-point compression state
//!
//! Each runtime index carries its previous field values plus an adaptive
//! prefix-code table. Four coding modes trade table size against hot-code
//! length: mode 1 emits flat 5-bit codes; modes 2–4 give the one to three
//! hottest codes 1/2/3-bit escapes. The table re-evaluates from usage counts
//! after 5 codes, then 20, then every 100, on both ends identically.

use crate::error::Result;

use super::codes;

/// Bit-level reads needed to walk the prefix tree while decoding
pub(crate) trait BitSource {
    fn read_bit(&mut self) -> Result<u32>;
    fn read_bits5(&mut self) -> Result<u32>;
}

#[derive(Debug, Clone)]
pub(crate) struct PointMetadata {
    /// Predicted runtime index of the measurement that follows this one
    pub prev_next_point_id: u32,
    pub prev_quality1: u32,
    pub prev_quality2: u32,
    pub prev_value1: u32,
    pub prev_value2: u32,
    pub prev_value3: u32,

    command_stats: [u32; 32],
    commands_since_change: u32,
    mode: u8,
    // Hot-code assignments per mode; modeNM = Mth escape of mode N
    mode21: u8,
    mode31: u8,
    mode301: u8,
    mode41: u8,
    mode401: u8,
    mode4001: u8,
    startup_mode: u8,
}

impl PointMetadata {
    pub fn new() -> Self {
        Self {
            prev_next_point_id: 0,
            prev_quality1: 0,
            prev_quality2: 0,
            prev_value1: 0,
            prev_value2: 0,
            prev_value3: 0,
            command_stats: [0; 32],
            commands_since_change: 0,
            mode: 4,
            mode21: 0,
            mode31: 0,
            mode301: 0,
            mode41: codes::VALUE1,
            mode401: codes::VALUE2,
            mode4001: codes::VALUE3,
            startup_mode: 0,
        }
    }

    /// Bit pattern and length that encode `code` under the current mode.
    /// The caller records the code with [`note_code`](Self::note_code).
    pub fn emission(&self, code: u8) -> (u32, u32) {
        match self.mode {
            1 => (u32::from(code), 5),
            2 => {
                if code == self.mode21 {
                    (1, 1)
                } else {
                    (u32::from(code), 6)
                }
            }
            3 => {
                if code == self.mode31 {
                    (1, 1)
                } else if code == self.mode301 {
                    (1, 2)
                } else {
                    (u32::from(code), 7)
                }
            }
            _ => {
                if code == self.mode41 {
                    (1, 1)
                } else if code == self.mode401 {
                    (1, 2)
                } else if code == self.mode4001 {
                    (1, 3)
                } else {
                    (u32::from(code), 8)
                }
            }
        }
    }

    /// Walk the prefix tree against the bit stream and record the code
    pub fn read_code<B: BitSource>(&mut self, bits: &mut B) -> Result<u8> {
        let code = match self.mode {
            1 => bits.read_bits5()? as u8,
            2 => {
                if bits.read_bit()? == 1 {
                    self.mode21
                } else {
                    bits.read_bits5()? as u8
                }
            }
            3 => {
                if bits.read_bit()? == 1 {
                    self.mode31
                } else if bits.read_bit()? == 1 {
                    self.mode301
                } else {
                    bits.read_bits5()? as u8
                }
            }
            _ => {
                if bits.read_bit()? == 1 {
                    self.mode41
                } else if bits.read_bit()? == 1 {
                    self.mode401
                } else if bits.read_bit()? == 1 {
                    self.mode4001
                } else {
                    bits.read_bits5()? as u8
                }
            }
        };
        self.note_code(code);
        Ok(code)
    }

    /// Record an emitted or consumed code and re-evaluate the table on the
    /// startup schedule. Must run on both ends for every code.
    pub fn note_code(&mut self, code: u8) {
        self.commands_since_change += 1;
        self.command_stats[usize::from(code)] += 1;

        if self.startup_mode == 0 && self.commands_since_change > 5 {
            self.startup_mode = 1;
            self.adapt();
        } else if self.startup_mode == 1 && self.commands_since_change > 20 {
            self.startup_mode = 2;
            self.adapt();
        } else if self.startup_mode == 2 && self.commands_since_change > 100 {
            self.adapt();
        }
    }

    /// Pick the cheapest mode for the observed code distribution
    fn adapt(&mut self) {
        let mut code1 = 0u8;
        let mut count1 = 0u32;
        let mut code2 = 1u8;
        let mut count2 = 0u32;
        let mut code3 = 2u8;
        let mut count3 = 0u32;
        let mut total = 0u32;

        for (i, stat) in self.command_stats.iter_mut().enumerate() {
            let count = *stat;
            *stat = 0;
            total += count;

            if count > count3 {
                if count > count1 {
                    code3 = code2;
                    count3 = count2;
                    code2 = code1;
                    count2 = count1;
                    code1 = i as u8;
                    count1 = count;
                } else if count > count2 {
                    code3 = code2;
                    count3 = count2;
                    code2 = i as u8;
                    count2 = count;
                } else {
                    code3 = i as u8;
                    count3 = count;
                }
            }
        }

        let mode1_size = total * 5;
        let mode2_size = count1 + (total - count1) * 6;
        let mode3_size = count1 + count2 * 2 + (total - count1 - count2) * 7;
        let mode4_size =
            count1 + count2 * 2 + count3 * 3 + (total - count1 - count2 - count3) * 8;

        let min_size = mode1_size.min(mode2_size).min(mode3_size).min(mode4_size);

        if min_size == mode1_size {
            self.mode = 1;
        } else if min_size == mode2_size {
            self.mode = 2;
            self.mode21 = code1;
        } else if min_size == mode3_size {
            self.mode = 3;
            self.mode31 = code1;
            self.mode301 = code2;
        } else {
            self.mode = 4;
            self.mode41 = code1;
            self.mode401 = code2;
            self.mode4001 = code3;
        }

        self.commands_since_change = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_mode_four_with_value_escapes() {
        let p = PointMetadata::new();
        assert_eq!(p.emission(codes::VALUE1), (1, 1));
        assert_eq!(p.emission(codes::VALUE2), (1, 2));
        assert_eq!(p.emission(codes::VALUE3), (1, 3));
        assert_eq!(
            p.emission(codes::TIMESTAMP2),
            (u32::from(codes::TIMESTAMP2), 8)
        );
    }

    #[test]
    fn adapts_to_a_dominant_code_after_startup_window() {
        let mut p = PointMetadata::new();
        for _ in 0..6 {
            p.note_code(codes::VALUE_XOR16);
        }
        // After the first adaptation the dominant code owns the shortest escape
        assert_eq!(p.emission(codes::VALUE_XOR16).1, 1);
    }

    #[test]
    fn identical_code_streams_keep_two_tables_in_lockstep() {
        let mut a = PointMetadata::new();
        let mut b = PointMetadata::new();
        let stream = [
            codes::VALUE1,
            codes::VALUE_XOR8,
            codes::VALUE1,
            codes::TIME_DELTA1_FORWARD,
            codes::VALUE1,
            codes::VALUE2,
            codes::VALUE1,
            codes::VALUE_XOR8,
        ];
        for _ in 0..40 {
            for &code in &stream {
                a.note_code(code);
                b.note_code(code);
                assert_eq!(a.emission(code), b.emission(code));
            }
        }
    }
}
