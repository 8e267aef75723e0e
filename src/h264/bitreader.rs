//! Minimal Exp-Golomb bit reader for H.264 RBSP parsing (SPS/PPS/slice
//! header prefixes). Grounded on the field layout in `sps_parser.cc`.

use crate::error::{PipelineError, Result};

pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    pub fn read_bit(&mut self) -> Result<u32> {
        let byte_idx = self.bit_pos / 8;
        if byte_idx >= self.data.len() {
            return Err(PipelineError::Parse("bitstream exhausted".into()));
        }
        let shift = 7 - (self.bit_pos % 8);
        let bit = (self.data[byte_idx] >> shift) & 1;
        self.bit_pos += 1;
        Ok(bit as u32)
    }

    pub fn read_bits(&mut self, count: u32) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    /// Unsigned Exp-Golomb (`ue(v)`).
    pub fn read_ue(&mut self) -> Result<u32> {
        let mut leading_zero_bits = 0u32;
        while self.read_bit()? == 0 {
            leading_zero_bits += 1;
            if leading_zero_bits > 32 {
                return Err(PipelineError::Parse("ue(v) exponent too large".into()));
            }
        }
        if leading_zero_bits == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zero_bits)?;
        Ok((1u32 << leading_zero_bits) - 1 + suffix)
    }

    /// Signed Exp-Golomb (`se(v)`).
    pub fn read_se(&mut self) -> Result<i32> {
        let code = self.read_ue()?;
        let magnitude = ((code + 1) / 2) as i32;
        if code % 2 == 0 {
            Ok(-magnitude)
        } else {
            Ok(magnitude)
        }
    }

    /// Skips a scaling list of `size` entries (H.264 §7.3.2.1.1.1), used
    /// only to stay bit-aligned for the fields that follow; values aren't
    /// retained since this crate never re-encodes.
    pub fn skip_scaling_list(&mut self, size: u32) -> Result<()> {
        let mut last_scale = 8i32;
        let mut next_scale = 8i32;
        for _ in 0..size {
            if next_scale != 0 {
                let delta_scale = self.read_se()?;
                next_scale = (last_scale + delta_scale + 256) % 256;
            }
            last_scale = if next_scale == 0 { last_scale } else { next_scale };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_ue_zero() {
        let data = [0b1000_0000];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_ue().unwrap(), 0);
    }

    #[test]
    fn reads_ue_values() {
        // ue(1)="010", ue(2)="011", ue(3)="00100" concatenated and
        // zero-padded to whole bytes: "010011000100" + "0000".
        let data = [0b0100_1100u8, 0b0100_0000u8];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_ue().unwrap(), 1);
        assert_eq!(r.read_ue().unwrap(), 2);
        assert_eq!(r.read_ue().unwrap(), 3);
    }

    #[test]
    fn reads_se_values() {
        // se mapping from ue: 0->0, 1->1, 2->-1, 3->2. ue codes "1","010",
        // "011","00100" concatenated: "101001100100" zero-padded.
        let data = [0b1010_0110u8, 0b0100_0000u8];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_se().unwrap(), 0);
        assert_eq!(r.read_se().unwrap(), 1);
        assert_eq!(r.read_se().unwrap(), -1);
        assert_eq!(r.read_se().unwrap(), 2);
    }
}
