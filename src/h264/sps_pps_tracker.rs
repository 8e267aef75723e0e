//! SPS/PPS tracking and bitstream fixup (spec.md §4.3).
//!
//! Grounded on `sps_pps_tracker.cpp`/`h264_sps_pps_tracker.hpp`'s field
//! layout for the `seq_parameter_set_id`/resolution fields, and on the
//! teacher's `voip/rtp_video.rs` depacketizer for the Annex-B start-code
//! insertion this module adds on top.

use std::collections::HashMap;

use crate::error::{PipelineError, Result};
use crate::h264::bitreader::BitReader;
use crate::h264::nalu::{
    self, H264PacketInfo, PacketizationMode, ANNEX_B_START_CODE, NALU_TYPE_IDR, NALU_TYPE_PPS,
    NALU_TYPE_SPS,
};

/// Profile IDCs that carry the extended chroma/bit-depth/scaling fields in
/// their SPS (H.264 §7.3.2.1.1).
const EXTENDED_PROFILE_IDCS: &[u8] = &[
    100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135,
];

#[derive(Debug, Clone, Copy)]
pub struct SpsInfo {
    pub id: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PpsInfo {
    pub id: u32,
    pub sps_id: u32,
}

#[derive(Debug, Clone)]
struct SpsEntry {
    width: u32,
    height: u32,
    /// Raw NALU bytes (header byte included) when this entry was supplied
    /// out-of-band and therefore needs to be prepended to bitstreams the
    /// sender doesn't repeat in-band.
    bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct PpsEntry {
    sps_id: u32,
    bytes: Option<Vec<u8>>,
}

pub enum FixupAction {
    Insert(Vec<u8>),
    Drop,
    RequestKeyFrame,
}

#[derive(Debug, Default)]
pub struct SpsPpsTracker {
    sps_data: HashMap<u32, SpsEntry>,
    pps_data: HashMap<u32, PpsEntry>,
}

impl SpsPpsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Out-of-band parameter sets (`sps_bytes`/`pps_bytes` each a full
    /// NALU, header byte included, *not* Annex-B prefixed).
    pub fn insert_sps_pps(&mut self, sps_bytes: &[u8], pps_bytes: &[u8]) -> Result<()> {
        let sps = parse_sps(sps_bytes)?;
        let pps = parse_pps(pps_bytes)?;
        self.sps_data.insert(
            sps.id,
            SpsEntry {
                width: sps.width,
                height: sps.height,
                bytes: Some(sps_bytes.to_vec()),
            },
        );
        self.pps_data.insert(
            pps.id,
            PpsEntry {
                sps_id: pps.sps_id,
                bytes: Some(pps_bytes.to_vec()),
            },
        );
        Ok(())
    }

    /// Records a parameter set observed in-band (already present on the
    /// wire, no need to remember its bytes for later insertion).
    pub fn observe_in_band_sps(&mut self, nalu_bytes: &[u8]) -> Result<()> {
        let sps = parse_sps(nalu_bytes)?;
        self.sps_data.entry(sps.id).or_insert(SpsEntry {
            width: sps.width,
            height: sps.height,
            bytes: None,
        });
        Ok(())
    }

    pub fn observe_in_band_pps(&mut self, nalu_bytes: &[u8]) -> Result<()> {
        let pps = parse_pps(nalu_bytes)?;
        self.pps_data.entry(pps.id).or_insert(PpsEntry {
            sps_id: pps.sps_id,
            bytes: None,
        });
        Ok(())
    }

    pub fn resolution_for_sps(&self, sps_id: u32) -> Option<(u32, u32)> {
        self.sps_data.get(&sps_id).map(|e| (e.width, e.height))
    }

    /// Builds the decoder-ready bitstream for one packet's payload,
    /// inserting Annex-B start codes before every NALU and, for the first
    /// packet of an IDR frame whose parameter sets were only ever supplied
    /// out-of-band, prepending the SPS/PPS NALUs.
    pub fn copy_and_fix_bitstream(
        &mut self,
        is_first_packet_in_frame: bool,
        info: &H264PacketInfo,
        bitstream: &[u8],
    ) -> Result<FixupAction> {
        for nalu_bytes in split_nalus(bitstream, info.packetization_mode) {
            if nalu_bytes.is_empty() {
                continue;
            }
            match nalu_bytes[0] & 0x1F {
                NALU_TYPE_SPS => {
                    if let Err(e) = self.observe_in_band_sps(nalu_bytes) {
                        tracing::debug!(error = %e, "failed to parse in-band SPS");
                    }
                }
                NALU_TYPE_PPS => {
                    if let Err(e) = self.observe_in_band_pps(nalu_bytes) {
                        tracing::debug!(error = %e, "failed to parse in-band PPS");
                    }
                }
                _ => {}
            }
        }

        let mut prefix = Vec::new();
        if is_first_packet_in_frame && info.has_idr {
            let pps_id = match slice_pps_id(bitstream, info) {
                Some(id) => id,
                None => return Ok(FixupAction::RequestKeyFrame),
            };
            let Some(pps) = self.pps_data.get(&(pps_id as u32)).cloned() else {
                return Ok(FixupAction::RequestKeyFrame);
            };
            let Some(sps) = self.sps_data.get(&pps.sps_id).cloned() else {
                return Ok(FixupAction::RequestKeyFrame);
            };
            let _ = (sps.width, sps.height);
            if let Some(sps_bytes) = &sps.bytes {
                prefix.extend_from_slice(&ANNEX_B_START_CODE);
                prefix.extend_from_slice(sps_bytes);
            }
            if let Some(pps_bytes) = &pps.bytes {
                prefix.extend_from_slice(&ANNEX_B_START_CODE);
                prefix.extend_from_slice(pps_bytes);
            }
        }

        let mut out = prefix;
        match info.packetization_mode {
            Some(PacketizationMode::Single) => {
                out.extend_from_slice(&ANNEX_B_START_CODE);
                out.extend_from_slice(bitstream);
            }
            Some(PacketizationMode::StapA) => {
                let mut offset = 1usize;
                while offset + 2 <= bitstream.len() {
                    let len =
                        u16::from_be_bytes([bitstream[offset], bitstream[offset + 1]]) as usize;
                    offset += 2;
                    if offset + len > bitstream.len() {
                        return Ok(FixupAction::Drop);
                    }
                    out.extend_from_slice(&ANNEX_B_START_CODE);
                    out.extend_from_slice(&bitstream[offset..offset + len]);
                    offset += len;
                }
            }
            Some(PacketizationMode::FuA) => {
                // A single FU-A fragment's payload is not itself a
                // complete NALU; the caller concatenates fragments across
                // packets (start code placed once, at the first fragment)
                // before calling this fixup on the fully reassembled NALU.
                out.extend_from_slice(&ANNEX_B_START_CODE);
                out.extend_from_slice(bitstream);
            }
            None => return Ok(FixupAction::Drop),
        }

        Ok(FixupAction::Insert(out))
    }
}

/// Splits a packet's payload into per-NALU byte slices (header byte
/// included), regardless of packetization mode. STAP-A yields each
/// aggregated NALU; single-NALU and FU-A (already header-reconstructed by
/// the caller) each yield the whole buffer as one NALU. Malformed STAP-A
/// length fields yield whatever NALUs were parsed before the truncation.
fn split_nalus(bitstream: &[u8], mode: Option<PacketizationMode>) -> Vec<&[u8]> {
    match mode {
        Some(PacketizationMode::StapA) => {
            let mut out = Vec::new();
            let mut offset = 1usize;
            while offset + 2 <= bitstream.len() {
                let len = u16::from_be_bytes([bitstream[offset], bitstream[offset + 1]]) as usize;
                offset += 2;
                if offset + len > bitstream.len() {
                    break;
                }
                out.push(&bitstream[offset..offset + len]);
                offset += len;
            }
            out
        }
        Some(PacketizationMode::Single) | Some(PacketizationMode::FuA) => vec![bitstream],
        None => Vec::new(),
    }
}

/// Extracts `pic_parameter_set_id` from an IDR slice header. Returns
/// `None` if the bitstream isn't a single-NALU slice (STAP-A never
/// carries IDR slice data, and FU-A fragments only carry it in the start
/// fragment, whose header byte was reconstructed into `bitstream[0]` by
/// the caller).
fn slice_pps_id(bitstream: &[u8], info: &H264PacketInfo) -> Option<u8> {
    if !matches!(
        info.packetization_mode,
        Some(PacketizationMode::Single) | Some(PacketizationMode::FuA)
    ) {
        return None;
    }
    if bitstream.len() < 2 {
        return None;
    }
    let nalu_type = bitstream[0] & 0x1F;
    if nalu_type != NALU_TYPE_IDR {
        return None;
    }
    let rbsp = nalu::strip_emulation_prevention(&bitstream[1..]);
    let mut reader = BitReader::new(&rbsp);
    let _first_mb_in_slice = reader.read_ue().ok()?;
    let _slice_type = reader.read_ue().ok()?;
    let pic_parameter_set_id = reader.read_ue().ok()?;
    u8::try_from(pic_parameter_set_id).ok()
}

/// Parses `seq_parameter_set_id` and the cropped display resolution out of
/// a full SPS NALU (header byte included).
pub fn parse_sps(nalu_bytes: &[u8]) -> Result<SpsInfo> {
    if nalu_bytes.is_empty() || (nalu_bytes[0] & 0x1F) != NALU_TYPE_SPS {
        return Err(PipelineError::Parse("not an SPS NALU".into()));
    }
    let rbsp = nalu::strip_emulation_prevention(&nalu_bytes[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    let _constraint_and_reserved = r.read_bits(8)?;
    let _level_idc = r.read_bits(8)?;
    let seq_parameter_set_id = r.read_ue()?;

    let mut chroma_format_idc = 1u32;
    if EXTENDED_PROFILE_IDCS.contains(&(profile_idc as u8)) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            let _separate_colour_plane_flag = r.read_bit()?;
        }
        let _bit_depth_luma_minus8 = r.read_ue()?;
        let _bit_depth_chroma_minus8 = r.read_ue()?;
        let _qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
        let seq_scaling_matrix_present_flag = r.read_bit()?;
        if seq_scaling_matrix_present_flag != 0 {
            let count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                let present = r.read_bit()?;
                if present != 0 {
                    let size = if i < 6 { 16 } else { 64 };
                    r.skip_scaling_list(size)?;
                }
            }
        }
    }

    let _log2_max_frame_num_minus4 = r.read_ue()?;
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        let _log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;
    } else if pic_order_cnt_type == 1 {
        let _delta_pic_order_always_zero_flag = r.read_bit()?;
        let _offset_for_non_ref_pic = r.read_se()?;
        let _offset_for_top_to_bottom_field = r.read_se()?;
        let num_ref_frames_in_pic_order_cnt_cycle = r.read_ue()?;
        for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
            let _offset_for_ref_frame = r.read_se()?;
        }
    }

    let _max_num_ref_frames = r.read_ue()?;
    let _gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
    let pic_width_in_mbs_minus1 = r.read_ue()?;
    let pic_height_in_map_units_minus1 = r.read_ue()?;
    let frame_mbs_only_flag = r.read_bit()?;
    if frame_mbs_only_flag == 0 {
        let _mb_adaptive_frame_field_flag = r.read_bit()?;
    }
    let _direct_8x8_inference_flag = r.read_bit()?;

    let frame_cropping_flag = r.read_bit()?;
    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0u32, 0u32, 0u32, 0u32);
    if frame_cropping_flag != 0 {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let width = (pic_width_in_mbs_minus1 + 1) * 16 - (crop_left + crop_right) * 2;
    let frame_mb_height_factor = 2 - frame_mbs_only_flag;
    let height = frame_mb_height_factor * (pic_height_in_map_units_minus1 + 1) * 16
        - (crop_top + crop_bottom) * 2 * frame_mb_height_factor;

    Ok(SpsInfo {
        id: seq_parameter_set_id,
        width,
        height,
    })
}

/// Parses `pic_parameter_set_id` and the `seq_parameter_set_id` it refers
/// to out of a full PPS NALU (header byte included).
pub fn parse_pps(nalu_bytes: &[u8]) -> Result<PpsInfo> {
    if nalu_bytes.is_empty() || (nalu_bytes[0] & 0x1F) != NALU_TYPE_PPS {
        return Err(PipelineError::Parse("not a PPS NALU".into()));
    }
    let rbsp = nalu::strip_emulation_prevention(&nalu_bytes[1..]);
    let mut r = BitReader::new(&rbsp);
    let pic_parameter_set_id = r.read_ue()?;
    let seq_parameter_set_id = r.read_ue()?;
    Ok(PpsInfo {
        id: pic_parameter_set_id,
        sps_id: seq_parameter_set_id,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a minimal baseline-profile SPS NALU for `id=0`,
    /// `width=176, height=144` (QCIF), no scaling lists, `pic_order_cnt_type
    /// = 2` (skips the order-count-cycle branch entirely) for a compact
    /// test fixture.
    pub(crate) fn minimal_sps_bytes() -> Vec<u8> {
        // profile_idc=66 (baseline, not in EXTENDED_PROFILE_IDCS), 8 bits
        // constraint/reserved, level_idc=30, then RBSP trailing bits
        // hand-built below.
        let mut bits: Vec<u8> = Vec::new();
        let mut writer = BitWriter::default();
        writer.push_bits(66, 8); // profile_idc
        writer.push_bits(0, 8); // constraint flags + reserved
        writer.push_bits(30, 8); // level_idc
        writer.push_ue(0); // seq_parameter_set_id = 0
        writer.push_ue(0); // log2_max_frame_num_minus4
        writer.push_ue(2); // pic_order_cnt_type = 2
        writer.push_ue(0); // max_num_ref_frames
        writer.push_bit(0); // gaps_in_frame_num_value_allowed_flag
        writer.push_ue(10); // pic_width_in_mbs_minus1 = 10 -> width = 11*16 = 176
        writer.push_ue(8); // pic_height_in_map_units_minus1 = 8 -> height = 9*16 = 144
        writer.push_bit(1); // frame_mbs_only_flag
        writer.push_bit(0); // direct_8x8_inference_flag
        writer.push_bit(0); // frame_cropping_flag
        writer.push_bit(1); // rbsp_stop_one_bit (ignored by our parser)
        bits.extend(writer.into_bytes());

        let mut nalu = vec![NALU_TYPE_SPS];
        nalu.extend(bits);
        nalu
    }

    pub(crate) fn minimal_pps_bytes(pps_id: u32, sps_id: u32) -> Vec<u8> {
        let mut writer = BitWriter::default();
        writer.push_ue(pps_id);
        writer.push_ue(sps_id);
        writer.push_bit(1);
        let mut nalu = vec![NALU_TYPE_PPS];
        nalu.extend(writer.into_bytes());
        nalu
    }

    /// Tiny bit writer, the mirror image of `BitReader`, used only to build
    /// synthetic SPS/PPS fixtures for these tests.
    #[derive(Default)]
    struct BitWriter {
        bytes: Vec<u8>,
        bit_pos: usize,
    }

    impl BitWriter {
        fn push_bit(&mut self, bit: u32) {
            if self.bit_pos % 8 == 0 {
                self.bytes.push(0);
            }
            if bit != 0 {
                let idx = self.bytes.len() - 1;
                let shift = 7 - (self.bit_pos % 8);
                self.bytes[idx] |= 1 << shift;
            }
            self.bit_pos += 1;
        }

        fn push_bits(&mut self, value: u32, count: u32) {
            for i in (0..count).rev() {
                self.push_bit((value >> i) & 1);
            }
        }

        fn push_ue(&mut self, value: u32) {
            let code = value + 1;
            let bits = 32 - code.leading_zeros();
            for _ in 0..bits - 1 {
                self.push_bit(0);
            }
            self.push_bits(code, bits);
        }

        fn into_bytes(self) -> Vec<u8> {
            self.bytes
        }
    }

    #[test]
    fn parses_sps_resolution() {
        let sps = parse_sps(&minimal_sps_bytes()).unwrap();
        assert_eq!(sps.id, 0);
        assert_eq!(sps.width, 176);
        assert_eq!(sps.height, 144);
    }

    #[test]
    fn parses_pps_sps_reference() {
        let pps = parse_pps(&minimal_pps_bytes(4, 0)).unwrap();
        assert_eq!(pps.id, 4);
        assert_eq!(pps.sps_id, 0);
    }

    #[test]
    fn insert_sps_pps_out_of_band_then_fixup_prepends_them() {
        let mut tracker = SpsPpsTracker::new();
        let sps = minimal_sps_bytes();
        let pps = minimal_pps_bytes(0, 0);
        tracker.insert_sps_pps(&sps, &pps).unwrap();

        // IDR slice referencing pps_id=0: first_mb_in_slice=0, slice_type=7,
        // pic_parameter_set_id=0.
        let mut writer = BitWriter::default();
        writer.push_ue(0);
        writer.push_ue(7);
        writer.push_ue(0);
        writer.push_bit(1);
        let mut idr_nalu = vec![(3u8 << 5) | NALU_TYPE_IDR];
        idr_nalu.extend(writer.into_bytes());

        let info = nalu::parse_single_nalu(&idr_nalu).unwrap();
        assert!(info.has_idr);

        let action = tracker
            .copy_and_fix_bitstream(true, &info, &idr_nalu)
            .unwrap();
        match action {
            FixupAction::Insert(bytes) => {
                // Expect: start code + sps, start code + pps, start code + idr.
                assert!(bytes.windows(4).filter(|w| *w == ANNEX_B_START_CODE).count() >= 3);
                assert!(bytes.ends_with(&idr_nalu));
            }
            _ => panic!("expected Insert"),
        }
    }

    #[test]
    fn missing_parameter_sets_requests_keyframe() {
        let mut tracker = SpsPpsTracker::new();
        let mut writer = BitWriter::default();
        writer.push_ue(0);
        writer.push_ue(7);
        writer.push_ue(5); // unknown pps_id
        writer.push_bit(1);
        let mut idr_nalu = vec![(3u8 << 5) | NALU_TYPE_IDR];
        idr_nalu.extend(writer.into_bytes());
        let info = nalu::parse_single_nalu(&idr_nalu).unwrap();

        let action = tracker
            .copy_and_fix_bitstream(true, &info, &idr_nalu)
            .unwrap();
        assert!(matches!(action, FixupAction::RequestKeyFrame));
    }
}
