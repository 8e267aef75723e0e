//! ULP-FEC receive-side recovery (spec.md §4.5).
//!
//! Grounded on `fec_decoder.hpp`'s `FecDecoder`: ordered maps of received
//! FEC packets and known media packets keyed by wrap-aware sequence
//! number, with a sweep that recovers any FEC packet missing exactly one
//! protected media packet, then repeats since a newly recovered packet
//! can unblock another FEC packet.

use std::collections::BTreeMap;

use tracing::debug;

use super::header::FecHeader;
use super::xor::{xor_header, xor_payload};
use crate::error::{PipelineError, Result};
use crate::numerics::ahead_of;

const MAX_TRACKED_MEDIA_PACKETS: usize = 4096;
const MAX_TRACKED_FEC_PACKETS: usize = 512;

struct FecPacketEntry {
    header: FecHeader,
    protected_seq_nums: Vec<u16>,
    /// Bytes following the FEC header: the XOR-combined payload region.
    payload: Vec<u8>,
}

/// A recovered media packet, ready to be re-injected into the packet
/// buffer as if it had arrived over the wire.
pub struct RecoveredPacket {
    pub seq_num: u16,
    pub bytes: Vec<u8>,
}

pub struct UlpFecReceiver {
    media_ssrc: u32,
    media_packets: BTreeMap<u16, Vec<u8>>,
    fec_packets: BTreeMap<u16, FecPacketEntry>,
}

impl UlpFecReceiver {
    pub fn new(media_ssrc: u32) -> Self {
        Self {
            media_ssrc,
            media_packets: BTreeMap::new(),
            fec_packets: BTreeMap::new(),
        }
    }

    /// Registers a media packet (received directly, or already
    /// recovered) and attempts a recovery sweep.
    pub fn insert_media_packet(&mut self, seq_num: u16, raw_packet: Vec<u8>) -> Vec<RecoveredPacket> {
        self.media_packets.insert(seq_num, raw_packet);
        self.bound_media_packets();
        self.try_to_recover()
    }

    /// Registers a FEC packet (RED-demuxed, FEC header + payload only)
    /// and attempts a recovery sweep.
    pub fn insert_fec_packet(&mut self, fec_seq_num: u16, raw_fec_payload: &[u8]) -> Result<Vec<RecoveredPacket>> {
        let header = FecHeader::parse(raw_fec_payload)?;
        let protected_seq_nums = header.protected_seq_nums();
        let payload = raw_fec_payload[header.header_size..].to_vec();

        self.fec_packets.insert(
            fec_seq_num,
            FecPacketEntry { header, protected_seq_nums, payload },
        );
        self.bound_fec_packets();
        Ok(self.try_to_recover())
    }

    fn try_to_recover(&mut self) -> Vec<RecoveredPacket> {
        let mut recovered = Vec::new();
        loop {
            let mut progressed = false;
            let mut consumed = Vec::new();

            for (&fec_seq, entry) in self.fec_packets.iter() {
                let missing: Vec<u16> = entry
                    .protected_seq_nums
                    .iter()
                    .copied()
                    .filter(|s| !self.media_packets.contains_key(s))
                    .collect();

                if missing.is_empty() {
                    consumed.push(fec_seq);
                    continue;
                }
                if missing.len() > 1 {
                    continue;
                }

                let missing_seq = missing[0];
                let bytes = recover_packet(entry, missing_seq, &self.media_packets, self.media_ssrc);
                debug!(seq_num = missing_seq, fec_seq_num = fec_seq, "recovered media packet via FEC");
                recovered.push(RecoveredPacket { seq_num: missing_seq, bytes: bytes.clone() });
                self.media_packets.insert(missing_seq, bytes);
                consumed.push(fec_seq);
                progressed = true;
            }

            for seq in &consumed {
                self.fec_packets.remove(seq);
            }
            if !progressed {
                break;
            }
        }
        self.bound_media_packets();
        recovered
    }

    fn bound_media_packets(&mut self) {
        while self.media_packets.len() > MAX_TRACKED_MEDIA_PACKETS {
            let oldest = *self.media_packets.keys().next().unwrap();
            self.media_packets.remove(&oldest);
        }
    }

    fn bound_fec_packets(&mut self) {
        while self.fec_packets.len() > MAX_TRACKED_FEC_PACKETS {
            let oldest = *self.fec_packets.keys().next().unwrap();
            self.fec_packets.remove(&oldest);
        }
    }

    pub fn is_recovered(&self, seq_num: u16) -> bool {
        self.media_packets.contains_key(&seq_num)
    }

    pub fn num_pending_fec_packets(&self) -> usize {
        self.fec_packets.len()
    }
}

/// Recovers the single missing packet protected by `entry` by XOR-ing
/// every other known protected packet out of the FEC packet's own
/// recovery fields, leaving exactly the missing packet's bytes.
fn recover_packet(
    entry: &FecPacketEntry,
    missing_seq: u16,
    media_packets: &BTreeMap<u16, Vec<u8>>,
    media_ssrc: u32,
) -> Vec<u8> {
    let mut header = [0u8; 12];
    header[0] = entry.header.recovery_byte0;
    header[1] = entry.header.recovery_byte1;
    header[4..8].copy_from_slice(&entry.header.ts_recovery.to_be_bytes());

    let mut payload = entry.payload.clone();
    let mut length_xor = entry.header.length_recovery;

    for &seq in &entry.protected_seq_nums {
        if seq == missing_seq {
            continue;
        }
        let Some(bytes) = media_packets.get(&seq) else { continue };
        if bytes.len() < 12 {
            continue;
        }
        let mut src_header = [0u8; 12];
        src_header.copy_from_slice(&bytes[0..12]);
        xor_header(&mut header, &src_header);

        let src_payload_len = bytes.len() - 12;
        length_xor ^= src_payload_len as u16;
        xor_payload(&mut payload, 0, &bytes[12..], 0, src_payload_len);
    }

    let recovered_len = (length_xor as usize).min(payload.len());
    payload.truncate(recovered_len);

    header[2..4].copy_from_slice(&missing_seq.to_be_bytes());
    header[8..12].copy_from_slice(&media_ssrc.to_be_bytes());

    let mut full = header.to_vec();
    full.extend_from_slice(&payload);
    full
}

pub fn validate_red_payload(data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(PipelineError::Parse("empty RED payload".into()));
    }
    Ok(())
}
