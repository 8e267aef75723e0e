//! ULP-FEC (RFC 5109) receive-side recovery of RTP media packets
//! carried inside RED (RFC 2198) payloads (spec.md §4.5).

pub mod decoder;
pub mod header;
pub mod xor;

pub use decoder::{RecoveredPacket, UlpFecReceiver};
pub use header::FecHeader;

/// RED payload demuxing (RFC 2198): one or more blocks, each preceded
/// by a 1-byte (last block) or 4-byte (redundant block) header. The
/// receive path only cares about the primary (last) block's payload
/// type to tell media from FEC.
pub struct RedBlock<'a> {
    pub payload_type: u8,
    pub payload: &'a [u8],
}

/// Splits a RED payload into its constituent blocks. Only the last
/// block (primary encoding, no timestamp offset) is expected in this
/// receive path; redundant blocks are skipped rather than decoded,
/// since this pipeline relies on ULP-FEC rather than RED redundancy
/// for loss recovery.
pub fn demux_red(payload: &[u8]) -> crate::error::Result<RedBlock<'_>> {
    use crate::error::PipelineError;

    let mut offset = 0;
    loop {
        if offset >= payload.len() {
            return Err(PipelineError::Parse("RED payload ended before primary block".into()));
        }
        let header_byte = payload[offset];
        let follows = header_byte & 0x80 != 0;
        if !follows {
            let pt = header_byte & 0x7F;
            let block_payload = &payload[offset + 1..];
            return Ok(RedBlock { payload_type: pt, payload: block_payload });
        }
        if offset + 4 > payload.len() {
            return Err(PipelineError::Parse("RED redundant block header truncated".into()));
        }
        let block_len = (((payload[offset + 2] as usize) & 0x03) << 8) | payload[offset + 3] as usize;
        offset += 4 + block_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demuxes_primary_only_red_payload() {
        let mut payload = vec![96]; // last block, no follow bit, pt=96
        payload.extend_from_slice(&[1, 2, 3]);
        let block = demux_red(&payload).unwrap();
        assert_eq!(block.payload_type, 96);
        assert_eq!(block.payload, &[1, 2, 3]);
    }

    #[test]
    fn skips_redundant_block_to_reach_primary() {
        let mut payload = vec![0x80 | 127]; // follow bit set, redundant pt=127
        payload.push(0);
        payload.push(0);
        payload.push(2); // block_len = 2
        payload.extend_from_slice(&[0xAA, 0xBB]); // redundant block payload
        payload.push(96); // primary block header
        payload.extend_from_slice(&[9, 9]);

        let block = demux_red(&payload).unwrap();
        assert_eq!(block.payload_type, 96);
        assert_eq!(block.payload, &[9, 9]);
    }
}
