//! `RtpPacketReceived`: the unit handed from the socket layer into this
//! crate's pipeline (spec.md §3).
//!
//! Grounded on the teacher's `RtpPacket` in `voip/rtp_video.rs`, replacing
//! its owned `Vec<u8>` payload with a [`CowBuffer`] (the packet buffer and
//! any emitted FEC-recovered copy share storage until one of them mutates)
//! and adding the arrival timestamp and `recovered` flag spec.md §3 requires
//! for jitter/FEC bookkeeping.

use crate::buffer::CowBuffer;
use crate::error::Result;
use crate::rtp::extensions::{DecodedExtensions, ExtensionMap};
use crate::rtp::header::{parse_extension_block, RtpHeader, FIXED_HEADER_SIZE};

#[derive(Debug, Clone)]
pub struct RtpPacketReceived {
    pub header: RtpHeader,
    pub payload: CowBuffer,
    pub extensions: DecodedExtensions,
    /// Local monotonic receive time, in milliseconds. Populated by the
    /// socket layer; this crate never reads the wall clock itself (spec.md
    /// §7: no hidden clock access, all timestamps flow in as arguments).
    pub arrival_time_ms: i64,
    /// Set once this packet's payload was reconstructed by ULP-FEC rather
    /// than received directly.
    pub recovered: bool,
}

impl RtpPacketReceived {
    /// Parses a full RTP packet (header, extensions, payload) off the wire.
    /// `padding`, if the header's padding bit is set, is trimmed from the
    /// payload's tail per RFC 3550 §5.1 (last byte is the pad count).
    pub fn parse(
        bytes: &[u8],
        extension_map: &ExtensionMap,
        arrival_time_ms: i64,
    ) -> Result<Self> {
        let (header, mut offset) = RtpHeader::parse(bytes)?;

        let mut raw_extensions = Vec::new();
        if header.extension {
            let (exts, new_offset) = parse_extension_block(bytes, offset)?;
            raw_extensions = exts;
            offset = new_offset;
        }

        let mut payload_end = bytes.len();
        if header.padding && payload_end > offset {
            let pad_len = bytes[payload_end - 1] as usize;
            payload_end = payload_end.saturating_sub(pad_len).max(offset);
        }

        let payload = CowBuffer::from_slice(&bytes[offset..payload_end]);
        let extensions = extension_map.decode(&raw_extensions);

        Ok(Self {
            header,
            payload,
            extensions,
            arrival_time_ms,
            recovered: false,
        })
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn marker(&self) -> bool {
        self.header.marker
    }

    pub fn payload_type(&self) -> u8 {
        self.header.payload_type
    }

    /// Builds a synthetic packet recovered by ULP-FEC. The header's
    /// sequence number and timestamp are the ones XOR-reconstructed by the
    /// FEC decoder; `recovered` is always `true`.
    pub fn recovered(header: RtpHeader, payload: CowBuffer, arrival_time_ms: i64) -> Self {
        Self {
            header,
            payload,
            extensions: DecodedExtensions::default(),
            arrival_time_ms,
            recovered: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_bytes(padding_len: u8) -> Vec<u8> {
        let mut header = RtpHeader::new(10, 1000, 42, 96, false);
        if padding_len > 0 {
            header.padding = true;
        }
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(b"payload");
        if padding_len > 0 {
            for _ in 1..padding_len {
                bytes.push(0);
            }
            bytes.push(padding_len);
        }
        bytes
    }

    #[test]
    fn parses_minimal_packet() {
        let bytes = packet_bytes(0);
        let map = ExtensionMap::new();
        let packet = RtpPacketReceived::parse(&bytes, &map, 123).unwrap();
        assert_eq!(packet.sequence_number(), 10);
        assert_eq!(packet.timestamp(), 1000);
        assert_eq!(packet.ssrc(), 42);
        assert_eq!(packet.payload.as_slice(), b"payload");
        assert!(!packet.recovered);
        assert_eq!(packet.arrival_time_ms, 123);
    }

    #[test]
    fn strips_padding_from_payload() {
        let bytes = packet_bytes(4);
        let map = ExtensionMap::new();
        let packet = RtpPacketReceived::parse(&bytes, &map, 0).unwrap();
        assert_eq!(packet.payload.as_slice(), b"payload");
    }

    #[test]
    fn fails_on_truncated_header() {
        let map = ExtensionMap::new();
        let err = RtpPacketReceived::parse(&[1, 2, 3], &map, 0);
        assert!(err.is_err());
    }

    #[test]
    fn recovered_packet_is_flagged() {
        let header = RtpHeader::new(1, 1, 1, 96, false);
        let packet = RtpPacketReceived::recovered(header, CowBuffer::from_slice(b"x"), 5);
        assert!(packet.recovered);
    }
}
