//! Recognized RFC 8285 header extensions (spec.md §6).
//!
//! Grounded on `rtp_header_extension_map.cpp`'s `ExtensionInfo` table, which
//! maps a registered local id to a `ExtensionType` and decode function. The
//! receive path doesn't need the encoder-side URI registration, only the
//! id-to-type lookup and the typed decode.

use crate::rtp::header::RawExtension;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionType {
    TransmissionTimeOffset,
    AbsoluteSendTime,
    AbsoluteCaptureTime,
    TransportSequenceNumber,
    TransportSequenceNumberV2,
    PlayoutDelayLimits,
    Mid,
    RtpStreamId,
    RepairedRtpStreamId,
}

/// Min/max playout delay, in units of 10 ms, per RFC draft
/// `playout-delay`. `0` means "no preference" at that bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutDelay {
    pub min_ms: u32,
    pub max_ms: u32,
}

fn decode_playout_delay(data: &[u8]) -> Option<PlayoutDelay> {
    if data.len() < 3 {
        return None;
    }
    let min_units = ((data[0] as u32) << 4) | ((data[1] as u32) >> 4);
    let max_units = (((data[1] as u32) & 0x0F) << 8) | (data[2] as u32);
    Some(PlayoutDelay {
        min_ms: min_units * 10,
        max_ms: max_units * 10,
    })
}

/// A receiver's id-to-type registration, populated from negotiated SDP (out
/// of this crate's scope per spec.md §1) and then used to interpret each
/// packet's raw extensions.
#[derive(Debug, Clone, Default)]
pub struct ExtensionMap {
    by_id: std::collections::HashMap<u8, ExtensionType>,
}

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u8, ext: ExtensionType) {
        self.by_id.insert(id, ext);
    }

    pub fn type_for_id(&self, id: u8) -> Option<ExtensionType> {
        self.by_id.get(&id).copied()
    }

    /// Resolves a packet's raw extensions against this map into the decoded
    /// values this crate cares about. Unregistered or malformed extensions
    /// are silently skipped, per spec.md §7 (parse errors never abort the
    /// packet).
    pub fn decode(&self, raw: &[RawExtension]) -> DecodedExtensions {
        let mut out = DecodedExtensions::default();
        for ext in raw {
            let Some(ty) = self.type_for_id(ext.id) else {
                continue;
            };
            match ty {
                ExtensionType::TransmissionTimeOffset => {
                    if ext.data.len() >= 3 {
                        let raw = ((ext.data[0] as u32) << 16)
                            | ((ext.data[1] as u32) << 8)
                            | ext.data[2] as u32;
                        out.transmission_time_offset = Some(sign_extend_24(raw));
                    }
                }
                ExtensionType::AbsoluteSendTime => {
                    if ext.data.len() >= 3 {
                        out.absolute_send_time = Some(
                            ((ext.data[0] as u32) << 16)
                                | ((ext.data[1] as u32) << 8)
                                | ext.data[2] as u32,
                        );
                    }
                }
                ExtensionType::AbsoluteCaptureTime => {
                    if ext.data.len() >= 8 {
                        let timestamp = u64::from_be_bytes(ext.data[0..8].try_into().unwrap());
                        let offset = if ext.data.len() >= 16 {
                            Some(i64::from_be_bytes(ext.data[8..16].try_into().unwrap()))
                        } else {
                            None
                        };
                        out.absolute_capture_timestamp = Some(timestamp);
                        out.estimated_capture_clock_offset = offset;
                    }
                }
                ExtensionType::TransportSequenceNumber => {
                    if ext.data.len() >= 2 {
                        out.transport_sequence_number =
                            Some(u16::from_be_bytes([ext.data[0], ext.data[1]]));
                    }
                }
                ExtensionType::TransportSequenceNumberV2 => {
                    if ext.data.len() >= 2 {
                        out.transport_sequence_number =
                            Some(u16::from_be_bytes([ext.data[0], ext.data[1]]));
                    }
                }
                ExtensionType::PlayoutDelayLimits => {
                    out.playout_delay = decode_playout_delay(&ext.data);
                }
                ExtensionType::Mid => {
                    out.mid = std::str::from_utf8(&ext.data).ok().map(str::to_owned);
                }
                ExtensionType::RtpStreamId => {
                    out.rtp_stream_id = std::str::from_utf8(&ext.data).ok().map(str::to_owned);
                }
                ExtensionType::RepairedRtpStreamId => {
                    out.repaired_rtp_stream_id =
                        std::str::from_utf8(&ext.data).ok().map(str::to_owned);
                }
            }
        }
        out
    }
}

fn sign_extend_24(value: u32) -> i32 {
    if value & 0x0080_0000 != 0 {
        (value | 0xFF00_0000) as i32
    } else {
        value as i32
    }
}

/// The extensions a single packet carried, after resolving ids through an
/// [`ExtensionMap`]. Every field is independently optional: a packet may
/// carry any subset.
#[derive(Debug, Clone, Default)]
pub struct DecodedExtensions {
    pub transmission_time_offset: Option<i32>,
    pub absolute_send_time: Option<u32>,
    pub absolute_capture_timestamp: Option<u64>,
    pub estimated_capture_clock_offset: Option<i64>,
    pub transport_sequence_number: Option<u16>,
    pub playout_delay: Option<PlayoutDelay>,
    pub mid: Option<String>,
    pub rtp_stream_id: Option<String>,
    pub repaired_rtp_stream_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_playout_delay_limits() {
        let mut map = ExtensionMap::new();
        map.register(5, ExtensionType::PlayoutDelayLimits);
        // min=100ms (10 units), max=200ms (20 units): 0x00A, 0x014 packed into 3 bytes.
        let raw = vec![RawExtension {
            id: 5,
            data: vec![0x00, 0xA0, 0x14],
        }];
        let decoded = map.decode(&raw);
        let delay = decoded.playout_delay.unwrap();
        assert_eq!(delay.min_ms, 100);
        assert_eq!(delay.max_ms, 200);
    }

    #[test]
    fn decodes_transmission_time_offset_with_sign_extension() {
        let mut map = ExtensionMap::new();
        map.register(2, ExtensionType::TransmissionTimeOffset);
        // -1 as a 24-bit two's complement value: 0xFFFFFF.
        let raw = vec![RawExtension {
            id: 2,
            data: vec![0xFF, 0xFF, 0xFF],
        }];
        let decoded = map.decode(&raw);
        assert_eq!(decoded.transmission_time_offset, Some(-1));
    }

    #[test]
    fn unregistered_id_is_ignored() {
        let map = ExtensionMap::new();
        let raw = vec![RawExtension {
            id: 9,
            data: vec![1, 2, 3],
        }];
        let decoded = map.decode(&raw);
        assert!(decoded.transmission_time_offset.is_none());
    }

    #[test]
    fn decodes_mid_as_utf8() {
        let mut map = ExtensionMap::new();
        map.register(3, ExtensionType::Mid);
        let raw = vec![RawExtension {
            id: 3,
            data: b"video0".to_vec(),
        }];
        let decoded = map.decode(&raw);
        assert_eq!(decoded.mid.as_deref(), Some("video0"));
    }
}
