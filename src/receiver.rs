//! `VideoReceiver`: the glue that demuxes incoming RTP/RTCP onto the
//! packet buffer, NACK module, ULP-FEC receiver, frame reference finder,
//! frame buffer, and timing/NTP estimators (spec.md §2-§3).
//!
//! Grounded on the demuxing/dispatch shape of `rtp_video_receiver.cpp`:
//! one component owning all per-stream state, fed parsed RTP packets and
//! raw RTCP buffers, with retransmission/keyframe requests and decodable
//! frames read back out by the host application rather than pushed
//! through a callback. Per `crate::task_queue`'s single-writer model,
//! every method here expects to run on one worker queue; nothing in this
//! module locks internally.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::ReceiverConfig;
use crate::fec::{self, UlpFecReceiver};
use crate::frame::FrameToDecode;
use crate::frame_buffer::{DecodableFrame, FrameBuffer, InsertResult as FrameInsertResult};
use crate::frame_ref_finder::FrameRefFinder;
use crate::h264::nalu;
use crate::h264::sps_pps_tracker::SpsPpsTracker;
use crate::nack::NackModule;
use crate::ntp::RemoteNtpTimeEstimator;
use crate::packet_buffer::{AssembledFrame, PacketBuffer};
use crate::rtp::header::RtpHeader;
use crate::rtp::packet::RtpPacketReceived;
use crate::timing::{InterFrameDelay, JitterEstimator, Timing};

/// Codec-reset epoch jump (spec.md §4.7 step 3): far enough past any
/// raw 16-bit sequence number that the old and new epochs' frame ids
/// can never alias inside the frame buffer's bounded history.
const CODEC_RESET_EPOCH_STRIDE: i64 = 0xFFFF + 1;

/// Outstanding retransmission/keyframe requests the host should act on,
/// drained by [`VideoReceiver::poll_feedback`] (spec.md §6 "Wire out").
#[derive(Debug, Default)]
pub struct FeedbackRequest {
    pub nack_seq_nums: Vec<u16>,
    pub keyframe_requested: bool,
}

/// What [`VideoReceiver::next_decodable`] reports about the head of the
/// decode queue: which frame is next, and how long to wait before it's
/// actually due.
#[derive(Debug, Clone, Copy)]
pub struct NextDecodable {
    pub frame_id: i64,
    pub wait_ms: i64,
}

pub struct VideoReceiver {
    config: ReceiverConfig,

    packet_buffer: PacketBuffer,
    nack: Option<NackModule>,
    fec: Option<UlpFecReceiver>,
    frame_ref_finder: FrameRefFinder,
    frame_buffer: FrameBuffer,

    timing: Timing,
    ntp: RemoteNtpTimeEstimator,
    inter_frame_delay: InterFrameDelay,
    jitter_estimator: JitterEstimator,

    rtt_ms: i64,
    keyframe_requested: bool,
}

impl VideoReceiver {
    pub fn new(config: ReceiverConfig, start_time_ms: i64) -> Self {
        let nack = config
            .nack_enabled
            .then(|| NackModule::new(config.send_nack_delay_ms, config.max_nack_list_size, config.max_nack_retries));

        let fec = match (config.red_payload_type, config.ulpfec_payload_type) {
            (Some(_), Some(_)) => Some(UlpFecReceiver::new(config.remote_ssrc)),
            _ => None,
        };

        let mut timing = Timing::new(start_time_ms);
        timing.set_min_playout_delay(config.min_playout_delay_ms);
        timing.set_max_playout_delay(config.max_playout_delay_ms);
        timing.set_zero_playout_delay_min_pacing(config.zero_playout_delay_min_pacing_ms);

        let mut jitter_estimator = JitterEstimator::new();
        jitter_estimator.set_nack_mode(config.nack_enabled);

        Self {
            packet_buffer: PacketBuffer::new(config.sps_pps_idr_is_keyframe),
            nack,
            fec,
            frame_ref_finder: FrameRefFinder::new(),
            frame_buffer: FrameBuffer::new(),
            timing,
            ntp: RemoteNtpTimeEstimator::new(),
            inter_frame_delay: InterFrameDelay::new(),
            jitter_estimator,
            rtt_ms: 100,
            keyframe_requested: false,
            config,
        }
    }

    /// Out-of-band parameter sets (from SDP `sprop-parameter-sets`), fed
    /// straight through to the bitstream fixup tracker (spec.md §4.3).
    pub fn sps_pps_tracker_mut(&mut self) -> &mut SpsPpsTracker {
        self.packet_buffer.sps_pps_tracker_mut()
    }

    /// Updates the round-trip estimate driving both NACK resend pacing
    /// and the jitter estimator's RTT-scaled ceiling. The host is
    /// expected to derive this from its own RTCP receiver-report loop;
    /// this crate never computes RTT itself (spec.md §9 no hidden clock).
    pub fn set_rtt_ms(&mut self, rtt_ms: i64) {
        self.rtt_ms = rtt_ms.max(1);
        if let Some(nack) = self.nack.as_mut() {
            nack.update_rtt(self.rtt_ms);
        }
        self.jitter_estimator.update_rtt(self.rtt_ms as f64);
    }

    /// Entry point for one already-parsed RTP packet (spec.md §6 "Wire
    /// in"). Handles RTX unwrapping and RED/ULP-FEC demuxing before the
    /// packet reaches the packet buffer.
    pub fn insert_rtp_packet(&mut self, packet: RtpPacketReceived, now_ms: i64) {
        if Some(packet.ssrc()) == self.config.rtx_ssrc {
            match unwrap_rtx(&packet, &self.config) {
                Some(original) => self.handle_media_packet(original, now_ms),
                None => debug!(seq_num = packet.sequence_number(), "dropping unparseable RTX packet"),
            }
            return;
        }

        if packet.ssrc() != self.config.remote_ssrc {
            trace!(ssrc = packet.ssrc(), "dropping packet for unrecognized SSRC");
            return;
        }

        if Some(packet.payload_type()) == self.config.red_payload_type {
            self.handle_red_packet(packet, now_ms);
        } else {
            self.handle_media_packet(packet, now_ms);
        }
    }

    /// Entry point for one raw RTCP compound packet (spec.md §6 "Wire
    /// in"). Folds any Sender Report on our remote SSRC into the NTP
    /// estimator; `local_ntp_time_ms` is the host's own current NTP time.
    pub fn insert_rtcp_packet(&mut self, bytes: &[u8], local_ntp_time_ms: i64) {
        let mut buf = Bytes::copy_from_slice(bytes);
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(packets) => packets,
            Err(e) => {
                debug!(error = %e, "failed to parse RTCP compound packet");
                return;
            }
        };

        for packet in packets {
            let Some(sr) = packet.as_any().downcast_ref::<rtcp::sender_report::SenderReport>() else {
                continue;
            };
            if sr.ssrc != self.config.remote_ssrc {
                continue;
            }
            let ntp_secs = (sr.ntp_time >> 32) as u32;
            let ntp_frac = (sr.ntp_time & 0xFFFF_FFFF) as u32;
            self.ntp
                .update_rtcp_timestamp(self.rtt_ms, ntp_secs, ntp_frac, sr.rtp_time, local_ntp_time_ms);
        }
    }

    fn handle_red_packet(&mut self, packet: RtpPacketReceived, now_ms: i64) {
        let block = match fec::demux_red(packet.payload.as_slice()) {
            Ok(block) => block,
            Err(e) => {
                debug!(error = %e, "failed to demux RED payload");
                return;
            }
        };

        if Some(block.payload_type) == self.config.ulpfec_payload_type {
            if let Some(fec_receiver) = self.fec.as_mut() {
                match fec_receiver.insert_fec_packet(packet.sequence_number(), block.payload) {
                    Ok(recovered) => self.handle_recovered_packets(recovered, now_ms),
                    Err(e) => debug!(error = %e, "malformed ULP-FEC header"),
                }
            }
            return;
        }

        let media_header = RtpHeader { payload_type: block.payload_type, ..packet.header };
        let media_payload_bytes = block.payload.to_vec();

        if let Some(fec_receiver) = self.fec.as_mut() {
            let mut raw = media_header.to_bytes().to_vec();
            raw.extend_from_slice(&media_payload_bytes);
            let recovered = fec_receiver.insert_media_packet(packet.sequence_number(), raw);
            self.handle_recovered_packets(recovered, now_ms);
        }

        let media_packet = RtpPacketReceived {
            header: media_header,
            payload: media_payload_bytes.into(),
            extensions: packet.extensions.clone(),
            arrival_time_ms: packet.arrival_time_ms,
            recovered: packet.recovered,
        };
        self.handle_media_packet(media_packet, now_ms);
    }

    fn handle_recovered_packets(&mut self, recovered: Vec<fec::RecoveredPacket>, now_ms: i64) {
        for r in recovered {
            let Ok((header, offset)) = RtpHeader::parse(&r.bytes) else {
                debug!("recovered packet had an unparseable header");
                continue;
            };
            let payload = r.bytes[offset..].to_vec().into();
            let packet = RtpPacketReceived::recovered(header, payload, now_ms);
            self.handle_media_packet(packet, now_ms);
        }
    }

    fn handle_media_packet(&mut self, packet: RtpPacketReceived, now_ms: i64) {
        let seq_num = packet.sequence_number();
        let is_recovered = packet.recovered;
        let is_keyframe_packet = nalu::parse_h264_payload(packet.payload.as_slice())
            .map(|info| info.has_idr)
            .unwrap_or(false);

        // A packet that was still outstanding in the NACK list is about to
        // be consumed by the packet buffer, which always starts a fresh
        // slot at `times_nacked: 0`; remember it here so a still-buffered
        // sibling packet of the same frame can see the retransmission.
        let was_nacked = self
            .nack
            .as_ref()
            .is_some_and(|nack| nack.outstanding().any(|info| info.seq_num == seq_num));

        if let Some(nack) = self.nack.as_mut() {
            if nack.insert_packet(seq_num, is_keyframe_packet, is_recovered, now_ms) {
                self.request_keyframe();
            }
        }

        let result = self.packet_buffer.insert(packet);
        if was_nacked {
            self.packet_buffer.mark_nacked(seq_num);
        }
        if result.keyframe_requested {
            self.request_keyframe();
        }

        for assembled in result.assembled_frames {
            self.ingest_assembled_frame(assembled);
        }
    }

    fn ingest_assembled_frame(&mut self, assembled: AssembledFrame) {
        let packet_buffer = &self.packet_buffer;
        let missing = |seq: u16| packet_buffer.is_missing(seq);
        let frames = self.frame_ref_finder.insert_frame(assembled, &missing);
        for frame in frames {
            self.insert_into_frame_buffer(frame);
        }
    }

    fn insert_into_frame_buffer(&mut self, frame: FrameToDecode) {
        self.timing.incoming_timestamp(frame.timestamp, frame.max_arrival_time_ms);

        let prior_last_decoded = self.frame_buffer.last_decoded_frame_id();
        let frame_id = frame.frame_id;
        match self.frame_buffer.insert_frame(frame) {
            FrameInsertResult::CodecReset => {
                warn!(frame_id, "codec reset detected, restarting frame id epoch");
                let next_offset = prior_last_decoded.unwrap_or(0) + CODEC_RESET_EPOCH_STRIDE;
                self.frame_ref_finder.reset_with_offset(next_offset);
            }
            FrameInsertResult::InvalidReferences | FrameInsertResult::Dropped => {
                debug!(frame_id, "frame rejected by frame buffer");
            }
            FrameInsertResult::Inserted => {}
        }
    }

    fn request_keyframe(&mut self) {
        self.keyframe_requested = true;
        self.frame_buffer.require_keyframe();
    }

    /// Drains the NACK list due for (re)send and any pending keyframe
    /// request. Intended to be called on a repeating timer (spec.md §4.4,
    /// §5 — `crate::task_queue::spawn_repeating`).
    pub fn poll_feedback(&mut self, now_ms: i64) -> FeedbackRequest {
        let nack_seq_nums = self
            .nack
            .as_mut()
            .map(|nack| nack.nack_list_on_rtt_passed(now_ms))
            .unwrap_or_default();
        let keyframe_requested = std::mem::take(&mut self.keyframe_requested);
        FeedbackRequest { nack_seq_nums, keyframe_requested }
    }

    /// The remote capture time of `rtp_timestamp` in the host's own NTP
    /// timebase, once at least two Sender Reports have been observed
    /// (spec.md §4.9).
    pub fn estimate_capture_ntp_time_ms(&mut self, rtp_timestamp: u32) -> Option<i64> {
        self.ntp.estimate(rtp_timestamp)
    }

    /// Checks whether a frame has become decodable and, if so, how long
    /// until it's actually due to render (spec.md §4.7/§4.8). The caller
    /// is expected to re-poll after `wait_ms` elapses or after any new
    /// frame is inserted.
    pub fn next_decodable(&mut self, now_ms: i64) -> Option<NextDecodable> {
        let (frame_id, wait_ms) = self.frame_buffer.find_next_decodable_frame(&mut self.timing, now_ms)?;
        Some(NextDecodable { frame_id, wait_ms })
    }

    /// Whether `wait_ms` (from [`Self::next_decodable`]) is close enough
    /// to zero that the frame should be dispatched now rather than
    /// scheduled for later (spec.md §4.8's small-slack tolerance).
    pub fn is_ready_to_dispatch(wait_ms: i64) -> bool {
        FrameBuffer::is_ready_to_dispatch(wait_ms)
    }

    /// Dispatches `frame_id`, returning it (and any buffered frame
    /// sharing its timestamp) for decode. `nack_delayed` should be `true`
    /// if this frame's own arrival was already explained by a NACK
    /// round-trip, so the jitter estimator doesn't double-count that
    /// delay (spec.md §4.8).
    pub fn dispatch_frame(&mut self, frame_id: i64, now_ms: i64, nack_delayed: bool) -> Vec<DecodableFrame> {
        self.frame_buffer.deliver_frame(
            frame_id,
            &mut self.timing,
            &mut self.inter_frame_delay,
            &mut self.jitter_estimator,
            now_ms,
            nack_delayed,
        )
    }

    /// Records how long a dispatched frame actually took to decode, for
    /// the next `target_delay_ms` computation (spec.md §4.8).
    pub fn add_decode_time(&mut self, decode_time_ms: i64, now_ms: i64) {
        self.timing.add_decode_time(decode_time_ms, now_ms);
    }

    pub fn num_buffered_frames(&self) -> usize {
        self.frame_buffer.num_buffered_frames()
    }
}

/// Strips the RFC 4588 two-byte original-sequence-number prefix from an
/// RTX packet's payload and remaps header fields so the result can be
/// re-inserted as if it were original media. Gated by
/// [`ReceiverConfig::rtx_ssrc`]/`rtx_associated_payload_types`.
///
/// SDP only negotiates RTX as a set of associated payload types, not a
/// per-PT mapping, so this uses the first configured entry; a receiver
/// negotiating more than one RTX-protected payload type needs a real
/// mapping, which is out of scope here (spec.md §3 non-goals).
fn unwrap_rtx(packet: &RtpPacketReceived, config: &ReceiverConfig) -> Option<RtpPacketReceived> {
    let payload = packet.payload.as_slice();
    if payload.len() < 2 {
        return None;
    }
    let original_seq_num = u16::from_be_bytes([payload[0], payload[1]]);
    let original_payload_type = *config.rtx_associated_payload_types.first()?;

    let header = RtpHeader {
        ssrc: config.remote_ssrc,
        sequence_number: original_seq_num,
        payload_type: original_payload_type,
        ..packet.header
    };

    Some(RtpPacketReceived {
        header,
        payload: payload[2..].to_vec().into(),
        extensions: packet.extensions.clone(),
        arrival_time_ms: packet.arrival_time_ms,
        recovered: packet.recovered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::extensions::ExtensionMap;

    fn make_packet(seq: u16, ts: u32, ssrc: u32, pt: u8, marker: bool, payload: &[u8]) -> RtpPacketReceived {
        let header = RtpHeader::new(seq, ts, ssrc, pt, marker);
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        let map = ExtensionMap::new();
        RtpPacketReceived::parse(&bytes, &map, 0).unwrap()
    }

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            remote_ssrc: 0xAABBCCDD,
            nack_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn single_nalu_keyframe_becomes_decodable() {
        let mut receiver = VideoReceiver::new(config(), 0);
        let nalu_header = (3u8 << 5) | nalu::NALU_TYPE_IDR;
        let packet = make_packet(10, 9000, 0xAABBCCDD, 96, true, &[nalu_header, 0xDE, 0xAD]);
        receiver.insert_rtp_packet(packet, 0);

        let next = receiver.next_decodable(0).expect("keyframe should be decodable");
        assert_eq!(next.frame_id, 10);
    }

    #[test]
    fn packet_on_unknown_ssrc_is_ignored() {
        let mut receiver = VideoReceiver::new(config(), 0);
        let nalu_header = (3u8 << 5) | nalu::NALU_TYPE_IDR;
        let packet = make_packet(10, 9000, 0x11112222, 96, true, &[nalu_header, 0xDE, 0xAD]);
        receiver.insert_rtp_packet(packet, 0);
        assert_eq!(receiver.num_buffered_frames(), 0);
    }

    #[test]
    fn gap_then_fill_drains_as_nack_feedback() {
        let mut receiver = VideoReceiver::new(config(), 0);
        let nalu_header = (3u8 << 5) | nalu::NALU_TYPE_IDR;
        receiver.insert_rtp_packet(make_packet(0, 0, 0xAABBCCDD, 96, true, &[nalu_header, 0x01]), 0);

        let delta_header = (3u8 << 5) | nalu::NALU_TYPE_SLICE;
        // seq 2 arrives with seq 1 missing.
        receiver.insert_rtp_packet(make_packet(2, 2000, 0xAABBCCDD, 96, true, &[delta_header, 0x02]), 0);

        let feedback = receiver.poll_feedback(0);
        assert_eq!(feedback.nack_seq_nums, vec![1]);
    }

    #[test]
    fn rtx_packet_unwraps_to_original_media() {
        let mut config = config();
        config.rtx_ssrc = Some(0xCAFEBABE);
        config.rtx_associated_payload_types = vec![96];
        let mut receiver = VideoReceiver::new(config, 0);

        let nalu_header = (3u8 << 5) | nalu::NALU_TYPE_IDR;
        let mut rtx_payload = vec![0x00, 0x2A]; // original seq_num = 42
        rtx_payload.push(nalu_header);
        rtx_payload.push(0xAA);
        let rtx_packet = make_packet(7, 9000, 0xCAFEBABE, 97, true, &rtx_payload);

        receiver.insert_rtp_packet(rtx_packet, 0);
        let next = receiver.next_decodable(0).expect("unwrapped RTX frame should be decodable");
        assert_eq!(next.frame_id, 42);
    }

    #[test]
    fn red_wrapped_media_assembles_normally() {
        let mut config = config();
        config.red_payload_type = Some(120);
        let mut receiver = VideoReceiver::new(config, 0);

        let nalu_header = (3u8 << 5) | nalu::NALU_TYPE_IDR;
        let mut red_payload = vec![96]; // primary block, pt=96, no FEC
        red_payload.push(nalu_header);
        red_payload.push(0xAA);
        let packet = make_packet(5, 9000, 0xAABBCCDD, 120, true, &red_payload);

        receiver.insert_rtp_packet(packet, 0);
        let next = receiver.next_decodable(0).expect("RED-wrapped keyframe should assemble");
        assert_eq!(next.frame_id, 5);
    }
}
