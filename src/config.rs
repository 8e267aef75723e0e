//! Receiver configuration (spec.md §6).

/// Configuration for one [`crate::receiver::VideoReceiver`] instance.
///
/// Plain struct with a `Default` impl, in the same style as the teacher's
/// `VideoConfig`/`OpusConfig` (no builder — these are receiver-session
/// constants decided once at SDP negotiation time by the host application).
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// SSRC this receiver uses when it is itself the source of RTCP.
    pub local_ssrc: u32,
    /// Primary media SSRC to demux.
    pub remote_ssrc: u32,

    /// RED + ULP-FEC payload types, if FEC is negotiated.
    pub red_payload_type: Option<u8>,
    pub ulpfec_payload_type: Option<u8>,

    /// RTX SSRC and the set of associated (original) payload types, if
    /// retransmission is negotiated.
    pub rtx_ssrc: Option<u32>,
    pub rtx_associated_payload_types: Vec<u8>,

    /// Enable the NACK module.
    pub nack_enabled: bool,
    /// §4.4 pacing knobs.
    pub send_nack_delay_ms: i64,
    pub max_nack_list_size: usize,
    pub max_nack_retries: usize,

    /// H.264 keyframe classification policy (§4.2).
    pub sps_pps_idr_is_keyframe: bool,

    /// Playout delay bounds forwarded to Timing (§4.8).
    pub min_playout_delay_ms: i64,
    pub max_playout_delay_ms: i64,
    pub render_delay_ms: i64,
    pub zero_playout_delay_min_pacing_ms: i64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            local_ssrc: 0,
            remote_ssrc: 0,
            red_payload_type: None,
            ulpfec_payload_type: None,
            rtx_ssrc: None,
            rtx_associated_payload_types: Vec::new(),
            nack_enabled: true,
            send_nack_delay_ms: 0,
            max_nack_list_size: 1000,
            max_nack_retries: 10,
            sps_pps_idr_is_keyframe: false,
            min_playout_delay_ms: 0,
            max_playout_delay_ms: 0,
            render_delay_ms: 10,
            zero_playout_delay_min_pacing_ms: 0,
        }
    }
}
