//! Shared frame types that flow from the packet assembler through the
//! reference finder into the frame buffer (spec.md §3).

use crate::buffer::CowBuffer;
use crate::packet_buffer::FrameType;

/// An `AssembledFrame` after the reference finder has assigned it a
/// monotonic id and resolved its dependency set.
#[derive(Debug, Clone)]
pub struct FrameToDecode {
    pub frame_id: i64,
    pub frame_type: FrameType,
    pub references: Vec<i64>,
    pub timestamp: u32,
    pub seq_num_start: u16,
    pub seq_num_end: u16,
    pub min_arrival_time_ms: i64,
    pub max_arrival_time_ms: i64,
    pub times_nacked: u32,
    pub payload: CowBuffer,
    /// Resolved lazily by Timing; `None` until first computed.
    pub render_time_ms: Option<i64>,
}

impl FrameToDecode {
    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}
