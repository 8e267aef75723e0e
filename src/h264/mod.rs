//! H.264 depacketization: NALU/STAP-A/FU-A parsing and SPS/PPS-driven
//! bitstream fixup (spec.md §4.3).

pub mod bitreader;
pub mod nalu;
pub mod sps_pps_tracker;

pub use nalu::{H264PacketInfo, NaluInfo, PacketizationMode};
pub use sps_pps_tracker::{FixupAction, PpsInfo, SpsInfo, SpsPpsTracker};
