//! RTP wire types for the receive path (spec.md §6).
//!
//! Grounded on the teacher's `voip/rtp_video.rs` `RtpHeader`/`RtpPacket`
//! shape, generalized to carry a [`crate::buffer::CowBuffer`] payload, an
//! arrival timestamp, a `recovered` flag, and a registered header-extension
//! map, per spec.md §3's `RtpPacketReceived`.

pub mod extensions;
pub mod header;
pub mod packet;

pub use extensions::{ExtensionMap, ExtensionType, PlayoutDelay};
pub use header::RtpHeader;
pub use packet::RtpPacketReceived;
