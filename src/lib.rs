//! Receive-side RTP video pipeline: packet reassembly, NACK-based
//! retransmission, ULP-FEC recovery, frame reference resolution, and
//! jitter/timing-gated dispatch to a decoder.
//!
//! See `DESIGN.md` for the grounding ledger behind each module.

pub mod buffer;
pub mod config;
pub mod error;
pub mod fec;
pub mod frame;
pub mod frame_buffer;
pub mod frame_ref_finder;
pub mod h264;
pub mod logging;
pub mod nack;
pub mod ntp;
pub mod numerics;
pub mod packet_buffer;
pub mod receiver;
pub mod rtp;
pub mod task_queue;
pub mod timing;

pub use config::ReceiverConfig;
pub use error::{PipelineError, Result};
pub use frame::FrameToDecode;
pub use receiver::VideoReceiver;
