//! Crate-wide error taxonomy (spec.md §7).
//!
//! Only contract violations inside the invariants of spec.md §3 are fatal
//! (`Unrecoverable`). Everything else is either silently dropped at the
//! point of detection (malformed headers) or surfaces as a keyframe
//! request through the ordinary `InsertResult`/`NackInsertResult` return
//! values of the hot paths, never as an `Err`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed RTP/FEC/H.264 header. Recovered locally: drop the packet,
    /// bump a metric, keep going.
    #[error("parse error: {0}")]
    Parse(String),

    /// A buffer hit its hard capacity. The caller clears the relevant
    /// structure and requests a keyframe; this never propagates past the
    /// component boundary that detected it.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Codec switch, timestamp jump, or an idle period long enough that
    /// continuing to trust prior state would be wrong.
    #[error("state reset: {0}")]
    StateReset(String),

    /// No frame became ready before its deadline.
    #[error("timeout waiting for frame")]
    Timeout,

    /// A §3 invariant was violated by code that should have upheld it.
    /// Logged and fatal to the stream (keyframe requested, pipeline reset).
    #[error("unrecoverable contract violation: {0}")]
    Unrecoverable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
