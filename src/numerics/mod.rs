//! Wrap-aware integer arithmetic and streaming filters (spec.md §4.1).
//!
//! Grounded on `wrap_around_utils.hpp` and `num_unwrapper.hpp` in
//! `examples/original_source/`.

pub mod moving_median_filter;
pub mod percentile_filter;
pub mod seq;
pub mod unwrap;

pub use seq::{ahead_of, ahead_or_at, forward_diff, reverse_diff};
pub use unwrap::{SeqNumUnwrapper, TimestampUnwrapper, Unwrapper};
