//! Promotes a wrapping `u16`/`u32` counter to a monotonically increasing
//! `i64`, ported from `num_unwrapper.hpp`.

use super::seq;

/// Generic unwrapper over a `BITS`-wide unsigned counter (16 for sequence
/// numbers, 32 for RTP timestamps).
#[derive(Debug, Default, Clone)]
pub struct Unwrapper<const BITS: u32> {
    last_unwrapped: Option<i64>,
}

impl<const BITS: u32> Unwrapper<BITS> {
    const MODULUS: u64 = 1u64 << BITS;
    /// The max count the underlying type can represent (`u16::MAX as i64 + 1`
    /// for `BITS = 16`).
    const BACKWARD_ADJUSTMENT: i64 = Self::MODULUS as i64;

    pub fn new() -> Self {
        Self {
            last_unwrapped: None,
        }
    }

    pub fn last(&self) -> Option<i64> {
        self.last_unwrapped
    }

    pub fn update_last(&mut self, value: i64) {
        self.last_unwrapped = Some(value);
    }

    /// Unwrap `value`, optionally advancing the tracked last value.
    ///
    /// Refuses to produce a negative result: if the backward distance from
    /// the last value would cross below zero, the unwrapper adds one full
    /// modulus back in (matching the C++ "don't wrap backwards past 0"
    /// behavior).
    pub fn unwrap(&mut self, value: u64, update_last: bool) -> i64 {
        let unwrapped = match self.last_unwrapped {
            None => value as i64,
            Some(last) => {
                let last_value = (last as u64) & (Self::MODULUS - 1);
                if seq::ahead_or_at_mod(value, last_value, Self::MODULUS) {
                    last + seq::forward_diff_mod(last_value, value, Self::MODULUS) as i64
                } else {
                    let mut unwrapped =
                        last - seq::reverse_diff_mod(last_value, value, Self::MODULUS) as i64;
                    if unwrapped < 0 {
                        unwrapped += Self::BACKWARD_ADJUSTMENT;
                    }
                    unwrapped
                }
            }
        };

        if update_last {
            self.last_unwrapped = Some(unwrapped);
        }
        unwrapped
    }
}

pub type SeqNumUnwrapper = Unwrapper<16>;
pub type TimestampUnwrapper = Unwrapper<32>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_returns_value_unchanged() {
        let mut u = SeqNumUnwrapper::new();
        assert_eq!(u.unwrap(42, true), 42);
    }

    #[test]
    fn unwraps_forward_across_wrap_point() {
        let mut u = SeqNumUnwrapper::new();
        u.unwrap(0xFFFE, true);
        // 0xFFFE -> 0xFFFF is a small forward step, no wrap.
        assert_eq!(u.unwrap(0xFFFF, true), 0xFFFF);
        // 0xFFFF -> 0x0000 wraps: unwrapped should be 0x10000.
        assert_eq!(u.unwrap(0x0000, true), 0x1_0000);
        assert_eq!(u.unwrap(0x0001, true), 0x1_0001);
    }

    #[test]
    fn monotonic_over_a_run_of_forward_steps() {
        let mut u = SeqNumUnwrapper::new();
        let mut prev = u.unwrap(65530, true);
        for v in [65531u64, 65532, 65533, 65534, 65535, 0, 1, 2, 3] {
            let next = u.unwrap(v, true);
            assert!(next > prev, "{} should be > {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn does_not_unwrap_below_zero() {
        let mut u = SeqNumUnwrapper::new();
        u.unwrap(5, true);
        // A large backward jump from a small last value would otherwise go
        // negative; it should instead be treated as a wrap.
        let unwrapped = u.unwrap(65000, true);
        assert!(unwrapped >= 0);
    }
}
