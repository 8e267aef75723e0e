//! 95th-percentile decode-time estimate over a sliding time window.
//! Grounded on `decode_time_filter.cpp`: a percentile multiset plus a FIFO
//! of `(decode_time_ms, sample_time_ms)` samples used to expire entries
//! once they fall outside the window.

use std::collections::VecDeque;

use crate::numerics::percentile_filter::PercentileFilter;

const DEFAULT_PERCENTILE: f64 = 0.95;
const DEFAULT_WINDOW_SIZE_MS: i64 = 10_000;
const DEFAULT_IGNORED_SAMPLE_THRESHOLD: usize = 5;

struct Sample {
    decode_time_ms: i64,
    sample_time_ms: i64,
}

pub struct DecodeTimeFilter {
    window_size_ms: i64,
    ignored_sample_threshold: usize,
    ignored_sample_count: usize,
    history: VecDeque<Sample>,
    filter: PercentileFilter,
}

impl DecodeTimeFilter {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_PERCENTILE, DEFAULT_WINDOW_SIZE_MS, DEFAULT_IGNORED_SAMPLE_THRESHOLD)
    }

    pub fn with_params(percentile: f64, window_size_ms: i64, ignored_sample_threshold: usize) -> Self {
        Self {
            window_size_ms,
            ignored_sample_threshold,
            ignored_sample_count: 0,
            history: VecDeque::new(),
            filter: PercentileFilter::new(percentile),
        }
    }

    pub fn add_timing(&mut self, decode_time_ms: i64, now_ms: i64) {
        if self.ignored_sample_count < self.ignored_sample_threshold {
            self.ignored_sample_count += 1;
            return;
        }

        self.filter.insert(decode_time_ms);
        self.history.push_back(Sample { decode_time_ms, sample_time_ms: now_ms });

        while let Some(front) = self.history.front() {
            if now_ms - front.sample_time_ms > self.window_size_ms {
                self.filter.erase(front.decode_time_ms);
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn required_decode_time_ms(&self) -> i64 {
        self.filter.value()
    }

    pub fn reset(&mut self) {
        self.ignored_sample_count = 0;
        self.history.clear();
        self.filter.reset();
    }
}

impl Default for DecodeTimeFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_first_samples() {
        let mut f = DecodeTimeFilter::with_params(0.95, 10_000, 2);
        f.add_timing(100, 0);
        f.add_timing(100, 1);
        assert_eq!(f.required_decode_time_ms(), 0);
        f.add_timing(50, 2);
        assert_eq!(f.required_decode_time_ms(), 50);
    }

    #[test]
    fn expires_samples_outside_window() {
        let mut f = DecodeTimeFilter::with_params(0.95, 100, 0);
        f.add_timing(10, 0);
        f.add_timing(20, 50);
        assert!(f.required_decode_time_ms() > 0);
        f.add_timing(5, 300);
        assert_eq!(f.required_decode_time_ms(), 5);
    }
}
