//! Fixed-capacity moving median, ported from `moving_median_filter.hpp`.
//! Backs the remote-to-local clock offset smoothing in [`crate::ntp`].

use std::collections::VecDeque;

use super::percentile_filter::PercentileFilter;

#[derive(Debug, Clone)]
pub struct MovingMedianFilter {
    window_size: usize,
    percentile_filter: PercentileFilter,
    samples: VecDeque<i64>,
}

impl MovingMedianFilter {
    /// `window_size` must be positive.
    pub fn new(window_size: usize) -> Self {
        assert!(window_size > 0);
        Self {
            window_size,
            percentile_filter: PercentileFilter::new(0.5),
            samples: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, value: i64) {
        self.percentile_filter.insert(value);
        self.samples.push_back(value);
        if self.samples.len() > self.window_size {
            if let Some(oldest) = self.samples.pop_front() {
                self.percentile_filter.erase(oldest);
            }
        }
    }

    pub fn value(&self) -> i64 {
        self.percentile_filter.value()
    }

    pub fn reset(&mut self) {
        self.percentile_filter.reset();
        self.samples.clear();
    }

    pub fn stored_sample_count(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_median_within_window() {
        let mut f = MovingMedianFilter::new(3);
        f.insert(10);
        f.insert(20);
        f.insert(30);
        assert_eq!(f.value(), 20);
        // Pushes 10 out of the window.
        f.insert(100);
        assert_eq!(f.stored_sample_count(), 3);
        assert_eq!(f.value(), 30);
    }

    #[test]
    fn reset_clears_state() {
        let mut f = MovingMedianFilter::new(2);
        f.insert(1);
        f.insert(2);
        f.reset();
        assert_eq!(f.stored_sample_count(), 0);
        assert_eq!(f.value(), 0);
    }
}
