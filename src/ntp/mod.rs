//! Remote-to-local NTP time estimation from RTCP Sender Reports
//! (spec.md §4.9). Grounded on `remote_ntp_time_estimator.hpp`/`.cpp`
//! composing [`rtp_to_ntp::RtpToNtpEstimator`] (the RTP-timestamp-to-remote
//! -NTP regression) with a [`crate::numerics::moving_median_filter::MovingMedianFilter`]
//! (remote-to-local clock offset smoothing).
//!
//! Per `crate::error`'s no-hidden-clock-access rule, the caller's current
//! local NTP time is passed in rather than read from a `Clock`.

pub mod rtp_to_ntp;

use crate::numerics::moving_median_filter::MovingMedianFilter;
pub use rtp_to_ntp::RtpToNtpEstimator;

const CLOCK_OFFSET_WINDOW_SIZE: usize = 20;

fn ntp_to_ms(ntp_secs: u32, ntp_frac: u32) -> i64 {
    let fractions_ms = ntp_frac as f64 / (u32::MAX as f64 + 1.0) * 1000.0;
    (ntp_secs as i64) * 1000 + fractions_ms.round() as i64
}

pub struct RemoteNtpTimeEstimator {
    ntp_clock_offset: MovingMedianFilter,
    rtp_to_ntp: RtpToNtpEstimator,
}

impl RemoteNtpTimeEstimator {
    pub fn new() -> Self {
        Self {
            ntp_clock_offset: MovingMedianFilter::new(CLOCK_OFFSET_WINDOW_SIZE),
            rtp_to_ntp: RtpToNtpEstimator::new(),
        }
    }

    /// Folds in one RTCP Sender Report. `rtt_ms` is the current round-trip
    /// estimate to the sender; `local_ntp_time_ms` is the caller's own
    /// current NTP time, used to compute the remote-to-local offset.
    /// Returns `false` if the SR's NTP timestamp was zero (invalid) or the
    /// sample was rejected as a duplicate/out-of-range outlier.
    pub fn update_rtcp_timestamp(
        &mut self,
        rtt_ms: i64,
        ntp_secs: u32,
        ntp_frac: u32,
        rtp_timestamp: u32,
        local_ntp_time_ms: i64,
    ) -> bool {
        if ntp_secs == 0 && ntp_frac == 0 {
            return false;
        }

        let sender_send_ms = ntp_to_ms(ntp_secs, ntp_frac);
        if !self.rtp_to_ntp.update_measurements(sender_send_ms, rtp_timestamp) {
            return false;
        }

        let sender_arrival_ms = sender_send_ms + rtt_ms / 2;
        let offset = local_ntp_time_ms - sender_arrival_ms;
        self.ntp_clock_offset.insert(offset);
        true
    }

    /// Estimates `rtp_timestamp`'s capture time in local NTP ms, or `None`
    /// before at least two Sender Reports have been folded in.
    pub fn estimate(&mut self, rtp_timestamp: u32) -> Option<i64> {
        if self.ntp_clock_offset.stored_sample_count() == 0 {
            return None;
        }
        let remote_capture_ms = self.rtp_to_ntp.estimate(rtp_timestamp)?;
        Some(remote_capture_ms + self.ntp_clock_offset.value())
    }

    pub fn estimate_remote_to_local_clock_offset_ms(&self) -> Option<i64> {
        if self.ntp_clock_offset.stored_sample_count() == 0 {
            None
        } else {
            Some(self.ntp_clock_offset.value())
        }
    }
}

impl Default for RemoteNtpTimeEstimator {
    fn default() -> Self {
        Self::new()
    }
}
