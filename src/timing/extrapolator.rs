//! RTP-timestamp-to-local-time projection: a 2-state Kalman filter
//! estimating `(clock_rate_per_ms, offset_ms)` from `(timestamp,
//! receive_time_ms)` samples. Grounded on `timestamp_extrapolator.cpp`.

const ALARM_THRESHOLD: f64 = 60e3;
const ACC_DRIFT: f64 = 6600.0;
const ACC_MAX_ERROR: f64 = 7000.0;
const THETA_COV_11: f64 = 1e10;
const LAMBDA: f64 = 1.0;
const MIN_PACKET_COUNT_BEFORE_STARTUP_FILTER: u32 = 2;
const RESET_GAP_MS: i64 = 10_000;

pub struct TimestampExtrapolator {
    start_time_ms: i64,
    prev_time_ms: i64,
    first_unwrapped_timestamp: i64,
    num_wrap_arounds: i64,
    prev_unwrapped_timestamp: Option<i64>,
    prev_timestamp: Option<u32>,
    first_after_reset: bool,
    packet_count: u32,
    theta: [f64; 2],
    theta_cov: [[f64; 2]; 2],
    detector_accumulator_pos: f64,
    detector_accumulator_neg: f64,
}

impl TimestampExtrapolator {
    pub fn new(start_time_ms: i64) -> Self {
        let mut me = Self {
            start_time_ms: 0,
            prev_time_ms: 0,
            first_unwrapped_timestamp: 0,
            num_wrap_arounds: 0,
            prev_unwrapped_timestamp: None,
            prev_timestamp: None,
            first_after_reset: true,
            packet_count: 0,
            theta: [0.0; 2],
            theta_cov: [[0.0; 2]; 2],
            detector_accumulator_pos: 0.0,
            detector_accumulator_neg: 0.0,
        };
        me.reset(start_time_ms);
        me
    }

    pub fn reset(&mut self, start_time_ms: i64) {
        self.start_time_ms = start_time_ms;
        self.prev_time_ms = start_time_ms;
        self.first_unwrapped_timestamp = 0;
        self.theta = [90.0, 0.0];
        self.theta_cov = [[1.0, 0.0], [0.0, THETA_COV_11]];
        self.first_after_reset = true;
        self.prev_unwrapped_timestamp = None;
        self.prev_timestamp = None;
        self.num_wrap_arounds = 0;
        self.packet_count = 0;
        self.detector_accumulator_pos = 0.0;
        self.detector_accumulator_neg = 0.0;
    }

    pub fn update(&mut self, timestamp: u32, receive_time_ms: i64) {
        if receive_time_ms - self.prev_time_ms > RESET_GAP_MS {
            self.reset(receive_time_ms);
        } else {
            self.prev_time_ms = receive_time_ms;
        }

        let recv_diff_ms = (receive_time_ms - self.start_time_ms) as f64;
        let unwrapped_timestamp = self.unwrap(timestamp);

        if self.first_after_reset {
            self.theta[1] = -self.theta[0] * recv_diff_ms;
            self.first_unwrapped_timestamp = unwrapped_timestamp;
            self.first_after_reset = false;
        }

        let residual = (unwrapped_timestamp - self.first_unwrapped_timestamp) as f64
            - recv_diff_ms * self.theta[0]
            - self.theta[1];

        if self.delay_change_detection(residual) && self.packet_count >= MIN_PACKET_COUNT_BEFORE_STARTUP_FILTER {
            self.theta_cov[1][1] = THETA_COV_11;
        }

        if let Some(prev) = self.prev_unwrapped_timestamp {
            if unwrapped_timestamp < prev {
                return;
            }
        }

        let mut k = [
            self.theta_cov[0][0] * recv_diff_ms + self.theta_cov[0][1],
            self.theta_cov[1][0] * recv_diff_ms + self.theta_cov[1][1],
        ];
        let hph = LAMBDA + recv_diff_ms * k[0] + k[1];
        k[0] /= hph;
        k[1] /= hph;

        self.theta[0] += k[0] * residual;
        self.theta[1] += k[1] * residual;

        let p00 = 1.0 / LAMBDA
            * (self.theta_cov[0][0] - (k[0] * recv_diff_ms * self.theta_cov[0][0] + k[0] * self.theta_cov[1][0]));
        let p01 = 1.0 / LAMBDA
            * (self.theta_cov[0][1] - (k[0] * recv_diff_ms * self.theta_cov[0][1] + k[0] * self.theta_cov[1][1]));
        self.theta_cov[1][0] = 1.0 / LAMBDA
            * (self.theta_cov[1][0] - (k[1] * recv_diff_ms * self.theta_cov[0][0] + k[1] * self.theta_cov[1][0]));
        self.theta_cov[1][1] = 1.0 / LAMBDA
            * (self.theta_cov[1][1] - (k[1] * recv_diff_ms * self.theta_cov[0][1] + k[1] * self.theta_cov[1][1]));
        self.theta_cov[0][0] = p00;
        self.theta_cov[0][1] = p01;

        self.prev_unwrapped_timestamp = Some(unwrapped_timestamp);
        if self.packet_count < MIN_PACKET_COUNT_BEFORE_STARTUP_FILTER {
            self.packet_count += 1;
        }
    }

    /// Projects `timestamp` to an estimated local receive time, or `None`
    /// before the filter has seen its first sample.
    pub fn extrapolate_local_time(&mut self, timestamp: u32) -> Option<i64> {
        self.prev_unwrapped_timestamp?;

        let unwrapped_timestamp = self.unwrap(timestamp);
        let local_time_ms = if self.packet_count == 0 {
            return None;
        } else if self.packet_count < MIN_PACKET_COUNT_BEFORE_STARTUP_FILTER {
            self.prev_time_ms
                + ((unwrapped_timestamp - self.prev_unwrapped_timestamp.unwrap()) as f64 / 90.0 + 0.5) as i64
        } else if self.theta[0] < 1e-3 {
            self.start_time_ms
        } else {
            let timestamp_diff = (unwrapped_timestamp - self.first_unwrapped_timestamp) as f64;
            (self.start_time_ms as f64 + (timestamp_diff - self.theta[1]) / self.theta[0] + 0.5) as i64
        };
        Some(local_time_ms)
    }

    fn unwrap(&mut self, timestamp: u32) -> i64 {
        if let Some(prev) = self.prev_timestamp {
            self.num_wrap_arounds += detect_wrap_around(prev, timestamp) as i64;
        }
        self.prev_timestamp = Some(timestamp);
        const MODULO_VALUE: i64 = 1i64 << 32;
        timestamp as i64 + self.num_wrap_arounds * MODULO_VALUE
    }

    /// CUSUM-style change detector on the Kalman residual. The clamp is
    /// bounded to `[-ACC_MAX_ERROR, ACC_MAX_ERROR]` rather than the
    /// original's one-sided clamp, which collapsed every positive residual
    /// to `-ACC_MAX_ERROR`.
    fn delay_change_detection(&mut self, error: f64) -> bool {
        let error = error.clamp(-ACC_MAX_ERROR, ACC_MAX_ERROR);
        self.detector_accumulator_pos = (self.detector_accumulator_pos + error - ACC_DRIFT).max(0.0);
        self.detector_accumulator_neg = (self.detector_accumulator_neg + error + ACC_DRIFT).min(0.0);
        if self.detector_accumulator_pos > ALARM_THRESHOLD || self.detector_accumulator_neg < -ALARM_THRESHOLD {
            self.detector_accumulator_pos = 0.0;
            self.detector_accumulator_neg = 0.0;
            true
        } else {
            false
        }
    }
}

fn detect_wrap_around(old_ts: u32, new_ts: u32) -> i32 {
    let diff = new_ts.wrapping_sub(old_ts);
    if old_ts > new_ts && diff < (1u32 << 31) {
        1
    } else if new_ts > old_ts && new_ts.wrapping_sub(old_ts) > (1u32 << 31) {
        -1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncalibrated_extrapolator_returns_none() {
        let mut ext = TimestampExtrapolator::new(0);
        assert_eq!(ext.extrapolate_local_time(9000), None);
    }

    #[test]
    fn extrapolates_monotonically_over_steady_samples() {
        let mut ext = TimestampExtrapolator::new(0);
        let mut prev = None;
        for i in 0..20i64 {
            let ts = (i * 9000) as u32;
            let recv = i * 100;
            ext.update(ts, recv);
            let local = ext.extrapolate_local_time(ts).unwrap();
            if let Some(p) = prev {
                assert!(local >= p, "{} should be >= {}", local, p);
            }
            prev = Some(local);
        }
    }

    #[test]
    fn resets_after_a_long_receive_gap() {
        let mut ext = TimestampExtrapolator::new(0);
        ext.update(0, 0);
        ext.update(90_000, 50_000);
        assert_eq!(ext.start_time_ms, 50_000);
    }
}
