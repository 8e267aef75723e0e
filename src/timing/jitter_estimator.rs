//! Kalman-style jitter estimate: a linear regression of inter-frame decode
//! delay against frame size, with a noise estimate derived from the
//! regression residual. No `original_source` translation unit exists for
//! this component (the corpus does not carry a `jitter_estimator.cpp`); the
//! two-state Kalman shape mirrors `TimestampExtrapolator` and the frame-size
//! regression follows the JitterEstimator contract described alongside
//! `timing.cpp`'s consumers. See `DESIGN.md` for the grounding note.

const PHI: f64 = 0.97;
const PSI: f64 = 0.9999;
const ALPHA_COUNT_MAX: u32 = 400;
const THETA_LOW: f64 = 1e-6;
const NOISE_STD_DEVS: f64 = 2.33;
const NOISE_STD_DEV_OFFSET: f64 = 30.0;
const NUM_STD_DEV_DELAY_OUTLIER: f64 = 15.0;
const NUM_STD_DEV_SIZE_OUTLIER: f64 = 3.0;

pub struct JitterEstimator {
    theta: [f64; 2],
    theta_cov: [[f64; 2]; 2],
    var_noise: f64,
    avg_noise: f64,
    alpha_count: u32,
    filter_jitter_estimate_ms: f64,
    avg_frame_size: f64,
    var_frame_size: f64,
    max_frame_size: f64,
    prev_frame_size: Option<f64>,
    num_frames: u32,
    nack_mode: bool,
    rtt_ms: f64,
}

impl JitterEstimator {
    pub fn new() -> Self {
        let mut me = Self {
            theta: [0.0; 2],
            theta_cov: [[0.0; 2]; 2],
            var_noise: 0.0,
            avg_noise: 0.0,
            alpha_count: ALPHA_COUNT_MAX,
            filter_jitter_estimate_ms: 0.0,
            avg_frame_size: 0.0,
            var_frame_size: 0.0,
            max_frame_size: 0.0,
            prev_frame_size: None,
            num_frames: 0,
            nack_mode: false,
            rtt_ms: 0.0,
        };
        me.reset();
        me
    }

    pub fn reset(&mut self) {
        self.theta = [1.0 / 512.0, 0.0];
        self.theta_cov = [[1e-4, 0.0], [0.0, 1e2]];
        self.var_noise = 4.0;
        self.avg_noise = 0.0;
        self.alpha_count = 1;
        self.filter_jitter_estimate_ms = 0.0;
        self.avg_frame_size = 0.0;
        self.var_frame_size = 0.0;
        self.max_frame_size = 0.0;
        self.prev_frame_size = None;
        self.num_frames = 0;
    }

    pub fn set_nack_mode(&mut self, enabled: bool) {
        self.nack_mode = enabled;
    }

    pub fn update_rtt(&mut self, rtt_ms: f64) {
        self.rtt_ms = rtt_ms;
    }

    /// Folds in one completed frame's inter-frame decode delay and size.
    pub fn update_estimate(&mut self, frame_delay_ms: f64, frame_size_bytes: u32) {
        if frame_size_bytes == 0 {
            return;
        }
        let frame_size = frame_size_bytes as f64;
        self.num_frames += 1;

        if self.num_frames == 1 {
            self.avg_frame_size = frame_size;
            self.prev_frame_size = Some(frame_size);
            return;
        }

        let alpha_size = (self.num_frames.min(ALPHA_COUNT_MAX - 1)) as f64 / self.num_frames as f64;
        self.avg_frame_size = alpha_size * self.avg_frame_size + (1.0 - alpha_size) * frame_size;
        let size_diff = frame_size - self.avg_frame_size;
        self.var_frame_size = alpha_size * self.var_frame_size + (1.0 - alpha_size) * size_diff * size_diff;
        self.max_frame_size = self.max_frame_size.max(frame_size);

        let delta_frame_bytes = frame_size - self.prev_frame_size.unwrap_or(frame_size);
        self.prev_frame_size = Some(frame_size);

        if self.is_size_outlier(delta_frame_bytes) {
            return;
        }

        let residual = frame_delay_ms - (self.theta[0] * delta_frame_bytes + self.theta[1]);
        if self.is_delay_outlier(residual) {
            return;
        }

        self.kalman_update(delta_frame_bytes, residual);
        self.estimate_random_jitter(residual);
        self.recompute_filter_jitter_estimate();
    }

    fn is_size_outlier(&self, delta_frame_bytes: f64) -> bool {
        if self.var_frame_size <= 0.0 {
            return false;
        }
        delta_frame_bytes.abs() > NUM_STD_DEV_SIZE_OUTLIER * self.var_frame_size.sqrt()
    }

    fn is_delay_outlier(&self, residual: f64) -> bool {
        if self.var_noise <= 0.0 {
            return false;
        }
        residual.abs() > NUM_STD_DEV_DELAY_OUTLIER * self.var_noise.sqrt()
    }

    fn kalman_update(&mut self, delta_frame_bytes: f64, residual: f64) {
        let e = &mut self.theta_cov;
        let q_cov_guard = 1e-9;
        let m_noise_var = self.var_noise.max(1.0);

        let ehh = [
            e[0][0] * delta_frame_bytes + e[0][1],
            e[1][0] * delta_frame_bytes + e[1][1],
        ];
        let denom = m_noise_var + delta_frame_bytes * ehh[0] + ehh[1];
        if denom.abs() < q_cov_guard {
            return;
        }
        let k = [ehh[0] / denom, ehh[1] / denom];

        self.theta[0] += k[0] * residual;
        self.theta[1] += k[1] * residual;
        if self.theta[0] < THETA_LOW {
            self.theta[0] = THETA_LOW;
        }

        let e00 = e[0][0] - k[0] * (delta_frame_bytes * e[0][0] + e[0][1]);
        let e01 = e[0][1] - k[0] * (delta_frame_bytes * e[0][1] + e[1][1]);
        let e10 = e[1][0] - k[1] * (delta_frame_bytes * e[0][0] + e[0][1]);
        let e11 = e[1][1] - k[1] * (delta_frame_bytes * e[0][1] + e[1][1]);
        e[0][0] = e00;
        e[0][1] = e01;
        e[1][0] = e10;
        e[1][1] = e11;
    }

    fn estimate_random_jitter(&mut self, residual: f64) {
        self.alpha_count = (self.alpha_count + 1).min(ALPHA_COUNT_MAX);
        let alpha = PHI.powf(30.0 / 30.0).min(1.0 - 1.0 / self.alpha_count as f64);
        self.avg_noise = alpha * self.avg_noise + (1.0 - alpha) * residual;
        let deviation = residual - self.avg_noise;
        self.var_noise = (alpha * self.var_noise + (1.0 - alpha) * deviation * deviation).max(1.0);
    }

    fn recompute_filter_jitter_estimate(&mut self) {
        let std_dev = self.var_noise.sqrt();
        let size_term = if self.max_frame_size > self.avg_frame_size && self.theta[0] > 0.0 {
            self.theta[0] * (self.max_frame_size - self.avg_frame_size)
        } else {
            0.0
        };
        let raw = (NOISE_STD_DEVS * std_dev - NOISE_STD_DEV_OFFSET).max(0.0) + size_term;
        self.filter_jitter_estimate_ms = PSI * self.filter_jitter_estimate_ms + (1.0 - PSI) * raw;
    }

    /// Current jitter estimate in ms, bounded by an RTT contribution when
    /// NACK is the active protection mode (a lost-then-retransmitted frame
    /// should not inflate jitter beyond the round-trip it actually cost).
    pub fn get_jitter_estimate_ms(&self, rtt_mult: f64) -> i64 {
        let mut estimate = self.filter_jitter_estimate_ms;
        if self.nack_mode && self.rtt_ms > 0.0 {
            estimate = estimate.min(self.rtt_ms * rtt_mult);
        }
        estimate.max(0.0).round() as i64
    }
}

impl Default for JitterEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_estimator_reports_zero_jitter() {
        let est = JitterEstimator::new();
        assert_eq!(est.get_jitter_estimate_ms(1.0), 0);
    }

    #[test]
    fn steady_frames_keep_jitter_low() {
        let mut est = JitterEstimator::new();
        for _ in 0..50 {
            est.update_estimate(33.0, 1000);
        }
        assert!(est.get_jitter_estimate_ms(1.0) < 50);
    }

    #[test]
    fn nack_mode_bounds_jitter_by_rtt() {
        let mut est = JitterEstimator::new();
        est.set_nack_mode(true);
        est.update_rtt(10.0);
        for i in 0..50 {
            let delay = if i % 5 == 0 { 500.0 } else { 33.0 };
            est.update_estimate(delay, 1000);
        }
        assert!(est.get_jitter_estimate_ms(2.0) <= 20);
    }
}
