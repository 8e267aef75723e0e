//! Render-time and decode-wait computation (spec.md §4.8). Grounded on
//! `timing.cpp`/`timing.hpp`: composes a [`TimestampExtrapolator`] and a
//! [`DecodeTimeFilter`], and consumes an externally maintained jitter
//! estimate (see [`JitterEstimator`], owned by whichever component drives
//! frame dispatch) via [`Timing::set_jitter_delay_ms`].

pub mod decode_time_filter;
pub mod extrapolator;
pub mod inter_frame_delay;
pub mod jitter_estimator;

pub use decode_time_filter::DecodeTimeFilter;
pub use extrapolator::TimestampExtrapolator;
pub use inter_frame_delay::InterFrameDelay;
pub use jitter_estimator::JitterEstimator;

use crate::numerics::seq::ts32;

const DEFAULT_RENDER_DELAY_MS: i64 = 10;
const DELAY_MAX_CHANGE_MS_PER_S: f64 = 100.0;
const LOW_LATENCY_RENDER_MAX_PLAYOUT_DELAY_MS: i64 = 500;

pub struct Timing {
    extrapolator: TimestampExtrapolator,
    decode_time_filter: DecodeTimeFilter,

    min_playout_delay_ms: i64,
    max_playout_delay_ms: i64,
    jitter_delay_ms: i64,
    current_delay_ms: i64,
    render_delay_ms: i64,
    zero_playout_delay_min_pacing_ms: i64,
    low_latency_renderer_enabled: bool,

    prev_timestamp: Option<u32>,
    earliest_next_decode_start_time_ms: i64,
}

impl Timing {
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            extrapolator: TimestampExtrapolator::new(start_time_ms),
            decode_time_filter: DecodeTimeFilter::new(),
            min_playout_delay_ms: 0,
            max_playout_delay_ms: 0,
            jitter_delay_ms: 0,
            current_delay_ms: 0,
            render_delay_ms: DEFAULT_RENDER_DELAY_MS,
            zero_playout_delay_min_pacing_ms: 0,
            low_latency_renderer_enabled: false,
            prev_timestamp: None,
            earliest_next_decode_start_time_ms: 0,
        }
    }

    pub fn reset(&mut self, start_time_ms: i64) {
        self.extrapolator.reset(start_time_ms);
        self.decode_time_filter.reset();
        self.jitter_delay_ms = 0;
        self.current_delay_ms = 0;
        self.prev_timestamp = None;
        self.earliest_next_decode_start_time_ms = start_time_ms;
    }

    pub fn incoming_timestamp(&mut self, timestamp: u32, now_ms: i64) {
        self.extrapolator.update(timestamp, now_ms);
    }

    pub fn add_decode_time(&mut self, decode_time_ms: i64, now_ms: i64) {
        self.decode_time_filter.add_timing(decode_time_ms, now_ms);
    }

    pub fn set_jitter_delay_ms(&mut self, delay_ms: i64) {
        self.jitter_delay_ms = delay_ms;
    }

    pub fn set_min_playout_delay(&mut self, delay_ms: i64) {
        self.min_playout_delay_ms = delay_ms;
    }

    pub fn set_max_playout_delay(&mut self, delay_ms: i64) {
        self.max_playout_delay_ms = delay_ms;
    }

    pub fn set_low_latency_renderer_enabled(&mut self, enabled: bool) {
        self.low_latency_renderer_enabled = enabled;
    }

    pub fn set_zero_playout_delay_min_pacing(&mut self, pacing_ms: i64) {
        self.zero_playout_delay_min_pacing_ms = pacing_ms;
    }

    pub fn required_decode_time_ms(&self) -> i64 {
        self.decode_time_filter.required_decode_time_ms()
    }

    pub fn target_delay_ms(&self) -> i64 {
        self.min_playout_delay_ms
            .max(self.jitter_delay_ms + self.required_decode_time_ms() + self.render_delay_ms)
    }

    /// Projected local render time for a frame bearing `timestamp`.
    pub fn render_time_ms(&mut self, timestamp: u32, now_ms: i64) -> i64 {
        let zero_render_requested = self.min_playout_delay_ms == 0
            && (self.max_playout_delay_ms == 0
                || (self.low_latency_renderer_enabled
                    && self.max_playout_delay_ms <= LOW_LATENCY_RENDER_MAX_PLAYOUT_DELAY_MS));
        if zero_render_requested {
            return 0;
        }

        let base_ms = self.extrapolator.extrapolate_local_time(timestamp).unwrap_or(now_ms);
        let lo = self.min_playout_delay_ms;
        let hi = self.max_playout_delay_ms.max(lo);
        base_ms + self.current_delay_ms.clamp(lo, hi)
    }

    /// How long the caller should wait before decoding a frame whose
    /// projected render time is `render_time_ms`. May be negative if the
    /// frame is already late.
    pub fn max_wait_before_decode(&mut self, render_time_ms: i64, now_ms: i64) -> i64 {
        if render_time_ms == 0 && self.zero_playout_delay_min_pacing_ms > 0 {
            let wait_ms = (self.earliest_next_decode_start_time_ms - now_ms).max(0);
            self.earliest_next_decode_start_time_ms = now_ms + wait_ms + self.zero_playout_delay_min_pacing_ms;
            wait_ms
        } else {
            render_time_ms - now_ms - self.required_decode_time_ms() - self.render_delay_ms
        }
    }

    /// Ramps `current_delay_ms` toward `target_delay_ms`, bounded to at most
    /// 100ms of change per elapsed RTP-second since the previous call.
    pub fn update_current_delay(&mut self, timestamp: u32) {
        let target_ms = self.target_delay_ms();
        match self.prev_timestamp {
            None => self.current_delay_ms = target_ms,
            Some(prev) => {
                let elapsed_s = ts32::forward_diff(prev, timestamp) as f64 / 90_000.0;
                let max_change_ms = (DELAY_MAX_CHANGE_MS_PER_S * elapsed_s).round().max(1.0) as i64;
                if target_ms > self.current_delay_ms {
                    self.current_delay_ms = (self.current_delay_ms + max_change_ms).min(target_ms);
                } else {
                    self.current_delay_ms = (self.current_delay_ms - max_change_ms).max(target_ms);
                }
            }
        }
        self.prev_timestamp = Some(timestamp);
    }

    /// Reacts to a decode starting later than its frame's render time by
    /// pulling `current_delay_ms` up toward (but never past) the target;
    /// never decreases it, since an early decode says nothing about jitter.
    pub fn update_current_delay_after_decode(&mut self, render_time_ms: i64, actual_decode_start_ms: i64) {
        let decode_delayed_ms = actual_decode_start_ms - render_time_ms;
        if decode_delayed_ms < 0 {
            return;
        }
        let target_ms = self.target_delay_ms();
        self.current_delay_ms = (self.current_delay_ms + decode_delayed_ms).min(target_ms);
    }

    pub fn current_delay_ms(&self) -> i64 {
        self.current_delay_ms
    }
}
