//! Continuity- and decodability-tracking frame buffer (spec.md §4.7).
//!
//! Grounded on `frame_buffer.hpp` plus the two translation units that
//! implement it: `frame_buffer_continuity.cpp` (insertion, reference
//! validation, continuity propagation) and `frame_buffer_decodability.cpp`
//! (decodable-frame scanning, render-timing validation, decodability
//! propagation, dispatch). `history` (`DecodedFramesHistory`) is its own
//! module since the original keeps it a separate translation unit too.

pub mod history;

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::frame::FrameToDecode;
use crate::numerics::seq::ts32;
use crate::timing::{InterFrameDelay, JitterEstimator, Timing};
use history::DecodedFramesHistory;

/// Backpressure cap (spec.md §5): cleared on keyframe, dropped on delta,
/// once the buffer holds this many undecoded frames.
const MAX_FRAMES_BUFFERED: usize = 800;
/// A dispatch scan stops waiting once the best candidate's wait is within
/// this many ms of being ready, and schedules its own re-check instead.
const MAX_ALLOWED_FRAME_DELAY_MS: i64 = 5;
/// A render time further than this from "now" in either direction is
/// rejected as a broken invariant (§4.7 `ValidRenderTiming`).
const MAX_VIDEO_DELAY_MS: i64 = 10_000;

struct FrameInfo {
    frame: Option<FrameToDecode>,
    num_missing_continuous: usize,
    num_missing_decodable: usize,
    dependent_frames: Vec<i64>,
}

impl FrameInfo {
    fn placeholder() -> Self {
        Self {
            frame: None,
            num_missing_continuous: 0,
            num_missing_decodable: 0,
            dependent_frames: Vec::new(),
        }
    }

    fn continuous(&self) -> bool {
        self.frame.is_some() && self.num_missing_continuous == 0
    }

    fn decodable(&self) -> bool {
        self.continuous() && self.num_missing_decodable == 0
    }
}

/// Outcome of [`FrameBuffer::insert_frame`].
#[derive(Debug, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// Frame references unknown or never-decoded frames; rejected.
    InvalidReferences,
    /// Buffer was at capacity; cleared (keyframe) or dropped this frame.
    Dropped,
    /// A codec reset was detected; the buffer was cleared and this frame
    /// became the new base.
    CodecReset,
}

/// A frame ready for the decoder, with its computed render time.
pub struct DecodableFrame {
    pub frame: FrameToDecode,
    pub render_time_ms: i64,
}

pub struct FrameBuffer {
    frame_infos: BTreeMap<i64, FrameInfo>,
    last_continuous_frame_id: Option<i64>,
    last_decoded_frame_id: Option<i64>,
    last_decoded_frame_timestamp: Option<u32>,
    history: DecodedFramesHistory,
    keyframe_required: bool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            frame_infos: BTreeMap::new(),
            last_continuous_frame_id: None,
            last_decoded_frame_id: None,
            last_decoded_frame_timestamp: None,
            history: DecodedFramesHistory::default(),
            keyframe_required: true,
        }
    }

    pub fn clear(&mut self) {
        self.frame_infos.clear();
        self.last_continuous_frame_id = None;
        self.history.clear();
        self.keyframe_required = true;
    }

    fn is_codec_reset(&self, frame: &FrameToDecode) -> bool {
        let (Some(last_id), Some(last_ts)) = (self.last_decoded_frame_id, self.last_decoded_frame_timestamp) else {
            return false;
        };
        frame.frame_id <= last_id && ts32::ahead_of(frame.timestamp, last_ts) && frame.is_keyframe()
    }

    fn valid_references(&self, frame: &FrameToDecode) -> bool {
        if frame.is_keyframe() {
            return frame.references.is_empty();
        }
        frame.references.iter().all(|&r| r < frame.frame_id)
    }

    pub fn insert_frame(&mut self, frame: FrameToDecode) -> InsertResult {
        if !self.valid_references(&frame) {
            warn!(frame_id = frame.frame_id, "frame has invalid references, rejecting");
            return InsertResult::InvalidReferences;
        }

        if self.is_codec_reset(&frame) {
            debug!(frame_id = frame.frame_id, "codec reset detected, clearing frame buffer");
            self.clear();
            self.history.clear();
            self.last_decoded_frame_id = None;
            self.last_decoded_frame_timestamp = None;
            self.emplace_frame_info(frame);
            return InsertResult::CodecReset;
        }

        if let Some(last_decoded) = self.last_decoded_frame_id {
            if frame.frame_id <= last_decoded {
                debug!(frame_id = frame.frame_id, "stale or duplicate frame, dropping");
                return InsertResult::Dropped;
            }
        }

        if self.frame_infos.len() >= MAX_FRAMES_BUFFERED {
            if frame.is_keyframe() {
                warn!("frame buffer at capacity, clearing for keyframe");
                self.clear();
            } else {
                warn!(frame_id = frame.frame_id, "frame buffer at capacity, dropping delta frame");
                return InsertResult::Dropped;
            }
        }

        self.emplace_frame_info(frame);
        InsertResult::Inserted
    }

    fn emplace_frame_info(&mut self, frame: FrameToDecode) {
        let frame_id = frame.frame_id;
        let mut num_missing_continuous = 0usize;
        let mut num_missing_decodable = 0usize;

        for &reference in &frame.references {
            if let Some(last_decoded) = self.last_decoded_frame_id {
                if reference <= last_decoded {
                    if !self.history.was_decoded(reference) {
                        warn!(
                            frame_id,
                            reference, "references a frame that was never decoded, rejecting"
                        );
                        return;
                    }
                    continue;
                }
            }

            let ref_continuous = self.frame_infos.get(&reference).map(|i| i.continuous()).unwrap_or(false);
            let ref_decodable = self.frame_infos.get(&reference).map(|i| i.decodable()).unwrap_or(false);
            if !ref_continuous {
                num_missing_continuous += 1;
            }
            if !ref_decodable {
                num_missing_decodable += 1;
            }

            self.frame_infos
                .entry(reference)
                .or_insert_with(FrameInfo::placeholder)
                .dependent_frames
                .push(frame_id);
        }

        let entry = self.frame_infos.entry(frame_id).or_insert_with(FrameInfo::placeholder);
        entry.frame = Some(frame);
        entry.num_missing_continuous = num_missing_continuous;
        entry.num_missing_decodable = num_missing_decodable;

        if num_missing_continuous == 0 {
            self.propagate_continuity(frame_id);
        }
    }

    fn propagate_continuity(&mut self, frame_id: i64) {
        let mut queue = vec![frame_id];
        while let Some(id) = queue.pop() {
            if self.last_continuous_frame_id.map(|last| id > last).unwrap_or(true) {
                self.last_continuous_frame_id = Some(id);
            }

            let dependents = self
                .frame_infos
                .get(&id)
                .map(|info| info.dependent_frames.clone())
                .unwrap_or_default();

            for dep_id in dependents {
                if let Some(dep) = self.frame_infos.get_mut(&dep_id) {
                    if dep.num_missing_continuous > 0 {
                        dep.num_missing_continuous -= 1;
                        if dep.num_missing_continuous == 0 && dep.frame.is_some() {
                            queue.push(dep_id);
                        }
                    }
                }
            }
        }
    }

    fn propagate_decodability(&mut self, frame_id: i64) {
        let mut queue = vec![frame_id];
        while let Some(id) = queue.pop() {
            let dependents = self
                .frame_infos
                .get(&id)
                .map(|info| info.dependent_frames.clone())
                .unwrap_or_default();

            for dep_id in dependents {
                if let Some(dep) = self.frame_infos.get_mut(&dep_id) {
                    if dep.num_missing_decodable > 0 {
                        dep.num_missing_decodable -= 1;
                        if dep.num_missing_decodable == 0 && dep.frame.is_some() {
                            queue.push(dep_id);
                        }
                    }
                }
            }
        }
    }

    pub fn require_keyframe(&mut self) {
        self.keyframe_required = true;
    }

    /// Scans continuous, decodable frames in id order and returns the
    /// earliest one along with how long the caller should wait before
    /// dispatching it. A `wait_ms` within [`MAX_ALLOWED_FRAME_DELAY_MS`] of
    /// zero (including negative, i.e. already overdue) means "dispatch
    /// now"; a larger positive `wait_ms` means "schedule a re-check then".
    /// Returns `None` only when nothing is decodable yet.
    pub fn find_next_decodable_frame(&mut self, timing: &mut Timing, now_ms: i64) -> Option<(i64, i64)> {
        let last_continuous = self.last_continuous_frame_id?;

        let candidate_ids: Vec<i64> = self
            .frame_infos
            .range(..=last_continuous)
            .filter(|(_, info)| info.frame.is_some())
            .map(|(&id, _)| id)
            .collect();

        for id in candidate_ids {
            let info = self.frame_infos.get(&id).unwrap();
            if !info.decodable() {
                continue;
            }
            let frame = info.frame.as_ref().unwrap();
            if self.keyframe_required && !frame.is_keyframe() {
                continue;
            }
            if let Some(last_ts) = self.last_decoded_frame_timestamp {
                if !ts32::ahead_of(frame.timestamp, last_ts) && frame.timestamp != last_ts {
                    continue;
                }
            }

            let render_time_ms = timing.render_time_ms(frame.timestamp, now_ms);
            let wait_ms = timing.max_wait_before_decode(render_time_ms, now_ms);
            return Some((id, wait_ms));
        }
        None
    }

    fn valid_render_timing(render_time_ms: i64, now_ms: i64, target_delay_ms: i64) -> bool {
        if render_time_ms == 0 {
            return true;
        }
        if render_time_ms < 0 {
            return false;
        }
        if (render_time_ms - now_ms).abs() as i64 > MAX_VIDEO_DELAY_MS {
            return false;
        }
        target_delay_ms <= MAX_VIDEO_DELAY_MS
    }

    /// Dispatches the frame at `frame_id` (and any buffered frames sharing
    /// its timestamp), recording it as decoded and propagating decodability
    /// to its dependents. Unless `nack_delayed` (the frame's delivery was
    /// already explained by a NACK round-trip), feeds the batch's arrival
    /// delay into `inter_frame_delay`/`jitter_estimator` and folds the
    /// updated jitter estimate back into `timing`.
    #[allow(clippy::too_many_arguments)]
    pub fn deliver_frame(
        &mut self,
        frame_id: i64,
        timing: &mut Timing,
        inter_frame_delay: &mut InterFrameDelay,
        jitter_estimator: &mut JitterEstimator,
        now_ms: i64,
        nack_delayed: bool,
    ) -> Vec<DecodableFrame> {
        let mut render_time_ms = timing.render_time_ms(
            self.frame_infos.get(&frame_id).and_then(|i| i.frame.as_ref()).map(|f| f.timestamp).unwrap_or(0),
            now_ms,
        );

        if !Self::valid_render_timing(render_time_ms, now_ms, timing.target_delay_ms()) {
            warn!(frame_id, render_time_ms, "invalid render timing, resetting timing state");
            timing.reset(now_ms);
            render_time_ms = timing.render_time_ms(
                self.frame_infos.get(&frame_id).and_then(|i| i.frame.as_ref()).map(|f| f.timestamp).unwrap_or(0),
                now_ms,
            );
        }

        let target_timestamp = self
            .frame_infos
            .get(&frame_id)
            .and_then(|i| i.frame.as_ref())
            .map(|f| f.timestamp);

        let mut batch_ids: Vec<i64> = self
            .frame_infos
            .range(..=frame_id)
            .filter(|(_, info)| {
                info.frame.as_ref().map(|f| Some(f.timestamp) == target_timestamp).unwrap_or(false)
            })
            .map(|(&id, _)| id)
            .collect();
        batch_ids.sort_unstable();

        let mut out = Vec::with_capacity(batch_ids.len());
        let mut batch_size_bytes = 0u32;
        let mut batch_max_arrival_ms = now_ms;
        for id in &batch_ids {
            if let Some(info) = self.frame_infos.get_mut(id) {
                if let Some(frame) = info.frame.take() {
                    if frame.is_keyframe() {
                        self.keyframe_required = false;
                    }
                    batch_size_bytes += frame.payload.len() as u32;
                    batch_max_arrival_ms = batch_max_arrival_ms.max(frame.max_arrival_time_ms);
                    out.push(DecodableFrame { frame, render_time_ms });
                }
            }
            self.propagate_decodability(*id);
        }

        if let Some(&last_id) = batch_ids.last() {
            self.last_decoded_frame_id = Some(last_id);
            if let Some(ts) = target_timestamp {
                self.last_decoded_frame_timestamp = Some(ts);
                self.history.insert_frame(last_id, ts);

                if !nack_delayed && batch_size_bytes > 0 {
                    if let Some(delay_ms) = inter_frame_delay.calculate_delay(ts, batch_max_arrival_ms) {
                        jitter_estimator.update_estimate(delay_ms as f64, batch_size_bytes);
                        timing.set_jitter_delay_ms(jitter_estimator.get_jitter_estimate_ms(1.0));
                        timing.update_current_delay(ts);
                    }
                }
            }
            let cutoff = last_id;
            self.frame_infos.retain(|&id, _| id > cutoff);
        }

        out
    }

    pub fn last_continuous_frame_id(&self) -> Option<i64> {
        self.last_continuous_frame_id
    }

    pub fn last_decoded_frame_id(&self) -> Option<i64> {
        self.last_decoded_frame_id
    }

    pub fn num_buffered_frames(&self) -> usize {
        self.frame_infos.values().filter(|i| i.frame.is_some()).count()
    }

    /// Whether a `wait_ms` from [`FrameBuffer::find_next_decodable_frame`]
    /// means "dispatch now" rather than "schedule a re-check".
    pub fn is_ready_to_dispatch(wait_ms: i64) -> bool {
        wait_ms <= MAX_ALLOWED_FRAME_DELAY_MS
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CowBuffer;
    use crate::packet_buffer::FrameType;

    fn frame(id: i64, refs: Vec<i64>, ts: u32, frame_type: FrameType) -> FrameToDecode {
        FrameToDecode {
            frame_id: id,
            frame_type,
            references: refs,
            timestamp: ts,
            seq_num_start: id as u16,
            seq_num_end: id as u16,
            min_arrival_time_ms: 0,
            max_arrival_time_ms: 0,
            times_nacked: 0,
            payload: CowBuffer::from_slice(&[0x01]),
            render_time_ms: None,
        }
    }

    #[test]
    fn keyframe_is_immediately_continuous() {
        let mut buf = FrameBuffer::new();
        let res = buf.insert_frame(frame(0, vec![], 0, FrameType::Key));
        assert_eq!(res, InsertResult::Inserted);
        assert_eq!(buf.last_continuous_frame_id(), Some(0));
    }

    #[test]
    fn delta_frame_is_continuous_once_its_reference_arrives() {
        let mut buf = FrameBuffer::new();
        buf.insert_frame(frame(0, vec![], 0, FrameType::Key));
        buf.insert_frame(frame(1, vec![0], 3000, FrameType::Delta));
        assert_eq!(buf.last_continuous_frame_id(), Some(1));
    }

    #[test]
    fn delta_frame_ahead_of_its_reference_waits_until_propagation() {
        let mut buf = FrameBuffer::new();
        // Frame 1 arrives before frame 0 (its sole reference).
        buf.insert_frame(frame(1, vec![0], 3000, FrameType::Delta));
        assert_eq!(buf.last_continuous_frame_id(), None);
        buf.insert_frame(frame(0, vec![], 0, FrameType::Key));
        assert_eq!(buf.last_continuous_frame_id(), Some(1));
    }

    #[test]
    fn invalid_self_or_forward_reference_is_rejected() {
        let mut buf = FrameBuffer::new();
        let res = buf.insert_frame(frame(0, vec![5], 0, FrameType::Delta));
        assert_eq!(res, InsertResult::InvalidReferences);
    }

    #[test]
    fn dispatch_marks_frame_decoded_and_propagates_decodability() {
        let mut buf = FrameBuffer::new();
        let mut timing = Timing::new(0);
        timing.set_min_playout_delay(0);
        timing.set_max_playout_delay(0);

        buf.insert_frame(frame(0, vec![], 0, FrameType::Key));
        buf.insert_frame(frame(1, vec![0], 3000, FrameType::Delta));

        let mut inter_frame_delay = InterFrameDelay::new();
        let mut jitter_estimator = JitterEstimator::new();

        let (id, _wait) = buf.find_next_decodable_frame(&mut timing, 0).expect("keyframe ready");
        assert_eq!(id, 0);
        let delivered = buf.deliver_frame(id, &mut timing, &mut inter_frame_delay, &mut jitter_estimator, 0, false);
        assert_eq!(delivered.len(), 1);
        assert_eq!(buf.last_decoded_frame_id(), Some(0));

        let (id, _wait) = buf.find_next_decodable_frame(&mut timing, 1).expect("delta ready");
        assert_eq!(id, 1);
    }

    #[test]
    fn codec_reset_clears_buffer_and_restarts() {
        let mut buf = FrameBuffer::new();
        let mut timing = Timing::new(0);
        timing.set_min_playout_delay(0);
        timing.set_max_playout_delay(0);
        let mut inter_frame_delay = InterFrameDelay::new();
        let mut jitter_estimator = JitterEstimator::new();

        buf.insert_frame(frame(0, vec![], 0, FrameType::Key));
        buf.deliver_frame(0, &mut timing, &mut inter_frame_delay, &mut jitter_estimator, 0, false);

        // Same/lower frame_id but a forward timestamp jump and a keyframe:
        // the encoder restarted its picture-id counter.
        let res = buf.insert_frame(frame(0, vec![], 90_000, FrameType::Key));
        assert_eq!(res, InsertResult::CodecReset);
    }

    #[test]
    fn buffer_at_capacity_drops_delta_frames() {
        let mut buf = FrameBuffer::new();
        buf.insert_frame(frame(0, vec![], 0, FrameType::Key));
        for i in 1..MAX_FRAMES_BUFFERED as i64 {
            buf.insert_frame(frame(i, vec![i - 1], i as u32 * 3000, FrameType::Delta));
        }
        let res = buf.insert_frame(frame(
            MAX_FRAMES_BUFFERED as i64,
            vec![MAX_FRAMES_BUFFERED as i64 - 1],
            MAX_FRAMES_BUFFERED as u32 * 3000,
            FrameType::Delta,
        ));
        assert_eq!(res, InsertResult::Dropped);
    }
}
