//! Sequence-number variant frame reference finder (spec.md §4.6).
//!
//! Assigns monotonic `frame_id`s to AssembledFrames and resolves each
//! delta frame's single reference to the tip of its GOP. Grounded on
//! the GOP-tracking scheme in `frame_ref_finder_seq_num.hpp`: a keyframe
//! opens a `GopInfo` keyed by its own picture id, and every subsequent
//! delta frame in that GOP both references and becomes the new tip.

use std::collections::BTreeMap;

use tracing::debug;

use crate::frame::FrameToDecode;
use crate::numerics::unwrap::SeqNumUnwrapper;
use crate::numerics::{ahead_of, forward_diff};
use crate::packet_buffer::{AssembledFrame, FrameType};

#[derive(Debug, Clone, Copy)]
struct GopInfo {
    last_picture_id_in_gop: i64,
    last_picture_id_with_padding_in_gop: i64,
}

pub struct FrameRefFinder {
    unwrapper: SeqNumUnwrapper,
    gop_infos: BTreeMap<i64, GopInfo>,
    stashed: Vec<AssembledFrame>,
    epoch_offset: i64,
    last_picture_id: Option<i64>,
}

impl FrameRefFinder {
    pub fn new() -> Self {
        Self {
            unwrapper: SeqNumUnwrapper::new(),
            gop_infos: BTreeMap::new(),
            stashed: Vec::new(),
            epoch_offset: 0,
            last_picture_id: None,
        }
    }

    /// The raw (pre-epoch-offset) picture id of the last frame assigned an
    /// id, used by a caller that detects a codec reset to compute the next
    /// epoch's starting offset (`last_completed_picture_id + 0xFFFF + 1`).
    pub fn last_picture_id(&self) -> Option<i64> {
        self.last_picture_id
    }

    /// Starts a fresh frame_id epoch and clears all GOP tracking. Used on
    /// a detected codec reset (spec.md §3(f), §4.7 step 3).
    pub fn reset_with_offset(&mut self, offset: i64) {
        self.epoch_offset = offset;
        self.gop_infos.clear();
        self.stashed.clear();
        self.unwrapper = SeqNumUnwrapper::new();
    }

    /// Feeds one AssembledFrame through reference resolution. `missing`
    /// reports whether a given raw sequence number is currently absent
    /// from the packet buffer (used to decide whether a delta frame's
    /// predecessor gap has actually been filled, ignoring padding).
    pub fn insert_frame(
        &mut self,
        frame: AssembledFrame,
        missing: &impl Fn(u16) -> bool,
    ) -> Vec<FrameToDecode> {
        let mut ready = self.try_insert(frame, missing);
        if !ready.is_empty() {
            ready.extend(self.retry_stashed(missing));
        }
        ready
    }

    fn try_insert(&mut self, frame: AssembledFrame, missing: &impl Fn(u16) -> bool) -> Vec<FrameToDecode> {
        let picture_id = self.unwrapper.unwrap(frame.seq_num_end as u64, true);

        if frame.frame_type == FrameType::Key {
            self.gop_infos.insert(
                picture_id,
                GopInfo {
                    last_picture_id_in_gop: picture_id,
                    last_picture_id_with_padding_in_gop: picture_id,
                },
            );
            self.last_picture_id = Some(picture_id);
            return vec![self.finish(frame, picture_id, Vec::new())];
        }

        match self.find_gop_for(picture_id, &frame, missing) {
            Some((gop_key, reference)) => {
                let frame_id = picture_id;
                let gop = self.gop_infos.get_mut(&gop_key).unwrap();
                gop.last_picture_id_in_gop = frame_id;
                gop.last_picture_id_with_padding_in_gop = frame_id;
                self.last_picture_id = Some(frame_id);
                vec![self.finish(frame, frame_id, vec![reference])]
            }
            None => {
                debug!(picture_id, "stashing delta frame pending GOP resolution");
                self.stashed.push(frame);
                Vec::new()
            }
        }
    }

    /// Finds the GOP whose keyframe precedes `picture_id` and whose tip-to
    /// -frame gap (exclusive of the tip, inclusive of the frame start) is
    /// entirely present or known padding. Returns `(gop_key, reference)`.
    fn find_gop_for(
        &self,
        picture_id: i64,
        frame: &AssembledFrame,
        missing: &impl Fn(u16) -> bool,
    ) -> Option<(i64, i64)> {
        let (&gop_key, gop) = self.gop_infos.range(..=picture_id).next_back()?;

        let tip_seq = (gop.last_picture_id_with_padding_in_gop & 0xFFFF) as u16;
        if forward_diff(tip_seq, frame.seq_num_start) > 0 {
            let mut cursor = tip_seq.wrapping_add(1);
            while cursor != frame.seq_num_start {
                if missing(cursor) {
                    return None;
                }
                cursor = cursor.wrapping_add(1);
            }
        }

        Some((gop_key, gop.last_picture_id_in_gop))
    }

    fn finish(&self, frame: AssembledFrame, frame_id: i64, references: Vec<i64>) -> FrameToDecode {
        FrameToDecode {
            frame_id: frame_id + self.epoch_offset,
            frame_type: frame.frame_type,
            references: references.into_iter().map(|r| r + self.epoch_offset).collect(),
            timestamp: frame.timestamp,
            seq_num_start: frame.seq_num_start,
            seq_num_end: frame.seq_num_end,
            min_arrival_time_ms: frame.min_arrival_time_ms,
            max_arrival_time_ms: frame.max_arrival_time_ms,
            times_nacked: frame.times_nacked,
            payload: frame.payload,
            render_time_ms: None,
        }
    }

    fn retry_stashed(&mut self, missing: &impl Fn(u16) -> bool) -> Vec<FrameToDecode> {
        let mut out = Vec::new();
        loop {
            let mut progressed = false;
            let pending = std::mem::take(&mut self.stashed);
            for frame in pending {
                let mut probe = self.unwrapper.clone();
                let picture_id = probe.unwrap(frame.seq_num_end as u64, false);
                if self.find_gop_for(picture_id, &frame, missing).is_some() {
                    out.extend(self.try_insert(frame, missing));
                    progressed = true;
                } else {
                    self.stashed.push(frame);
                }
            }
            if !progressed {
                break;
            }
        }
        out
    }

    /// Extends the padding-aware GOP tip so later frames can resolve past
    /// a padding-only sequence number (spec.md §9 open question c).
    pub fn insert_padding(&mut self, seq_num: u16) {
        let padding_id = {
            let mut probe = self.unwrapper.clone();
            probe.unwrap(seq_num as u64, false)
        };
        if let Some((_, gop)) = self
            .gop_infos
            .range_mut(..=padding_id)
            .next_back()
        {
            if padding_id > gop.last_picture_id_with_padding_in_gop {
                gop.last_picture_id_with_padding_in_gop = padding_id;
            }
        }
    }

    pub fn clear_to(&mut self, seq_num: u16) {
        let cutoff = {
            let mut probe = self.unwrapper.clone();
            probe.unwrap(seq_num as u64, false)
        };
        self.gop_infos.retain(|&id, _| id > cutoff);
        self.stashed.retain(|f| ahead_of(f.seq_num_end, seq_num));
    }
}

impl Default for FrameRefFinder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CowBuffer;

    fn frame(seq_start: u16, seq_end: u16, ts: u32, frame_type: FrameType) -> AssembledFrame {
        AssembledFrame {
            seq_num_start: seq_start,
            seq_num_end: seq_end,
            timestamp: ts,
            frame_type,
            payload: CowBuffer::from_slice(&[0xAB]),
            min_arrival_time_ms: 0,
            max_arrival_time_ms: 0,
            times_nacked: 0,
        }
    }

    fn none_missing(_: u16) -> bool {
        false
    }

    #[test]
    fn keyframe_emits_with_no_references() {
        let mut finder = FrameRefFinder::new();
        let out = finder.insert_frame(frame(100, 100, 9000, FrameType::Key), &none_missing);
        assert_eq!(out.len(), 1);
        assert!(out[0].references.is_empty());
        assert_eq!(out[0].frame_id, 100);
    }

    #[test]
    fn delta_frame_references_gop_tip() {
        let mut finder = FrameRefFinder::new();
        finder.insert_frame(frame(100, 100, 9000, FrameType::Key), &none_missing);
        let out = finder.insert_frame(frame(101, 101, 9003, FrameType::Delta), &none_missing);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].references, vec![100]);
        assert_eq!(out[0].frame_id, 101);
    }

    #[test]
    fn delta_frame_with_gap_is_stashed_then_resolved() {
        let mut finder = FrameRefFinder::new();
        finder.insert_frame(frame(100, 100, 9000, FrameType::Key), &none_missing);

        let missing_102 = |s: u16| s == 102;
        let out = finder.insert_frame(frame(103, 103, 9009, FrameType::Delta), &missing_102);
        assert!(out.is_empty(), "gap at 102 should stash the frame");

        // 102 fills in (e.g. as padding or a recovered frame's own packet);
        // a fresh insert_frame call with a clear `missing` retries the stash.
        let out = finder.insert_frame(frame(101, 101, 9003, FrameType::Delta), &none_missing);
        assert_eq!(out.len(), 2, "both 101 and the retried 103 should resolve");
    }

    #[test]
    fn chained_delta_frames_extend_the_gop_tip() {
        let mut finder = FrameRefFinder::new();
        finder.insert_frame(frame(0, 0, 0, FrameType::Key), &none_missing);
        finder.insert_frame(frame(1, 1, 3, FrameType::Delta), &none_missing);
        let out = finder.insert_frame(frame(2, 2, 6, FrameType::Delta), &none_missing);
        assert_eq!(out[0].references, vec![1]);
    }
}
