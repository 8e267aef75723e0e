//! Ring of decoded frame ids/timestamps, for `WasDecoded`-style reference
//! queries. Grounded on `decoded_frames_history.cpp`: a fixed-size
//! `Vec<bool>` indexed by `frame_id % window_size`, cleared incrementally
//! as the window slides so stale `true` bits never alias a reused index.

pub const DEFAULT_WINDOW_SIZE: usize = 8192;

pub struct DecodedFramesHistory {
    window_size: usize,
    buffer: Vec<bool>,
    last_frame_id: Option<i64>,
    last_decoded_frame_id: Option<i64>,
    last_decoded_frame_timestamp: Option<u32>,
}

impl DecodedFramesHistory {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            buffer: vec![false; window_size],
            last_frame_id: None,
            last_decoded_frame_id: None,
            last_decoded_frame_timestamp: None,
        }
    }

    pub fn last_decoded_frame_id(&self) -> Option<i64> {
        self.last_decoded_frame_id
    }

    pub fn last_decoded_frame_timestamp(&self) -> Option<u32> {
        self.last_decoded_frame_timestamp
    }

    fn frame_id_to_index(&self, frame_id: i64) -> usize {
        let m = self.window_size as i64;
        let idx = frame_id % m;
        (if idx < 0 { idx + m } else { idx }) as usize
    }

    pub fn insert_frame(&mut self, frame_id: i64, timestamp: u32) {
        self.last_decoded_frame_id = Some(frame_id);
        self.last_decoded_frame_timestamp = Some(timestamp);
        let new_index = self.frame_id_to_index(frame_id);

        if let Some(last_frame_id) = self.last_frame_id {
            let jump = frame_id - last_frame_id;
            let last_index = self.frame_id_to_index(last_frame_id);
            if jump >= self.window_size as i64 {
                self.buffer.iter_mut().for_each(|b| *b = false);
            } else if new_index > last_index {
                for b in &mut self.buffer[last_index + 1..new_index] {
                    *b = false;
                }
            } else {
                for b in &mut self.buffer[last_index + 1..] {
                    *b = false;
                }
                for b in &mut self.buffer[..new_index] {
                    *b = false;
                }
            }
        }

        self.buffer[new_index] = true;
        self.last_frame_id = Some(frame_id);
    }

    pub fn was_decoded(&self, frame_id: i64) -> bool {
        let Some(last_frame_id) = self.last_frame_id else {
            return false;
        };
        if frame_id <= last_frame_id - self.window_size as i64 {
            return false;
        }
        if frame_id > last_frame_id {
            return false;
        }
        self.buffer[self.frame_id_to_index(frame_id)]
    }

    pub fn clear(&mut self) {
        self.buffer.iter_mut().for_each(|b| *b = false);
        self.last_frame_id = None;
        self.last_decoded_frame_id = None;
        self.last_decoded_frame_timestamp = None;
    }
}

impl Default for DecodedFramesHistory {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_history_reports_nothing_decoded() {
        let history = DecodedFramesHistory::new(8);
        assert!(!history.was_decoded(0));
    }

    #[test]
    fn inserted_frame_is_reported_decoded() {
        let mut history = DecodedFramesHistory::new(8);
        history.insert_frame(3, 900);
        assert!(history.was_decoded(3));
        assert_eq!(history.last_decoded_frame_id(), Some(3));
        assert_eq!(history.last_decoded_frame_timestamp(), Some(900));
    }

    #[test]
    fn old_frame_outside_window_reports_not_decoded() {
        let mut history = DecodedFramesHistory::new(8);
        history.insert_frame(0, 0);
        history.insert_frame(10, 100);
        assert!(!history.was_decoded(0));
    }

    #[test]
    fn future_frame_reports_not_decoded() {
        let mut history = DecodedFramesHistory::new(8);
        history.insert_frame(3, 0);
        assert!(!history.was_decoded(4));
    }

    #[test]
    fn large_jump_clears_whole_window() {
        let mut history = DecodedFramesHistory::new(4);
        history.insert_frame(0, 0);
        history.insert_frame(1, 10);
        history.insert_frame(100, 1000);
        assert!(!history.was_decoded(1));
        assert!(history.was_decoded(100));
    }

    #[test]
    fn clear_resets_everything() {
        let mut history = DecodedFramesHistory::new(8);
        history.insert_frame(1, 0);
        history.clear();
        assert!(!history.was_decoded(1));
        assert_eq!(history.last_decoded_frame_id(), None);
    }
}
