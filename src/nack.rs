//! NACK-based retransmission scheduling (spec.md §4.4).
//!
//! Grounded on `nack_module_impl.hpp`'s `NackInfo`/`nack_list` design: an
//! ordered map of outstanding sequence numbers, RTT-gated resend pacing,
//! and an overflow rule keyed off recently-seen keyframe packets.

use std::collections::{BTreeMap, VecDeque};

use tracing::{info, warn};

const DEFAULT_RTT_MS: i64 = 100;
const MAX_KEYFRAME_TRACKING: usize = 8;

#[derive(Debug, Clone)]
pub struct NackInfo {
    pub seq_num: u16,
    pub created_time_ms: i64,
    pub sent_time_ms: Option<i64>,
    pub retries: usize,
}

#[derive(Debug, Default)]
pub struct NackSendResult {
    pub nack_list: Vec<u16>,
    pub keyframe_requested: bool,
}

pub struct NackModule {
    nack_list: BTreeMap<u16, NackInfo>,
    newest_seq_num: Option<u16>,
    keyframe_seq_nums: VecDeque<u16>,
    recovered_seq_nums: VecDeque<u16>,
    rtt_ms: i64,
    send_nack_delay_ms: i64,
    max_nack_list_size: usize,
    max_retries: usize,
}

impl NackModule {
    pub fn new(send_nack_delay_ms: i64, max_nack_list_size: usize, max_retries: usize) -> Self {
        Self {
            nack_list: BTreeMap::new(),
            newest_seq_num: None,
            keyframe_seq_nums: VecDeque::with_capacity(MAX_KEYFRAME_TRACKING),
            recovered_seq_nums: VecDeque::with_capacity(MAX_KEYFRAME_TRACKING),
            rtt_ms: DEFAULT_RTT_MS,
            send_nack_delay_ms,
            max_nack_list_size,
            max_retries,
        }
    }

    pub fn update_rtt(&mut self, rtt_ms: i64) {
        self.rtt_ms = rtt_ms.max(1);
    }

    /// Registers an arriving packet. Returns `true` if the buffer had to
    /// clear and a keyframe should be requested.
    pub fn insert_packet(
        &mut self,
        seq_num: u16,
        is_keyframe: bool,
        is_recovered: bool,
        now_ms: i64,
    ) -> bool {
        if is_keyframe {
            self.keyframe_seq_nums.push_back(seq_num);
            if self.keyframe_seq_nums.len() > MAX_KEYFRAME_TRACKING {
                self.keyframe_seq_nums.pop_front();
            }
        }
        if is_recovered {
            self.recovered_seq_nums.push_back(seq_num);
            if self.recovered_seq_nums.len() > MAX_KEYFRAME_TRACKING {
                self.recovered_seq_nums.pop_front();
            }
        }

        let Some(newest) = self.newest_seq_num else {
            self.newest_seq_num = Some(seq_num);
            return false;
        };

        if !crate::numerics::ahead_of(seq_num, newest) {
            // Late or duplicate: if it was outstanding, it's resolved now.
            self.nack_list.remove(&seq_num);
            return false;
        }

        let mut s = newest.wrapping_add(1);
        while s != seq_num {
            self.nack_list.insert(
                s,
                NackInfo {
                    seq_num: s,
                    created_time_ms: now_ms,
                    sent_time_ms: None,
                    retries: 0,
                },
            );
            s = s.wrapping_add(1);
        }
        self.newest_seq_num = Some(seq_num);

        self.enforce_capacity()
    }

    fn enforce_capacity(&mut self) -> bool {
        let oldest_keyframe = self.keyframe_seq_nums.front().copied();
        let cap = self.max_nack_list_size + self.keyframe_seq_nums.len();
        if self.nack_list.len() <= cap {
            return false;
        }

        if let Some(oldest_kf) = oldest_keyframe {
            self.nack_list.retain(|&seq, _| !crate::numerics::ahead_of(oldest_kf, seq));
        }

        if self.nack_list.len() > cap {
            warn!(
                size = self.nack_list.len(),
                "nack list overflow past keyframe horizon; requesting keyframe"
            );
            self.nack_list.clear();
            return true;
        }
        false
    }

    /// Called periodically (every ~20 ms). Returns the sequence numbers to
    /// (re)send a NACK for right now, bumping their retry counters.
    pub fn nack_list_on_rtt_passed(&mut self, now_ms: i64) -> Vec<u16> {
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        for info in self.nack_list.values_mut() {
            let should_send = match info.sent_time_ms {
                None => info.created_time_ms + self.send_nack_delay_ms <= now_ms,
                Some(sent) => sent + self.rtt_ms <= now_ms,
            };
            if !should_send {
                continue;
            }
            info.retries += 1;
            if info.retries > self.max_retries {
                exhausted.push(info.seq_num);
                continue;
            }
            info.sent_time_ms = Some(now_ms);
            due.push(info.seq_num);
        }

        for seq in exhausted {
            info!(seq_num = seq, "dropping NACK entry after max retries");
            self.nack_list.remove(&seq);
        }

        due
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &NackInfo> {
        self.nack_list.values()
    }

    pub fn len(&self) -> usize {
        self.nack_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nack_list.is_empty()
    }
}
