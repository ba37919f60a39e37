// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Timestamp-driven delivery: a 128-bin timing wheel.
//!
//! Two instances exist per process, one running on local time and one
//! on global time. A message with timestamp `t` lives in bin
//! `floor(t / bin width) mod 128`; within a bin messages stay sorted by
//! timestamp, equal timestamps in arrival order. A sweep visits the
//! bins between the previous position and `now`, clamped to one full
//! turn of the wheel so a large clock jump stays bounded per tick.

use crate::config::{SCHED_BIN_SECONDS, SCHED_TABLE_LEN};
use crate::msg::Message;

/// One timing wheel.
#[derive(Debug)]
pub struct Scheduler {
    bins: Vec<Vec<Message>>,
    /// Absolute bin number the last sweep finished on.
    last_bin: i64,
    /// Clock value of the last sweep.
    last_time: f64,
    pending: usize,
}

impl Scheduler {
    /// Create a wheel positioned at clock value `now`.
    #[must_use]
    pub fn new(now: f64) -> Self {
        Self {
            bins: (0..SCHED_TABLE_LEN).map(|_| Vec::new()).collect(),
            last_bin: abs_bin(now),
            last_time: now,
            pending: 0,
        }
    }

    /// Clock value of the last sweep.
    #[must_use]
    pub fn last_time(&self) -> f64 {
        self.last_time
    }

    /// Messages currently waiting in the wheel.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Reposition an idle wheel (used when global time first becomes
    /// defined). Pending messages keep their bins.
    pub fn reposition(&mut self, now: f64) {
        self.last_bin = abs_bin(now);
        self.last_time = now;
    }

    /// File a message under its timestamp.
    ///
    /// Timestamps at or before the wheel's position land in the current
    /// bin and pop on the next sweep; the caller normally dispatches
    /// those directly instead of scheduling them.
    pub fn insert(&mut self, msg: Message) {
        let bin = abs_bin(msg.timestamp()).max(self.last_bin);
        let idx = wheel_index(bin);
        let at = self.bins[idx].partition_point(|m| m.timestamp() <= msg.timestamp());
        self.bins[idx].insert(at, msg);
        self.pending += 1;
    }

    /// Advance to `now`, appending every due message to `due` in
    /// timestamp order (arrival order among equals).
    pub fn sweep(&mut self, now: f64, due: &mut Vec<Message>) {
        if now < self.last_time {
            return;
        }
        let target = abs_bin(now);
        let first = self.last_bin;
        // Clamp to one full turn; visiting every bin once already
        // covers all residues.
        let last = target.min(first + SCHED_TABLE_LEN as i64 - 1);
        let start = due.len();
        for bin in first..=last {
            let slot = &mut self.bins[wheel_index(bin)];
            let cut = slot.partition_point(|m| m.timestamp() <= now);
            if cut > 0 {
                self.pending -= cut;
                due.extend(slot.drain(..cut));
            }
        }
        // Bins visited across more than one turn can interleave turns;
        // a stable sort restores timestamp order and keeps arrival
        // order among equal timestamps (equals share a bin).
        due[start..].sort_by(|a, b| {
            a.timestamp()
                .partial_cmp(&b.timestamp())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.last_bin = target;
        self.last_time = now;
    }

    /// Discard everything still pending (teardown).
    pub fn clear(&mut self) {
        for bin in &mut self.bins {
            bin.clear();
        }
        self.pending = 0;
    }
}

fn abs_bin(t: f64) -> i64 {
    (t / SCHED_BIN_SECONDS).floor() as i64
}

fn wheel_index(bin: i64) -> usize {
    bin.rem_euclid(SCHED_TABLE_LEN as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::codec::encode_message;
    use crate::msg::ArgView;

    fn msg_at(t: f64, n: i32) -> Message {
        encode_message(t, "/t/x", &[ArgView::Int32(n)]).expect("encode")
    }

    fn first_arg(m: &Message) -> i32 {
        m.extract().next_value().and_then(|a| a.i32()).expect("i32")
    }

    #[test]
    fn test_due_messages_pop_in_timestamp_order() {
        let mut s = Scheduler::new(0.0);
        for (t, n) in [(0.5, 1), (0.2, 2), (0.9, 3), (0.2, 4)] {
            s.insert(msg_at(t, n));
        }
        assert_eq!(s.pending(), 4);
        let mut due = Vec::new();
        s.sweep(1.0, &mut due);
        let order: Vec<i32> = due.iter().map(first_arg).collect();
        // Timestamp order; 2 before 4 because 2 arrived first at t=0.2.
        assert_eq!(order, [2, 4, 1, 3]);
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn test_future_messages_wait() {
        let mut s = Scheduler::new(0.0);
        s.insert(msg_at(5.0, 1));
        let mut due = Vec::new();
        s.sweep(4.99, &mut due);
        assert!(due.is_empty());
        s.sweep(5.0, &mut due);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_same_index_different_turns() {
        // 0.01 and 0.01 + 1.28 share a wheel index; only the first is
        // due inside the first turn.
        let mut s = Scheduler::new(0.0);
        let turn = SCHED_TABLE_LEN as f64 * SCHED_BIN_SECONDS;
        s.insert(msg_at(0.015, 1));
        s.insert(msg_at(0.015 + turn, 2));
        let mut due = Vec::new();
        s.sweep(0.5, &mut due);
        assert_eq!(due.iter().map(first_arg).collect::<Vec<_>>(), [1]);
        s.sweep(0.5 + turn, &mut due);
        assert_eq!(due.iter().map(first_arg).collect::<Vec<_>>(), [1, 2]);
    }

    #[test]
    fn test_large_jump_clamps_but_delivers() {
        let mut s = Scheduler::new(0.0);
        for n in 0..50 {
            s.insert(msg_at(f64::from(n) * 0.37, n));
        }
        let mut due = Vec::new();
        // One sweep far past everything: a single full turn visits all
        // 128 bins and must deliver all 50 in order.
        s.sweep(1000.0, &mut due);
        assert_eq!(due.len(), 50);
        let order: Vec<i32> = due.iter().map(first_arg).collect();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted);
    }

    #[test]
    fn test_insert_in_the_past_pops_next_sweep() {
        let mut s = Scheduler::new(10.0);
        s.insert(msg_at(3.0, 1)); // stale timestamp
        let mut due = Vec::new();
        s.sweep(10.01, &mut due);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_clear_empties_wheel() {
        let mut s = Scheduler::new(0.0);
        s.insert(msg_at(1.0, 1));
        s.insert(msg_at(2.0, 2));
        s.clear();
        assert_eq!(s.pending(), 0);
        let mut due = Vec::new();
        s.sweep(10.0, &mut due);
        assert!(due.is_empty());
    }
}
