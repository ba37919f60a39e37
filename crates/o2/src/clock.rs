// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Clock subsystem: local time, master election, round-trip
//! estimation, and the disciplined global-time mapping.
//!
//! Local time comes from an injectable [`TimeSource`]; the default
//! counts seconds from initialization. A process that installs a clock
//! reference becomes a master candidate; among the candidates visible
//! in the mesh, the lowest peer id wins. Everyone else probes the
//! master over UDP, keeps the last few round trips, adopts the offset
//! of the minimum-RTT sample, and slews toward it at a bounded rate so
//! global time stays monotone and smooth.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::{
    CLOCK_SKEW_RATE, CLOCK_SYNC_HISTORY_LEN, CLOCK_SYNC_PERIOD, CLOCK_SYNC_PERIOD_INITIAL,
};

/// A seconds-valued, monotonically non-decreasing time reference.
pub trait TimeSource {
    /// Current time in seconds.
    fn now(&mut self) -> f64;
}

/// Default time source: seconds since construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl TimeSource for MonotonicClock {
    fn now(&mut self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// An installed clock reference, offset at install time so global time
/// continues smoothly from local time.
struct Reference {
    source: Box<dyn TimeSource>,
    offset: f64,
}

/// One round-trip measurement.
#[derive(Debug, Clone, Copy)]
struct Sample {
    rtt: f64,
    offset: f64,
}

/// Full clock state of one process.
pub struct Clock {
    local: Box<dyn TimeSource>,
    reference: Option<Reference>,
    candidate: bool,
    master_id: Option<String>,
    is_master: bool,
    synced: bool,
    skew: f64,
    target: f64,
    samples: VecDeque<Sample>,
    next_probe: f64,
    serial: i32,
    outstanding: Option<(i32, f64)>,
    last_slew: f64,
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("candidate", &self.candidate)
            .field("master_id", &self.master_id)
            .field("is_master", &self.is_master)
            .field("synced", &self.synced)
            .field("skew", &self.skew)
            .field("samples", &self.samples.len())
            .finish_non_exhaustive()
    }
}

impl Clock {
    /// Create with the given local time source.
    #[must_use]
    pub fn new(local: Box<dyn TimeSource>) -> Self {
        Self {
            local,
            reference: None,
            candidate: false,
            master_id: None,
            is_master: false,
            synced: false,
            skew: 0.0,
            target: 0.0,
            samples: VecDeque::with_capacity(CLOCK_SYNC_HISTORY_LEN),
            next_probe: 0.0,
            serial: 0,
            outstanding: None,
            last_slew: 0.0,
        }
    }

    /// Current local time.
    pub fn local_time(&mut self) -> f64 {
        self.local.now()
    }

    /// Install a clock reference, making this process a master
    /// candidate. With `None` the local clock itself is the reference.
    ///
    /// The reference is offset at install time so that, if elected,
    /// this process's global time starts equal to its local time and
    /// advances at the reference's rate.
    pub fn install_reference(&mut self, source: Option<Box<dyn TimeSource>>) {
        let local_now = self.local.now();
        self.candidate = true;
        self.reference = source.map(|mut s| {
            let offset = local_now - s.now();
            Reference { source: s, offset }
        });
        log::info!("[clock] clock reference installed; now a master candidate");
    }

    /// Whether this process offers a clock reference.
    #[must_use]
    pub fn is_candidate(&self) -> bool {
        self.candidate
    }

    /// Whether this process won the election.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// The elected master's peer id, if any candidate is known.
    #[must_use]
    pub fn master_id(&self) -> Option<&str> {
        self.master_id.as_deref()
    }

    /// Whether global time is defined here.
    #[must_use]
    pub fn synced(&self) -> bool {
        self.is_master || self.synced
    }

    /// The master-side time: the installed reference, or local time
    /// when none was given.
    pub fn master_time(&mut self) -> f64 {
        match &mut self.reference {
            Some(r) => r.source.now() + r.offset,
            None => self.local.now(),
        }
    }

    /// Global time, or `None` until the first successful sync (the C
    /// API's `-1`). The master's global time is its reference time.
    pub fn global_time(&mut self) -> Option<f64> {
        if self.is_master {
            Some(self.master_time())
        } else if self.synced {
            Some(self.local.now() + self.skew)
        } else {
            None
        }
    }

    /// Adopt the election result: `winner` is the lowest candidate id
    /// visible (ours included), or `None` when no candidate exists.
    pub fn elect(&mut self, winner: Option<&str>, self_id: &str) {
        let new_master = winner.map(str::to_string);
        if new_master == self.master_id {
            return;
        }
        log::info!(
            "[clock] master changed: {:?} -> {:?}",
            self.master_id,
            new_master
        );
        self.master_id = new_master;
        self.is_master = self.candidate && self.master_id.as_deref() == Some(self_id);
        // A new probe target invalidates the sample ring; sync state is
        // kept so global time keeps flowing and slews to the new master.
        self.samples.clear();
        self.outstanding = None;
        self.next_probe = 0.0;
    }

    /// If a probe is due, stamp it and return its serial.
    pub fn probe_due(&mut self, now_local: f64) -> Option<i32> {
        if self.is_master || self.master_id.is_none() {
            return None;
        }
        if now_local < self.next_probe {
            return None;
        }
        self.serial = self.serial.wrapping_add(1);
        self.outstanding = Some((self.serial, now_local));
        let period = if self.samples.len() < CLOCK_SYNC_HISTORY_LEN {
            CLOCK_SYNC_PERIOD_INITIAL
        } else {
            CLOCK_SYNC_PERIOD
        };
        self.next_probe = now_local + period;
        Some(self.serial)
    }

    /// Incorporate the master's reply to probe `serial`.
    ///
    /// The master stamped `master_time` somewhere between our send at
    /// `t0` and this receipt at `now_local`; assuming the midpoint,
    /// `offset = master_time + rtt/2 - now_local`.
    pub fn handle_reply(&mut self, serial: i32, master_time: f64, now_local: f64) {
        let Some((expected, t0)) = self.outstanding else {
            return;
        };
        if serial != expected {
            log::debug!("[clock] stale sync reply {} (awaiting {})", serial, expected);
            return;
        }
        self.outstanding = None;
        let rtt = (now_local - t0).max(0.0);
        let offset = master_time + rtt / 2.0 - now_local;
        if self.samples.len() == CLOCK_SYNC_HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { rtt, offset });

        let best = self
            .samples
            .iter()
            .min_by(|a, b| a.rtt.total_cmp(&b.rtt))
            .map(|s| s.offset)
            .unwrap_or(offset);
        self.target = best;
        if !self.synced {
            // The first adoption jumps; later ones slew.
            self.synced = true;
            self.skew = best;
            self.last_slew = now_local;
            log::info!(
                "[clock] synchronized to {:?} (offset {:+.6}s, rtt {:.6}s)",
                self.master_id,
                best,
                rtt
            );
        } else {
            log::trace!(
                "[clock] sample rtt={:.6}s offset={:+.6}s target={:+.6}s",
                rtt,
                offset,
                self.target
            );
        }
    }

    /// Slew the applied skew toward the adopted offset, at most
    /// [`CLOCK_SKEW_RATE`] of elapsed local time per tick.
    pub fn tick(&mut self, now_local: f64) {
        if !self.synced || self.is_master {
            return;
        }
        let dt = (now_local - self.last_slew).max(0.0);
        self.last_slew = now_local;
        let step = CLOCK_SKEW_RATE * dt;
        let diff = self.target - self.skew;
        self.skew += diff.clamp(-step, step);
    }

    /// Mean and minimum round trip over the sample ring, once synced.
    #[must_use]
    pub fn roundtrip(&self) -> Option<RoundTrip> {
        if !self.synced() || self.samples.is_empty() {
            return None;
        }
        let n = self.samples.len() as f64;
        let mean = self.samples.iter().map(|s| s.rtt).sum::<f64>() / n;
        let min = self
            .samples
            .iter()
            .map(|s| s.rtt)
            .fold(f64::INFINITY, f64::min);
        Some(RoundTrip { mean, min })
    }
}

/// Round-trip statistics over the most recent sync samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundTrip {
    /// Mean round trip in seconds.
    pub mean: f64,
    /// Minimum round trip in seconds.
    pub min: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct ScriptedClock(Rc<Cell<f64>>);

    impl TimeSource for ScriptedClock {
        fn now(&mut self) -> f64 {
            self.0.get()
        }
    }

    fn scripted() -> (Clock, Rc<Cell<f64>>) {
        let t = Rc::new(Cell::new(0.0));
        let clock = Clock::new(Box::new(ScriptedClock(Rc::clone(&t))));
        (clock, t)
    }

    #[test]
    fn test_unsynced_has_no_global_time() {
        let (mut c, _) = scripted();
        assert_eq!(c.global_time(), None);
        assert!(c.roundtrip().is_none());
    }

    #[test]
    fn test_master_global_time_continues_local() {
        let (mut c, t) = scripted();
        t.set(10.0);
        // Reference running at some unrelated epoch.
        let ref_t = Rc::new(Cell::new(5000.0));
        c.install_reference(Some(Box::new(ScriptedClock(Rc::clone(&ref_t)))));
        c.elect(Some("me"), "me");
        assert!(c.is_master());
        assert_eq!(c.global_time(), Some(10.0));
        // Reference advances 2s: global advances 2s.
        ref_t.set(5002.0);
        assert_eq!(c.global_time(), Some(12.0));
    }

    #[test]
    fn test_first_sync_jumps_then_slews() {
        let (mut c, t) = scripted();
        c.elect(Some("master"), "me");
        assert!(!c.is_master());

        t.set(1.0);
        let serial = c.probe_due(1.0).expect("probe due");
        // Master ~100s ahead; reply arrives 0.02s after the probe, so
        // offset = 101.03 + 0.01 - 1.02 = 100.02, applied immediately.
        c.handle_reply(serial, 101.03, 1.02);
        assert!(c.synced());
        t.set(1.02);
        let g = c.global_time().expect("global defined");
        assert!((g - 101.04).abs() < 1e-9, "first sync jumps, got {}", g);

        // A lower-rtt sample lands ~1.5s further ahead; the applied
        // skew may only move 10% of elapsed local time per tick.
        let serial = c.probe_due(1.5).expect("probe due");
        c.handle_reply(serial, 103.0, 1.51); // offset 101.495
        c.tick(1.51); // 0.49s since sync: at most 0.049s of slew
        t.set(1.51);
        let g1 = c.global_time().expect("global");
        assert!((g1 - (1.51 + 100.02 + CLOCK_SKEW_RATE * 0.49)).abs() < 1e-9);

        t.set(2.51);
        c.tick(2.51);
        let g2 = c.global_time().expect("global");
        assert!(g2 >= g1, "global time stays monotone");
        assert!(
            g2 - g1 - 1.0 <= CLOCK_SKEW_RATE * 1.0 + 1e-9,
            "slew rate bounded, got {}",
            g2 - g1 - 1.0
        );
    }

    #[test]
    fn test_min_rtt_sample_wins() {
        let (mut c, _) = scripted();
        c.elect(Some("master"), "me");
        // Three samples; the middle one has the lowest RTT.
        for (t0, reply, t1) in [
            (1.0, 50.0, 1.30),  // rtt 0.30
            (2.0, 51.0, 2.02),  // rtt 0.02  <- best
            (3.0, 52.5, 3.40),  // rtt 0.40
        ] {
            let serial = c.probe_due(t0).expect("probe");
            c.handle_reply(serial, reply, t1);
        }
        // Best sample: offset = 51.0 + 0.01 - 2.02 = 48.99.
        let rt = c.roundtrip().expect("stats");
        assert!((rt.min - 0.02).abs() < 1e-9);
        assert!((rt.mean - (0.30 + 0.02 + 0.40) / 3.0).abs() < 1e-9);
        assert!((c.target - 48.99).abs() < 1e-9);
    }

    #[test]
    fn test_probe_cadence_speeds_up_then_settles() {
        let (mut c, _) = scripted();
        c.elect(Some("master"), "me");
        let mut now = 0.0;
        // Ring not full: short period.
        for _ in 0..CLOCK_SYNC_HISTORY_LEN {
            let serial = c.probe_due(now).expect("probe");
            assert!(c.probe_due(now + CLOCK_SYNC_PERIOD_INITIAL / 2.0).is_none());
            c.handle_reply(serial, 100.0 + now, now + 0.001);
            now += CLOCK_SYNC_PERIOD_INITIAL;
        }
        // Ring full: long period.
        let serial = c.probe_due(now).expect("probe");
        c.handle_reply(serial, 100.0 + now, now + 0.001);
        assert!(c.probe_due(now + CLOCK_SYNC_PERIOD_INITIAL).is_none());
        assert!(c.probe_due(now + CLOCK_SYNC_PERIOD).is_some());
    }

    #[test]
    fn test_master_change_clears_samples() {
        let (mut c, _) = scripted();
        c.elect(Some("m1"), "me");
        let serial = c.probe_due(1.0).expect("probe");
        c.handle_reply(serial, 10.0, 1.01);
        assert!(c.roundtrip().is_some());

        c.elect(Some("m0"), "me");
        // Sync retained, ring cleared, probing restarts.
        assert!(c.synced());
        assert!(c.roundtrip().is_none());
        assert!(c.probe_due(1.02).is_some());
    }

    #[test]
    fn test_stale_and_unexpected_replies_ignored() {
        let (mut c, _) = scripted();
        c.elect(Some("master"), "me");
        c.handle_reply(99, 10.0, 1.0); // no probe outstanding
        assert!(!c.synced());
        let serial = c.probe_due(1.0).expect("probe");
        c.handle_reply(serial.wrapping_add(1), 10.0, 1.1); // wrong serial
        assert!(!c.synced());
        c.handle_reply(serial, 10.0, 1.2);
        assert!(c.synced());
    }
}
