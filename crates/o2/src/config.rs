// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Global configuration - single source of truth.
//!
//! This module centralizes the compile-time constants of the protocol:
//! ports, discovery and clock-sync cadence, scheduler geometry, and
//! transport limits. Never hardcode these elsewhere.

/// Well-known discovery port shared by every process in every ensemble.
///
/// 0x4F32 is "O2" in ASCII. Discovery datagrams are broadcast to this
/// port; ensemble names inside the datagram keep unrelated ensembles
/// apart, so one port serves the whole LAN.
pub const DISCOVERY_PORT: u16 = 0x4F32;

/// Initial discovery broadcast period in seconds.
///
/// Short at startup so two processes launched together find each other
/// quickly, then backed off geometrically (see [`DISCOVERY_BACKOFF`]).
pub const DISCOVERY_PERIOD_INITIAL: f64 = 0.1;

/// Discovery period cap in seconds, reached after geometric backoff.
pub const DISCOVERY_PERIOD_MAX: f64 = 4.0;

/// Backoff multiplier applied to the discovery period after each send.
pub const DISCOVERY_BACKOFF: f64 = 2.0;

/// Peer liveness horizon in seconds.
///
/// A peer that produces no traffic (discovery datagram or TCP frame) for
/// this long is torn down, equivalent to missing three broadcasts at the
/// capped period.
pub const PEER_TIMEOUT: f64 = 3.0 * DISCOVERY_PERIOD_MAX;

/// Number of round-trip samples kept per clock-sync peer.
pub const CLOCK_SYNC_HISTORY_LEN: usize = 5;

/// Clock probe period in seconds until the sample ring is full.
pub const CLOCK_SYNC_PERIOD_INITIAL: f64 = 0.1;

/// Steady-state clock probe period in seconds (0.5 Hz).
pub const CLOCK_SYNC_PERIOD: f64 = 2.0;

/// Maximum rate at which global time slews toward a new offset,
/// as a fraction of elapsed local time.
///
/// Bounding the slew keeps `global_time()` monotone and smooth when the
/// adopted offset changes after the first synchronization.
pub const CLOCK_SKEW_RATE: f64 = 0.10;

/// Number of bins in each timing wheel.
pub const SCHED_TABLE_LEN: usize = 128;

/// Width of one timing-wheel bin in seconds.
///
/// A timestamp `t` lands in bin `floor(t / SCHED_BIN_SECONDS) % 128`;
/// at the recommended 200-1000 Hz polling rates a tick visits at most a
/// handful of bins.
pub const SCHED_BIN_SECONDS: f64 = 0.01;

/// Largest message sent best-effort as a single UDP datagram.
///
/// Messages over this size are promoted to the peer's TCP connection
/// rather than risking IP fragmentation. 1472 = typical Ethernet MTU
/// minus IP and UDP headers.
pub const UDP_MESSAGE_LIMIT: usize = 1472;

/// Hard cap on one message (TCP frame body or UDP payload), anti-OOM.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Reserved service name carrying the internal protocol
/// (discovery, service replication, clock sync).
pub const SYSTEM_SERVICE: &str = "_o2";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_reaches_cap() {
        let mut period = DISCOVERY_PERIOD_INITIAL;
        let mut sends = 0;
        while period < DISCOVERY_PERIOD_MAX {
            period = (period * DISCOVERY_BACKOFF).min(DISCOVERY_PERIOD_MAX);
            sends += 1;
        }
        // 0.1 -> 0.2 -> 0.4 -> 0.8 -> 1.6 -> 3.2 -> 4.0
        assert_eq!(sends, 6);
    }

    #[test]
    fn test_peer_timeout_spans_missed_broadcasts() {
        assert!(PEER_TIMEOUT >= 2.0 * DISCOVERY_PERIOD_MAX);
    }
}
