// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Discovery: periodic broadcast, identity datagrams, and peer ids.
//!
//! Every process broadcasts a `!_o2/dy` message on the well-known port
//! carrying its ensemble name, peer id, data UDP port, TCP listener
//! port, and clock-candidacy flag. Receivers in the same ensemble open
//! a TCP connection to new peers (only the side with the lower id
//! dials, so a pair never opens two connections). The broadcast period
//! starts short and backs off geometrically once the mesh is stable.

use crate::config::{DISCOVERY_BACKOFF, DISCOVERY_PERIOD_INITIAL, DISCOVERY_PERIOD_MAX};
use crate::error::Result;
use crate::msg::{ArgView, Message, MessageBuilder, TypeCode};

/// Address of the discovery datagram.
pub const DISCOVERY_ADDRESS: &str = "!_o2/dy";
/// Address of the hello frame that pairs a TCP connection to a peer.
pub const HELLO_ADDRESS: &str = "!_o2/in";

/// Identity fields announced by a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Ensemble the sender belongs to.
    pub ensemble: String,
    /// Sender's peer id.
    pub peer_id: String,
    /// Sender's data UDP port.
    pub udp_port: u16,
    /// Sender's TCP listener port.
    pub tcp_port: u16,
    /// Sender offers a clock reference.
    pub candidate: bool,
}

impl Announcement {
    /// Encode as a discovery or hello message (`ssiiB`).
    #[must_use]
    pub fn to_message(&self, address: &str) -> Message {
        let mut b = MessageBuilder::new();
        b.add_string(&self.ensemble)
            .add_string(&self.peer_id)
            .add_int32(i32::from(self.udp_port))
            .add_int32(i32::from(self.tcp_port))
            .add_bool(self.candidate);
        // The address and arguments are well-formed by construction.
        b.finish(0.0, address)
            .expect("announcement encoding is infallible")
    }

    /// Decode from a received `ssiiB` message, if well-formed.
    #[must_use]
    pub fn from_message(msg: &Message) -> Option<Announcement> {
        let mut ex = msg.extract();
        let ensemble = ex.get_next(TypeCode::String)?.str()?.to_string();
        let peer_id = ex.get_next(TypeCode::String)?.str()?.to_string();
        let udp_port = u16::try_from(ex.get_next(TypeCode::Int32)?.i32()?).ok()?;
        let tcp_port = u16::try_from(ex.get_next(TypeCode::Int32)?.i32()?).ok()?;
        let candidate = match ex.get_next(TypeCode::Bool)? {
            ArgView::Bool(b) => b,
            _ => return None,
        };
        Some(Announcement {
            ensemble,
            peer_id,
            udp_port,
            tcp_port,
            candidate,
        })
    }
}

/// Broadcast cadence with geometric backoff.
#[derive(Debug)]
pub struct DiscoveryTimer {
    period: f64,
    next_send: f64,
}

impl DiscoveryTimer {
    /// Start ready to fire immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            period: DISCOVERY_PERIOD_INITIAL,
            next_send: 0.0,
        }
    }

    /// True when a broadcast is due at local time `now`.
    #[must_use]
    pub fn due(&self, now: f64) -> bool {
        now >= self.next_send
    }

    /// Note a broadcast at `now` and back the period off.
    pub fn sent(&mut self, now: f64) {
        self.next_send = now + self.period;
        self.period = (self.period * DISCOVERY_BACKOFF).min(DISCOVERY_PERIOD_MAX);
    }

    /// Current period (seconds).
    #[must_use]
    pub fn period(&self) -> f64 {
        self.period
    }

    /// Make the next broadcast due immediately (after a change in
    /// candidacy, say) without resetting the backoff.
    pub fn expedite(&mut self) {
        self.next_send = 0.0;
    }
}

impl Default for DiscoveryTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide whether we dial a newly discovered peer: exactly one side
/// of each pair connects, and ids never tie by construction.
#[must_use]
pub fn we_dial(self_id: &str, peer_id: &str) -> bool {
    self_id < peer_id
}

const FNV1A_OFFSET_BASIS_64: u64 = 0xcbf2_9ce4_8422_2325;
const FNV1A_PRIME_64: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(s: &str) -> u64 {
    let mut hash = FNV1A_OFFSET_BASIS_64;
    for &byte in s.as_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV1A_PRIME_64);
    }
    hash
}

/// Derive this process's peer id: a hash of ensemble, host, pid, and
/// start time, rendered fixed-width so id comparison is a plain string
/// order.
///
/// # Errors
/// Never fails today; kept fallible for identity sources that can.
pub fn make_peer_id(ensemble: &str) -> Result<String> {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let pid = std::process::id();
    let start = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let identity = format!("{}:{}:{}:{}", ensemble, host, pid, start);
    Ok(format!("{:016x}{:08x}", fnv1a(&identity), pid))
}
