// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! The peer table: every other process of the ensemble we know about.
//!
//! Peers appear on their first discovery datagram or TCP hello and
//! vanish on hangup or silence past the liveness horizon. Services and
//! peers reference each other by name and id only, never by pointer,
//! so teardown is a pair of map removals.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};

use crate::config::PEER_TIMEOUT;
use crate::transport::ConnId;

/// One known remote process.
#[derive(Debug)]
pub struct Peer {
    /// Its stable id (deterministic hash of identity; the id order
    /// decides who dials and who is elected master).
    pub peer_id: String,
    /// Its address as observed from received traffic.
    pub ip: IpAddr,
    /// Its data UDP port, for best-effort sends.
    pub udp_port: u16,
    /// Its TCP listener port.
    pub tcp_port: u16,
    /// Our connection to it, once the handshake ran.
    pub conn: Option<ConnId>,
    /// Names of the services it provides.
    pub services: BTreeSet<String>,
    /// It offers a clock reference.
    pub candidate: bool,
    /// It reports having clock sync.
    pub synced: bool,
    /// Local time we last heard anything from it.
    pub last_heard: f64,
}

impl Peer {
    /// Best-effort endpoint.
    #[must_use]
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.udp_port))
    }

    /// Listener endpoint.
    #[must_use]
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.tcp_port))
    }
}

/// Table of peers keyed by id, with a connection-id index.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
    by_conn: HashMap<ConnId, String>,
}

impl PeerTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record identity fields from a discovery datagram or hello,
    /// creating the peer if new. Returns true when the peer was new.
    pub fn upsert(
        &mut self,
        peer_id: &str,
        ip: IpAddr,
        udp_port: u16,
        tcp_port: u16,
        candidate: bool,
        now: f64,
    ) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.ip = ip;
                peer.udp_port = udp_port;
                peer.tcp_port = tcp_port;
                peer.candidate = candidate;
                peer.last_heard = now;
                false
            }
            None => {
                log::info!(
                    "[peers] new peer {} at {} (udp:{} tcp:{}{})",
                    peer_id,
                    ip,
                    udp_port,
                    tcp_port,
                    if candidate { ", clock candidate" } else { "" }
                );
                self.peers.insert(
                    peer_id.to_string(),
                    Peer {
                        peer_id: peer_id.to_string(),
                        ip,
                        udp_port,
                        tcp_port,
                        conn: None,
                        services: BTreeSet::new(),
                        candidate,
                        synced: false,
                        last_heard: now,
                    },
                );
                true
            }
        }
    }

    /// Look up a peer.
    #[must_use]
    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Look up a peer mutably.
    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    /// Pair a peer with its TCP connection.
    pub fn attach_conn(&mut self, peer_id: &str, conn: ConnId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.conn = Some(conn);
            self.by_conn.insert(conn, peer_id.to_string());
        }
    }

    /// The peer owning a connection id.
    #[must_use]
    pub fn id_by_conn(&self, conn: ConnId) -> Option<&str> {
        self.by_conn.get(&conn).map(String::as_str)
    }

    /// Note liveness for the peer behind a connection.
    pub fn heard_on_conn(&mut self, conn: ConnId, now: f64) {
        if let Some(id) = self.by_conn.get(&conn) {
            if let Some(peer) = self.peers.get_mut(id) {
                peer.last_heard = now;
            }
        }
    }

    /// Remove a peer, returning its record.
    pub fn remove(&mut self, peer_id: &str) -> Option<Peer> {
        let peer = self.peers.remove(peer_id)?;
        if let Some(conn) = peer.conn {
            self.by_conn.remove(&conn);
        }
        Some(peer)
    }

    /// Ids of peers silent past the liveness horizon.
    #[must_use]
    pub fn expired(&self, now: f64) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| now - p.last_heard > PEER_TIMEOUT)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    /// Ids of peers offering a clock reference.
    pub fn candidate_ids(&self) -> impl Iterator<Item = &str> {
        self.peers
            .values()
            .filter(|p| p.candidate)
            .map(|p| p.peer_id.as_str())
    }

    /// All connection ids currently attached to peers.
    pub fn conn_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.by_conn.keys().copied()
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peer is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_upsert_create_then_refresh() {
        let mut t = PeerTable::new();
        assert!(t.upsert("p1", localhost(), 4000, 5000, false, 1.0));
        assert!(!t.upsert("p1", localhost(), 4001, 5000, true, 2.0));
        let p = t.get("p1").expect("present");
        assert_eq!(p.udp_port, 4001);
        assert!(p.candidate);
        assert_eq!(p.last_heard, 2.0);
    }

    #[test]
    fn test_conn_index_and_removal() {
        let mut t = PeerTable::new();
        t.upsert("p1", localhost(), 4000, 5000, false, 0.0);
        t.attach_conn("p1", 7);
        assert_eq!(t.id_by_conn(7), Some("p1"));
        t.heard_on_conn(7, 3.0);
        assert_eq!(t.get("p1").expect("present").last_heard, 3.0);

        let p = t.remove("p1").expect("removed");
        assert_eq!(p.conn, Some(7));
        assert_eq!(t.id_by_conn(7), None);
        assert!(t.is_empty());
    }

    #[test]
    fn test_expiry_horizon() {
        let mut t = PeerTable::new();
        t.upsert("old", localhost(), 1, 2, false, 0.0);
        t.upsert("new", localhost(), 1, 2, false, 100.0);
        let gone = t.expired(100.0 + 0.5);
        assert_eq!(gone, ["old"]);
    }

    #[test]
    fn test_candidate_ids() {
        let mut t = PeerTable::new();
        t.upsert("a", localhost(), 1, 2, true, 0.0);
        t.upsert("b", localhost(), 1, 2, false, 0.0);
        let mut c: Vec<&str> = t.candidate_ids().collect();
        c.sort_unstable();
        assert_eq!(c, ["a"]);
    }
}
