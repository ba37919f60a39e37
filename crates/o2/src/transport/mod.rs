// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Transport I/O: three socket kinds multiplexed through one
//! readiness poll.
//!
//! - discovery UDP, bound to the well-known broadcast port and shared
//!   between processes on one host via `SO_REUSEADDR`/`SO_REUSEPORT`;
//! - data UDP on an ephemeral port for best-effort messages;
//! - a TCP listener plus length-prefix framed connections for reliable
//!   traffic.
//!
//! Everything is non-blocking. [`Transports::poll_io`] runs a
//! zero-timeout `mio` poll, drains whatever is ready, and reports it as
//! [`TransportEvent`]s; partial reads accumulate in each connection's
//! [`FrameCodec`], partial writes in its out-buffer.

pub mod frame;

pub use frame::FrameCodec;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{DISCOVERY_PORT, MAX_MESSAGE_SIZE};

const DISCOVERY_TOKEN: Token = Token(0);
const DATA_TOKEN: Token = Token(1);
const LISTENER_TOKEN: Token = Token(2);
const CONNECTION_TOKEN_START: usize = 3;

const MAX_EVENTS: usize = 256;
const RECV_BUF_SIZE: usize = 65536;

/// Identifier of one TCP connection.
pub type ConnId = usize;

/// What the readiness pump observed.
#[derive(Debug)]
pub enum TransportEvent {
    /// A datagram arrived on one of the UDP sockets.
    Datagram {
        /// Payload bytes.
        data: Vec<u8>,
        /// Sender address.
        source: SocketAddr,
        /// True when it arrived on the discovery socket.
        discovery: bool,
    },
    /// An inbound connection was accepted.
    Accepted {
        /// Connection id for subsequent frames.
        conn: ConnId,
        /// Remote address.
        remote: SocketAddr,
    },
    /// An outbound connection completed.
    Connected {
        /// Connection id from [`Transports::connect`].
        conn: ConnId,
    },
    /// One complete frame arrived on a connection.
    Frame {
        /// Connection id.
        conn: ConnId,
        /// Frame body (a message wire image).
        data: Vec<u8>,
    },
    /// A connection closed or failed; its id is now invalid.
    Closed {
        /// Connection id.
        conn: ConnId,
    },
}

/// Per-connection stream state.
struct Connection {
    stream: TcpStream,
    codec: FrameCodec,
    outbuf: Vec<u8>,
    out_pos: usize,
    connected: bool,
}

impl Connection {
    fn new(stream: TcpStream, connected: bool) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(MAX_MESSAGE_SIZE),
            outbuf: Vec::new(),
            out_pos: 0,
            connected,
        }
    }

    /// Push buffered bytes into the socket. `Ok(true)` when drained.
    fn flush(&mut self) -> io::Result<bool> {
        while self.out_pos < self.outbuf.len() {
            match self.stream.write(&self.outbuf[self.out_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.out_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.outbuf.clear();
        self.out_pos = 0;
        Ok(true)
    }
}

/// The process's socket set.
pub struct Transports {
    poll: Poll,
    events: Events,
    discovery: UdpSocket,
    data: UdpSocket,
    listener: TcpListener,
    conns: HashMap<ConnId, Connection>,
    next_token: usize,
    data_port: u16,
    tcp_port: u16,
    recv_buf: Vec<u8>,
}

impl std::fmt::Debug for Transports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transports")
            .field("data_port", &self.data_port)
            .field("tcp_port", &self.tcp_port)
            .field("connections", &self.conns.len())
            .finish_non_exhaustive()
    }
}

impl Transports {
    /// Bind all three sockets and register them with the poll.
    ///
    /// # Errors
    /// Any socket/bind/registration failure.
    pub fn bind() -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut discovery = bind_discovery_socket()?;
        let std_data = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        std_data.set_nonblocking(true)?;
        let mut data = UdpSocket::from_std(std_data);
        let data_port = data.local_addr()?.port();

        let std_listener = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        std_listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(std_listener);
        let tcp_port = listener.local_addr()?.port();

        poll.registry()
            .register(&mut discovery, DISCOVERY_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut data, DATA_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        log::info!(
            "[net] bound discovery=:{} data=:{} tcp=:{}",
            DISCOVERY_PORT,
            data_port,
            tcp_port
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            discovery,
            data,
            listener,
            conns: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            data_port,
            tcp_port,
            recv_buf: vec![0; RECV_BUF_SIZE],
        })
    }

    /// Ephemeral port of the data UDP socket.
    #[must_use]
    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// Ephemeral port of the TCP listener.
    #[must_use]
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Drain every ready socket once, without blocking.
    ///
    /// # Errors
    /// Only on poll failure; per-socket errors surface as events or
    /// debug logs (UDP errors are silent by design).
    pub fn poll_io(&mut self, out: &mut Vec<TransportEvent>) -> io::Result<()> {
        self.poll
            .poll(&mut self.events, Some(Duration::from_millis(0)))?;
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            match token {
                DISCOVERY_TOKEN => self.drain_udp(true, out),
                DATA_TOKEN => self.drain_udp(false, out),
                LISTENER_TOKEN => self.drain_accept(out),
                Token(id) => self.service_connection(id, readable, writable, out),
            }
        }
        Ok(())
    }

    /// Send one datagram from the data socket.
    ///
    /// # Errors
    /// Socket-level send failure (callers drop the message and log).
    pub fn send_udp(&self, data: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.data.send_to(data, dest)?;
        Ok(())
    }

    /// Broadcast one discovery datagram to the well-known port, plus a
    /// loopback copy for hosts that filter broadcast.
    pub fn broadcast(&self, data: &[u8]) {
        for dest in [
            SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            SocketAddr::from((Ipv4Addr::LOCALHOST, DISCOVERY_PORT)),
        ] {
            if let Err(e) = self.discovery.send_to(data, dest) {
                log::debug!("[net] discovery send to {} failed: {}", dest, e);
            }
        }
    }

    /// Open an outbound connection; completion arrives later as
    /// [`TransportEvent::Connected`].
    ///
    /// # Errors
    /// Immediate connect/registration failure.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<ConnId> {
        let mut stream = TcpStream::connect(addr)?;
        let id = self.next_token;
        self.next_token += 1;
        self.poll.registry().register(
            &mut stream,
            Token(id),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.conns.insert(id, Connection::new(stream, false));
        log::debug!("[net] dialing {} as conn {}", addr, id);
        Ok(id)
    }

    /// Queue one framed message on a connection and push what the
    /// socket will take now; the rest goes out on writable readiness.
    ///
    /// # Errors
    /// Unknown connection or a hard socket error (caller closes).
    pub fn send_frame(&mut self, conn: ConnId, payload: &[u8]) -> io::Result<()> {
        let c = self
            .conns
            .get_mut(&conn)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no such connection"))?;
        let frame = FrameCodec::encode(payload);
        c.outbuf.extend_from_slice(&frame);
        if c.connected {
            c.flush()?;
        }
        Ok(())
    }

    /// Remote address of a connection.
    #[must_use]
    pub fn peer_addr(&self, conn: ConnId) -> Option<SocketAddr> {
        self.conns.get(&conn).and_then(|c| c.stream.peer_addr().ok())
    }

    /// Drop a connection without an event (caller initiated).
    pub fn close(&mut self, conn: ConnId) {
        if let Some(mut c) = self.conns.remove(&conn) {
            let _ = self.poll.registry().deregister(&mut c.stream);
        }
    }

    /// Drop every connection (teardown).
    pub fn close_all(&mut self) {
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }

    fn drain_udp(&mut self, discovery: bool, out: &mut Vec<TransportEvent>) {
        loop {
            let socket = if discovery { &self.discovery } else { &self.data };
            match socket.recv_from(&mut self.recv_buf) {
                Ok((len, source)) => out.push(TransportEvent::Datagram {
                    data: self.recv_buf[..len].to_vec(),
                    source,
                    discovery,
                }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // UDP errors are silent: note and move on.
                    log::debug!("[net] udp recv error: {}", e);
                    break;
                }
            }
        }
    }

    fn drain_accept(&mut self, out: &mut Vec<TransportEvent>) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote)) => {
                    let id = self.next_token;
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(id),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("[net] failed to register accepted conn: {}", e);
                        continue;
                    }
                    self.conns.insert(id, Connection::new(stream, true));
                    log::debug!("[net] accepted {} as conn {}", remote, id);
                    out.push(TransportEvent::Accepted { conn: id, remote });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("[net] accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn service_connection(
        &mut self,
        id: ConnId,
        readable: bool,
        writable: bool,
        out: &mut Vec<TransportEvent>,
    ) {
        let Some(c) = self.conns.get_mut(&id) else {
            return;
        };

        if writable {
            if !c.connected {
                match c.stream.take_error() {
                    Ok(None) if c.stream.peer_addr().is_ok() => {
                        c.connected = true;
                        log::debug!("[net] conn {} established", id);
                        out.push(TransportEvent::Connected { conn: id });
                    }
                    Ok(None) => {
                        // Spurious wakeup before the handshake settled.
                    }
                    Ok(Some(e)) => {
                        log::debug!("[net] conn {} failed: {}", id, e);
                        self.drop_conn(id, out);
                        return;
                    }
                    Err(e) => {
                        log::debug!("[net] conn {} failed: {}", id, e);
                        self.drop_conn(id, out);
                        return;
                    }
                }
            }
            let Some(c) = self.conns.get_mut(&id) else {
                return;
            };
            if c.connected {
                if let Err(e) = c.flush() {
                    log::debug!("[net] conn {} write error: {}", id, e);
                    self.drop_conn(id, out);
                    return;
                }
            }
        }

        if readable {
            self.drain_conn_read(id, out);
        }
    }

    fn drain_conn_read(&mut self, id: ConnId, out: &mut Vec<TransportEvent>) {
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            let Some(c) = self.conns.get_mut(&id) else {
                return;
            };
            match c.stream.read(&mut buf) {
                Ok(0) => {
                    log::debug!("[net] conn {} hung up", id);
                    self.drop_conn(id, out);
                    return;
                }
                Ok(n) => {
                    let mut frames = Vec::new();
                    if let Err(e) = c.codec.feed(&buf[..n], &mut frames) {
                        log::warn!("[net] conn {} framing error: {}", id, e);
                        self.drop_conn(id, out);
                        return;
                    }
                    for data in frames {
                        out.push(TransportEvent::Frame { conn: id, data });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("[net] conn {} read error: {}", id, e);
                    self.drop_conn(id, out);
                    return;
                }
            }
        }
    }

    fn drop_conn(&mut self, id: ConnId, out: &mut Vec<TransportEvent>) {
        if let Some(mut c) = self.conns.remove(&id) {
            let _ = self.poll.registry().deregister(&mut c.stream);
            out.push(TransportEvent::Closed { conn: id });
        }
    }
}

/// The discovery socket recipe: reuse-addr and (on Unix) reuse-port so
/// every process on the host can share the well-known port, broadcast
/// enabled for the periodic announcement.
fn bind_discovery_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT));
    socket.bind(&bind_addr.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_assigns_ephemeral_ports() {
        let t = Transports::bind().expect("bind sockets");
        assert_ne!(t.data_port(), 0);
        assert_ne!(t.tcp_port(), 0);
        assert_ne!(t.data_port(), DISCOVERY_PORT);
    }

    #[test]
    fn test_two_processes_share_discovery_port() {
        let a = Transports::bind().expect("first bind");
        let b = Transports::bind().expect("second bind");
        assert_ne!(a.data_port(), b.data_port());
        assert_ne!(a.tcp_port(), b.tcp_port());
    }

    #[test]
    fn test_udp_unicast_between_sockets() {
        let a = Transports::bind().expect("bind a");
        let mut b = Transports::bind().expect("bind b");
        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, b.data_port()));
        a.send_udp(b"ping", dest).expect("send");

        let mut events = Vec::new();
        for _ in 0..200 {
            b.poll_io(&mut events).expect("poll");
            if !events.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        match events.first() {
            Some(TransportEvent::Datagram {
                data, discovery, ..
            }) => {
                assert_eq!(data, b"ping");
                assert!(!discovery);
            }
            other => panic!("expected datagram, got {:?}", other),
        }
    }

    #[test]
    fn test_tcp_connect_and_frame_roundtrip() {
        let mut a = Transports::bind().expect("bind a");
        let mut b = Transports::bind().expect("bind b");
        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, b.tcp_port()));
        let conn = a.connect(dest).expect("dial");

        let mut a_events = Vec::new();
        let mut b_events = Vec::new();
        let mut sent = false;
        let mut got_frame = None;
        for _ in 0..500 {
            a.poll_io(&mut a_events).expect("poll a");
            b.poll_io(&mut b_events).expect("poll b");
            if !sent
                && a_events
                    .iter()
                    .any(|e| matches!(e, TransportEvent::Connected { .. }))
            {
                a.send_frame(conn, b"frame body").expect("send frame");
                sent = true;
            }
            if let Some(TransportEvent::Frame { data, .. }) = b_events
                .iter()
                .find(|e| matches!(e, TransportEvent::Frame { .. }))
            {
                got_frame = Some(data.clone());
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(got_frame.as_deref(), Some(&b"frame body"[..]));

        // Closing one side surfaces as a hangup on the other.
        a.close(conn);
        let mut closed = false;
        for _ in 0..500 {
            b.poll_io(&mut b_events).expect("poll b");
            if b_events
                .iter()
                .any(|e| matches!(e, TransportEvent::Closed { .. }))
            {
                closed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(closed, "peer close should surface");
    }
}
