// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! The process handle: initialization, the poll loop, sending,
//! scheduling, and the internal `/_o2` protocol.
//!
//! One [`Process`] is one participant in an ensemble. Everything runs
//! on the thread that calls [`Process::poll`]: socket draining,
//! discovery, clock discipline, both schedulers, and handler dispatch.
//! Handlers never re-enter the loop; anything they emit goes through
//! an [`Outbox`] into the pending queue, drained at the end of the
//! same poll.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock, RoundTrip, TimeSource};
use crate::config::{SYSTEM_SERVICE, UDP_MESSAGE_LIMIT};
use crate::directory::{Directory, ServiceEntry};
use crate::discovery::{
    self, Announcement, DiscoveryTimer, DISCOVERY_ADDRESS, HELLO_ADDRESS,
};
use crate::error::{Error, Result, Status};
use crate::msg::{codec, Heap, Message, MessageBuilder, MessagePool, SystemHeap, TypeCode};
use crate::path::{self, Handler};
use crate::peers::PeerTable;
use crate::sched::Scheduler;
use crate::transport::{ConnId, TransportEvent, Transports};

/// Which scheduler a message is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBase {
    /// The local-time wheel; usable before clock sync.
    Local,
    /// The global-time wheel; refuses work until global time exists.
    Global,
}

/// Who serves an address's first segment.
enum Target {
    Local,
    Peer(String),
}

/// Work emitted by handlers, executed after the handler returns.
#[derive(Debug)]
pub(crate) enum Pending {
    /// Route a message (best effort or reliable).
    Send {
        /// The message.
        msg: Message,
        /// Reliable (TCP) delivery.
        reliable: bool,
    },
    /// File a message under a scheduler.
    Schedule {
        /// Which wheel.
        base: TimeBase,
        /// The message.
        msg: Message,
    },
    /// Stop the run loop.
    Stop,
}

/// The sending surface handed to handlers.
///
/// Everything queues onto the pending-dispatch list; nothing recurses
/// into dispatch or touches sockets from handler context. Errors (an
/// unknown service, a timed send without sync) surface as logged drops
/// when the queue drains.
#[derive(Debug)]
pub struct Outbox<'p> {
    pending: &'p mut VecDeque<Pending>,
    local_now: f64,
    global_now: Option<f64>,
}

impl<'p> Outbox<'p> {
    pub(crate) fn new(
        pending: &'p mut VecDeque<Pending>,
        local_now: f64,
        global_now: Option<f64>,
    ) -> Self {
        Self {
            pending,
            local_now,
            global_now,
        }
    }

    /// Queue a best-effort send.
    pub fn send(&mut self, msg: Message) {
        self.pending.push_back(Pending::Send {
            msg,
            reliable: false,
        });
    }

    /// Queue a reliable send.
    pub fn send_cmd(&mut self, msg: Message) {
        self.pending.push_back(Pending::Send {
            msg,
            reliable: true,
        });
    }

    /// Queue a message for a scheduler.
    pub fn schedule(&mut self, base: TimeBase, msg: Message) {
        self.pending.push_back(Pending::Schedule { base, msg });
    }

    /// Ask the run loop to stop.
    pub fn stop(&mut self) {
        self.pending.push_back(Pending::Stop);
    }

    /// Local time when this dispatch began.
    #[must_use]
    pub fn local_time(&self) -> f64 {
        self.local_now
    }

    /// Global time when this dispatch began, if defined.
    #[must_use]
    pub fn global_time(&self) -> Option<f64> {
        self.global_now
    }
}

/// Configures a [`Process`] before it binds its sockets.
pub struct ProcessBuilder {
    ensemble: String,
    heap: Box<dyn Heap>,
    local_clock: Box<dyn TimeSource>,
}

impl ProcessBuilder {
    /// Use a custom allocator pair for message buffers.
    #[must_use]
    pub fn heap(mut self, heap: Box<dyn Heap>) -> Self {
        self.heap = heap;
        self
    }

    /// Use a custom local time source (testing, audio-clock hosts).
    #[must_use]
    pub fn local_clock(mut self, clock: Box<dyn TimeSource>) -> Self {
        self.local_clock = clock;
        self
    }

    /// Validate the ensemble name, bind sockets, and start discovery.
    ///
    /// # Errors
    /// [`Error::BadName`] for an empty, non-ASCII, or `/`-bearing
    /// ensemble name; [`Error::Io`] when a socket cannot be bound.
    pub fn build(self) -> Result<Process> {
        let name = self.ensemble;
        if name.is_empty() || !name.is_ascii() || name.contains('/') {
            return Err(Error::BadName(name));
        }
        let peer_id = discovery::make_peer_id(&name)?;
        let transports = Transports::bind()?;
        let mut clock = Clock::new(self.local_clock);
        let now = clock.local_time();
        log::info!("[o2] ensemble {:?} joined as {}", name, peer_id);
        Ok(Process {
            ensemble: name,
            peer_id,
            directory: Directory::new(),
            peers: PeerTable::new(),
            clock,
            transports,
            disc_timer: DiscoveryTimer::new(),
            ltsched: Scheduler::new(now),
            gtsched: Scheduler::new(0.0),
            gtsched_positioned: false,
            pool: MessagePool::new(self.heap),
            builder_slot: None,
            pending: VecDeque::new(),
            hello_sent: HashSet::new(),
            announced_sync: false,
            in_dispatch: false,
            running: false,
            stop_flag: false,
        })
    }
}

/// One O2 process: the singleton state as an explicit handle.
pub struct Process {
    ensemble: String,
    peer_id: String,
    directory: Directory,
    peers: PeerTable,
    clock: Clock,
    transports: Transports,
    disc_timer: DiscoveryTimer,
    ltsched: Scheduler,
    gtsched: Scheduler,
    gtsched_positioned: bool,
    pool: MessagePool,
    builder_slot: Option<MessageBuilder>,
    pending: VecDeque<Pending>,
    hello_sent: HashSet<ConnId>,
    announced_sync: bool,
    in_dispatch: bool,
    running: bool,
    stop_flag: bool,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("ensemble", &self.ensemble)
            .field("peer_id", &self.peer_id)
            .field("peers", &self.peers.len())
            .field("synced", &self.clock.synced())
            .finish_non_exhaustive()
    }
}

impl Process {
    /// Join `ensemble` with default collaborators.
    ///
    /// # Errors
    /// See [`ProcessBuilder::build`].
    pub fn initialize(ensemble: &str) -> Result<Process> {
        Process::builder(ensemble).build()
    }

    /// Start configuring a process.
    #[must_use]
    pub fn builder(ensemble: &str) -> ProcessBuilder {
        ProcessBuilder {
            ensemble: ensemble.to_string(),
            heap: Box::new(SystemHeap),
            local_clock: Box::new(MonotonicClock::default()),
        }
    }

    /// This process's stable id within the ensemble.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The ensemble name.
    #[must_use]
    pub fn ensemble(&self) -> &str {
        &self.ensemble
    }

    // ===== Services and methods =====

    /// Offer a service, announcing it to connected peers.
    ///
    /// # Errors
    /// [`Error::Fail`] for an invalid or already-taken name.
    pub fn add_service(&mut self, name: &str) -> Result<()> {
        if !valid_service_name(name) {
            return Err(Error::Fail);
        }
        self.directory.add_local(name)?;
        log::info!("[o2] service {:?} added", name);
        self.replicate_service_change("!_o2/sv/add", name);
        Ok(())
    }

    /// Withdraw a locally offered service.
    ///
    /// # Errors
    /// [`Error::UnknownService`] unless `name` is a local service.
    pub fn remove_service(&mut self, name: &str) -> Result<()> {
        match self.directory.entry(name) {
            Some(ServiceEntry::Local(_)) => {
                self.directory.remove(name);
                log::info!("[o2] service {:?} removed", name);
                self.replicate_service_change("!_o2/sv/rm", name);
                Ok(())
            }
            _ => Err(Error::UnknownService(name.to_string())),
        }
    }

    /// Install a handler for an address (service as first segment).
    ///
    /// `typespec` of `None` disables type checking. With `coerce`,
    /// arguments are converted losslessly to the typespec where
    /// possible; with `parse`, the handler receives a materialized
    /// argument vector.
    ///
    /// # Errors
    /// [`Error::UnknownService`] or [`Error::Fail`] per
    /// [`Directory::add_method`].
    pub fn add_method(
        &mut self,
        path: &str,
        typespec: Option<&str>,
        coerce: bool,
        parse: bool,
        handler: Handler,
    ) -> Result<()> {
        self.directory
            .add_method(path, typespec, coerce, parse, handler)
    }

    /// Status of a service, or `None` when unknown.
    #[must_use]
    pub fn status(&self, service: &str) -> Option<Status> {
        let synced = self.clock.synced();
        match self.directory.entry(service)? {
            ServiceEntry::Local(_) => Some(if synced {
                Status::Local
            } else {
                Status::LocalNoTime
            }),
            ServiceEntry::Remote { peer_id } => {
                let peer_synced = self.peers.get(peer_id).is_some_and(|p| p.synced);
                Some(if synced && peer_synced {
                    Status::Remote
                } else {
                    Status::RemoteNoTime
                })
            }
            ServiceEntry::Bridge => Some(if synced {
                Status::Bridge
            } else {
                Status::BridgeNoTime
            }),
            ServiceEntry::OscOut => Some(if synced {
                Status::ToOsc
            } else {
                Status::ToOscNoTime
            }),
        }
    }

    // ===== Clock =====

    /// Provide a time reference, making this process a master
    /// candidate. `None` uses the local clock as the reference.
    ///
    /// # Errors
    /// Infallible today; fallible for parity with initialization.
    pub fn set_clock(&mut self, reference: Option<Box<dyn TimeSource>>) -> Result<()> {
        self.clock.install_reference(reference);
        self.run_election();
        // Re-announce promptly so peers learn of the candidacy.
        self.disc_timer.expedite();
        Ok(())
    }

    /// Estimated global time, or `None` until synchronized (the C
    /// API's `-1`).
    pub fn time(&mut self) -> Option<f64> {
        self.clock.global_time()
    }

    /// Local clock time.
    pub fn local_time(&mut self) -> f64 {
        self.clock.local_time()
    }

    /// Round-trip statistics of recent clock probes, once synced.
    #[must_use]
    pub fn roundtrip(&self) -> Option<RoundTrip> {
        self.clock.roundtrip()
    }

    // ===== Sending and scheduling =====

    /// Send best effort: UDP when the message fits a datagram.
    ///
    /// Ownership transfers; on error the message is dropped.
    ///
    /// # Errors
    /// [`Error::UnknownService`], [`Error::NoClock`] for a timed send
    /// without sync, or a transport error.
    pub fn send(&mut self, msg: Message) -> Result<()> {
        self.route(msg, false)
    }

    /// Send reliably over TCP.
    ///
    /// # Errors
    /// As [`Process::send`].
    pub fn send_cmd(&mut self, msg: Message) -> Result<()> {
        self.route(msg, true)
    }

    /// Build and send in one call (best effort).
    ///
    /// # Errors
    /// As [`Process::send`], plus [`Error::Malformed`] for a bad
    /// address.
    pub fn send_args(
        &mut self,
        path: &str,
        time: f64,
        args: &[crate::msg::ArgView<'_>],
    ) -> Result<()> {
        let msg = codec::encode_message(time, path, args)?;
        self.route(msg, false)
    }

    /// Build and send in one call (reliable).
    ///
    /// # Errors
    /// As [`Process::send_args`].
    pub fn send_cmd_args(
        &mut self,
        path: &str,
        time: f64,
        args: &[crate::msg::ArgView<'_>],
    ) -> Result<()> {
        let msg = codec::encode_message(time, path, args)?;
        self.route(msg, true)
    }

    /// File a message directly under a scheduler, bypassing routing
    /// until it comes due.
    ///
    /// # Errors
    /// [`Error::NoClock`] for [`TimeBase::Global`] before sync; the
    /// message is dropped.
    pub fn schedule(&mut self, base: TimeBase, msg: Message) -> Result<()> {
        match base {
            TimeBase::Local => {
                let now = self.clock.local_time();
                if msg.timestamp() <= now {
                    self.route_now(msg, false)
                } else {
                    self.ltsched.insert(msg);
                    Ok(())
                }
            }
            TimeBase::Global => {
                let Some(now) = self.clock.global_time() else {
                    log::debug!("[o2] dropping scheduled message: no global time");
                    return Err(Error::NoClock);
                };
                self.position_gtsched(now);
                if msg.timestamp() <= now {
                    self.route_now(msg, false)
                } else {
                    self.gtsched.insert(msg);
                    Ok(())
                }
            }
        }
    }

    // ===== In-progress message (pooled builder slot) =====

    /// Begin the process-owned in-progress message. Any previous
    /// unfinished one is discarded. Not reentrant, like everything
    /// else here.
    ///
    /// # Errors
    /// [`Error::NoMemory`] when the pool is exhausted.
    pub fn start_message(&mut self) -> Result<()> {
        if let Some(old) = self.builder_slot.take() {
            log::debug!("[o2] discarding unfinished in-progress message");
            drop(old);
        }
        let buffer = self.pool.acquire(256)?;
        self.builder_slot = Some(MessageBuilder::with_buffer(buffer));
        Ok(())
    }

    /// The in-progress message begun by [`Process::start_message`].
    ///
    /// # Errors
    /// [`Error::Fail`] when none is in progress.
    pub fn message(&mut self) -> Result<&mut MessageBuilder> {
        self.builder_slot.as_mut().ok_or(Error::Fail)
    }

    /// Seal the in-progress message.
    ///
    /// # Errors
    /// [`Error::Fail`] when none is in progress; [`Error::Malformed`]
    /// for a bad address.
    pub fn finish_message(&mut self, time: f64, address: &str) -> Result<Message> {
        let builder = self.builder_slot.take().ok_or(Error::Fail)?;
        Ok(builder.finish(time, address)?)
    }

    /// Seal and send best effort.
    ///
    /// # Errors
    /// As [`Process::finish_message`] then [`Process::send`].
    pub fn finish_send(&mut self, time: f64, address: &str) -> Result<()> {
        let msg = self.finish_message(time, address)?;
        self.route(msg, false)
    }

    /// Seal and send reliably.
    ///
    /// # Errors
    /// As [`Process::finish_message`] then [`Process::send_cmd`].
    pub fn finish_send_cmd(&mut self, time: f64, address: &str) -> Result<()> {
        let msg = self.finish_message(time, address)?;
        self.route(msg, true)
    }

    // ===== The poll loop =====

    /// One pump of the engine: drain sockets, tick discovery and the
    /// clock, sweep both schedulers, drain pending dispatches.
    ///
    /// # Errors
    /// Only unrecoverable poll failures; per-message and per-peer
    /// problems are handled internally.
    pub fn poll(&mut self) -> Result<()> {
        // 1. I/O.
        let mut events = Vec::new();
        self.transports.poll_io(&mut events)?;
        for event in events {
            self.handle_event(event);
        }

        let now = self.clock.local_time();

        // 2. Discovery tick.
        if self.disc_timer.due(now) {
            let dgram = self.announcement().to_message(DISCOVERY_ADDRESS);
            self.transports.broadcast(&dgram.to_wire());
            self.disc_timer.sent(now);
            log::trace!(
                "[disc] broadcast sent; next in {:.1}s",
                self.disc_timer.period()
            );
        }
        for peer_id in self.peers.expired(now) {
            log::info!("[peers] {} timed out", peer_id);
            self.drop_peer(&peer_id);
        }

        // 3. Clock tick.
        if let Some(serial) = self.clock.probe_due(now) {
            self.send_clock_probe(serial);
        }
        self.clock.tick(now);
        self.announce_sync_if_changed();

        // 4. Local-time sweep.
        let mut due = Vec::new();
        self.ltsched.sweep(now, &mut due);

        // 5. Global-time sweep.
        if let Some(gnow) = self.clock.global_time() {
            self.position_gtsched(gnow);
            self.gtsched.sweep(gnow, &mut due);
        }
        for msg in due {
            if let Err(e) = self.route_now(msg, false) {
                log::debug!("[o2] dropping due message: {}", e);
            }
        }

        // 6. Pending dispatches from handlers.
        self.drain_pending();
        Ok(())
    }

    /// Call [`Process::poll`] at `rate_hz` until [`Process::stop`] or
    /// a handler's [`Outbox::stop`].
    ///
    /// # Errors
    /// [`Error::AlreadyRunning`] when nested; otherwise as `poll`.
    pub fn run(&mut self, rate_hz: u32) -> Result<()> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }
        self.running = true;
        self.stop_flag = false;
        let interval = Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1)));
        let result = loop {
            if self.stop_flag {
                break Ok(());
            }
            if let Err(e) = self.poll() {
                break Err(e);
            }
            std::thread::sleep(interval);
        };
        self.running = false;
        result
    }

    /// Make [`Process::run`] return after its current iteration.
    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    /// Tear everything down in reverse: schedulers, connections,
    /// sockets, directory.
    pub fn finish(mut self) {
        log::info!("[o2] shutting down {}", self.peer_id);
        self.pending.clear();
        self.gtsched.clear();
        self.ltsched.clear();
        self.transports.close_all();
        // Directory, peers, and sockets drop with the handle.
    }

    // ===== Routing =====

    /// Route one message under the sending rules: a timed message
    /// needs global time, a future local delivery files under the
    /// global wheel, a remote target is forwarded right away with its
    /// timestamp intact.
    fn route(&mut self, msg: Message, reliable: bool) -> Result<()> {
        let ts = msg.timestamp();
        if ts > 0.0 && !self.clock.synced() {
            log::debug!(
                "[o2] dropping timed message {:?}: no clock sync",
                msg.address()
            );
            return Err(Error::NoClock);
        }
        match self.resolve(msg.address())? {
            Target::Local => {
                if ts > 0.0 {
                    // Checked synced above; file or run.
                    let gnow = self.clock.global_time().ok_or(Error::NoClock)?;
                    self.position_gtsched(gnow);
                    if ts > gnow {
                        self.gtsched.insert(msg);
                        return Ok(());
                    }
                }
                self.deliver_or_defer(msg);
                Ok(())
            }
            Target::Peer(peer_id) => self.forward(&peer_id, &msg, reliable),
        }
    }

    /// Route a message that is already due (popped from a wheel): no
    /// timing rules apply, it dispatches or forwards immediately.
    fn route_now(&mut self, msg: Message, reliable: bool) -> Result<()> {
        match self.resolve(msg.address())? {
            Target::Local => {
                self.deliver_or_defer(msg);
                Ok(())
            }
            Target::Peer(peer_id) => self.forward(&peer_id, &msg, reliable),
        }
    }

    /// Who serves the first segment of `address`.
    fn resolve(&self, address: &str) -> Result<Target> {
        let segs = path::segments(address);
        let Some(service) = segs.first() else {
            return Err(Error::Fail);
        };
        match self.directory.entry(service) {
            Some(ServiceEntry::Local(_)) => Ok(Target::Local),
            Some(ServiceEntry::Remote { peer_id }) => Ok(Target::Peer(peer_id.clone())),
            Some(ServiceEntry::Bridge | ServiceEntry::OscOut) => Err(Error::Fail),
            None => Err(Error::UnknownService((*service).to_string())),
        }
    }

    /// Forward a message to a peer, choosing UDP or TCP.
    fn forward(&mut self, peer_id: &str, msg: &Message, reliable: bool) -> Result<()> {
        let Some(peer) = self.peers.get(peer_id) else {
            return Err(Error::UnknownService(msg.address().to_string()));
        };
        let wire = msg.to_wire();
        if reliable || wire.len() > UDP_MESSAGE_LIMIT {
            let Some(conn) = peer.conn else {
                log::debug!("[o2] no connection to {} yet; dropping", peer_id);
                return Err(Error::Fail);
            };
            if let Err(e) = self.transports.send_frame(conn, &wire) {
                log::debug!("[net] send to {} failed: {}", peer_id, e);
                self.drop_peer_conn(conn);
                return Err(Error::TcpHangup);
            }
            Ok(())
        } else {
            let addr = peer.udp_addr();
            self.transports.send_udp(&wire, addr)?;
            Ok(())
        }
    }

    /// Dispatch now, or queue when already inside a handler.
    fn deliver_or_defer(&mut self, msg: Message) {
        if self.in_dispatch {
            self.pending.push_back(Pending::Send {
                msg,
                reliable: false,
            });
        } else {
            self.dispatch_local(&msg);
            self.pool.release(msg.into_body());
        }
    }

    /// Run the directory pipeline over a message.
    fn dispatch_local(&mut self, msg: &Message) {
        self.in_dispatch = true;
        let local_now = self.clock.local_time();
        let global_now = self.clock.global_time();
        let Process {
            directory, pending, ..
        } = self;
        let mut outbox = Outbox::new(pending, local_now, global_now);
        directory.dispatch(msg, &mut outbox);
        self.in_dispatch = false;
    }

    fn drain_pending(&mut self) {
        while let Some(item) = self.pending.pop_front() {
            match item {
                Pending::Send { msg, reliable } => {
                    if let Err(e) = self.route(msg, reliable) {
                        log::debug!("[o2] dropping handler-sent message: {}", e);
                    }
                }
                Pending::Schedule { base, msg } => {
                    if let Err(e) = self.schedule(base, msg) {
                        log::debug!("[o2] dropping handler-scheduled message: {}", e);
                    }
                }
                Pending::Stop => self.stop_flag = true,
            }
        }
    }

    // ===== Transport events =====

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Datagram {
                data,
                source,
                discovery,
            } => self.handle_datagram(&data, source, discovery),
            TransportEvent::Accepted { conn, remote } => {
                // Identity arrives with the hello frame.
                log::debug!("[net] awaiting hello from {} on conn {}", remote, conn);
            }
            TransportEvent::Connected { conn } => {
                self.hello_sent.insert(conn);
                self.send_handshake(conn);
            }
            TransportEvent::Frame { conn, data } => {
                let now = self.clock.local_time();
                self.peers.heard_on_conn(conn, now);
                self.handle_wire(&data, None, Some(conn));
            }
            TransportEvent::Closed { conn } => self.drop_peer_conn(conn),
        }
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddr, discovery: bool) {
        if discovery {
            match codec::decode_message(data) {
                Ok(msg) if msg.address() == DISCOVERY_ADDRESS => {
                    if let Some(ann) = Announcement::from_message(&msg) {
                        self.handle_announcement(&ann, source);
                    }
                }
                Ok(msg) => log::debug!("[disc] unexpected {:?}", msg.address()),
                Err(e) => log::debug!("[disc] malformed datagram: {}", e),
            }
            return;
        }
        self.handle_wire(data, Some(source), None);
    }

    /// Decode one wire image (message or bundle) and feed it in.
    fn handle_wire(&mut self, data: &[u8], source: Option<SocketAddr>, conn: Option<ConnId>) {
        if codec::is_bundle(data) {
            match codec::decode_bundle(data) {
                Ok(msgs) => {
                    for msg in msgs {
                        self.handle_incoming(msg, source, conn);
                    }
                }
                Err(e) => log::debug!("[o2] malformed bundle: {}", e),
            }
            return;
        }
        match codec::decode_message(data) {
            Ok(msg) => self.handle_incoming(msg, source, conn),
            Err(e) => log::debug!("[o2] malformed message: {}", e),
        }
    }

    fn handle_incoming(&mut self, msg: Message, source: Option<SocketAddr>, conn: Option<ConnId>) {
        if is_system_address(msg.address()) {
            self.handle_system(&msg, source, conn);
            return;
        }
        if let Err(e) = self.route(msg, false) {
            log::debug!("[o2] dropping incoming message: {}", e);
        }
    }

    // ===== Discovery and handshake =====

    fn announcement(&self) -> Announcement {
        Announcement {
            ensemble: self.ensemble.clone(),
            peer_id: self.peer_id.clone(),
            udp_port: self.transports.data_port(),
            tcp_port: self.transports.tcp_port(),
            candidate: self.clock.is_candidate(),
        }
    }

    fn handle_announcement(&mut self, ann: &Announcement, source: SocketAddr) {
        if ann.ensemble != self.ensemble {
            log::trace!("[disc] ignoring ensemble {:?}", ann.ensemble);
            return;
        }
        if ann.peer_id == self.peer_id {
            return; // our own broadcast looped back
        }
        let now = self.clock.local_time();
        self.peers.upsert(
            &ann.peer_id,
            source.ip(),
            ann.udp_port,
            ann.tcp_port,
            ann.candidate,
            now,
        );
        let unconnected = self
            .peers
            .get(&ann.peer_id)
            .is_some_and(|p| p.conn.is_none());
        if unconnected {
            if discovery::we_dial(&self.peer_id, &ann.peer_id) {
                let addr = SocketAddr::from((source.ip(), ann.tcp_port));
                match self.transports.connect(addr) {
                    Ok(conn) => self.peers.attach_conn(&ann.peer_id, conn),
                    Err(e) => log::warn!("[net] dial {} failed: {}", ann.peer_id, e),
                }
            } else {
                // The other side dials; answer with a unicast copy of
                // our announcement in case our broadcasts miss it.
                let reply = self.announcement().to_message(DISCOVERY_ADDRESS);
                let dest = SocketAddr::from((source.ip(), ann.udp_port));
                if let Err(e) = self.transports.send_udp(&reply.to_wire(), dest) {
                    log::debug!("[disc] unicast reply to {} failed: {}", dest, e);
                }
            }
        }
        self.run_election();
    }

    /// Hello, full service list, and sync status down one connection.
    fn send_handshake(&mut self, conn: ConnId) {
        let hello = self.announcement().to_message(HELLO_ADDRESS);
        let list = self.service_list_message();
        let status = self.sync_status_message();
        for msg in [hello, list, status] {
            if let Err(e) = self.transports.send_frame(conn, &msg.to_wire()) {
                log::debug!("[net] handshake on conn {} failed: {}", conn, e);
                self.drop_peer_conn(conn);
                return;
            }
        }
    }

    fn handle_hello(&mut self, ann: &Announcement, conn: ConnId) {
        if ann.ensemble != self.ensemble || ann.peer_id == self.peer_id {
            log::debug!("[net] closing conn {}: bad hello", conn);
            self.transports.close(conn);
            return;
        }
        let Some(remote) = self.transports.peer_addr(conn) else {
            return;
        };
        let now = self.clock.local_time();
        self.peers.upsert(
            &ann.peer_id,
            remote.ip(),
            ann.udp_port,
            ann.tcp_port,
            ann.candidate,
            now,
        );
        self.peers.attach_conn(&ann.peer_id, conn);
        if self.hello_sent.insert(conn) {
            // We accepted this connection; answer with our own half of
            // the handshake.
            self.send_handshake(conn);
        }
        self.run_election();
    }

    // ===== System messages =====

    fn handle_system(&mut self, msg: &Message, source: Option<SocketAddr>, conn: Option<ConnId>) {
        let segs = path::segments(msg.address());
        match segs.get(1..) {
            Some(["dy"]) => {
                if let (Some(ann), Some(source)) = (Announcement::from_message(msg), source) {
                    self.handle_announcement(&ann, source);
                }
            }
            Some(["in"]) => {
                if let (Some(ann), Some(conn)) = (Announcement::from_message(msg), conn) {
                    self.handle_hello(&ann, conn);
                }
            }
            Some(["sv"]) => self.handle_service_list(msg, conn),
            Some(["sv", "add"]) => self.handle_service_change(msg, true),
            Some(["sv", "rm"]) => self.handle_service_change(msg, false),
            Some(["cs", "get"]) => self.handle_clock_probe(msg, source, conn),
            Some(["cs", "put"]) => self.handle_clock_reply(msg),
            Some(["cs", "st"]) => self.handle_sync_status(msg),
            _ => log::debug!("[o2] unknown system message {:?}", msg.address()),
        }
    }

    fn handle_service_list(&mut self, msg: &Message, conn: Option<ConnId>) {
        let mut ex = msg.extract();
        let Some(peer_id) = ex.get_next(TypeCode::String).and_then(|a| a.str()) else {
            return;
        };
        let peer_id = peer_id.to_string();
        if let Some(conn) = conn {
            if self.peers.id_by_conn(conn) != Some(peer_id.as_str()) {
                log::debug!("[o2] service list from unpaired connection; ignoring");
                return;
            }
        }
        let mut offered = BTreeSet::new();
        while let Some(name) = ex.get_next(TypeCode::String).and_then(|a| a.str()) {
            offered.insert(name.to_string());
        }
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let previous = std::mem::replace(&mut peer.services, offered.clone());
        for name in previous.difference(&offered) {
            self.directory.remove_remote(name, &peer_id);
        }
        for name in offered.difference(&previous) {
            self.directory.add_remote(name, &peer_id);
        }
        log::debug!("[o2] {} offers {:?}", peer_id, offered);
    }

    fn handle_service_change(&mut self, msg: &Message, added: bool) {
        let mut ex = msg.extract();
        let Some(peer_id) = ex.get_next(TypeCode::String).and_then(|a| a.str()) else {
            return;
        };
        let Some(name) = ex.get_next(TypeCode::String).and_then(|a| a.str()) else {
            return;
        };
        let (peer_id, name) = (peer_id.to_string(), name.to_string());
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if added {
            peer.services.insert(name.clone());
            self.directory.add_remote(&name, &peer_id);
        } else {
            peer.services.remove(&name);
            self.directory.remove_remote(&name, &peer_id);
        }
    }

    fn handle_clock_probe(
        &mut self,
        msg: &Message,
        source: Option<SocketAddr>,
        conn: Option<ConnId>,
    ) {
        if !self.clock.is_master() {
            return;
        }
        let mut ex = msg.extract();
        let Some(serial) = ex.get_next(TypeCode::Int32).and_then(|a| a.i32()) else {
            return;
        };
        let Some(reply_to) = ex.get_next(TypeCode::String).and_then(|a| a.str()) else {
            return;
        };
        let mut b = MessageBuilder::new();
        b.add_int32(serial).add_double(self.clock.master_time());
        let Ok(reply) = b.finish(0.0, reply_to) else {
            return;
        };
        let wire = reply.to_wire();
        if let Some(addr) = source {
            if let Err(e) = self.transports.send_udp(&wire, addr) {
                log::debug!("[clock] probe reply to {} failed: {}", addr, e);
            }
        } else if let Some(conn) = conn {
            let _ = self.transports.send_frame(conn, &wire);
        }
    }

    fn handle_clock_reply(&mut self, msg: &Message) {
        let mut ex = msg.extract();
        let Some(serial) = ex.get_next(TypeCode::Int32).and_then(|a| a.i32()) else {
            return;
        };
        let Some(master_time) = ex.get_next(TypeCode::Double).and_then(|a| a.f64()) else {
            return;
        };
        let now = self.clock.local_time();
        self.clock.handle_reply(serial, master_time, now);
        self.announce_sync_if_changed();
    }

    fn handle_sync_status(&mut self, msg: &Message) {
        let mut ex = msg.extract();
        let Some(peer_id) = ex.get_next(TypeCode::String).and_then(|a| a.str()) else {
            return;
        };
        let peer_id = peer_id.to_string();
        let Some(synced) = ex.get_next(TypeCode::Bool).and_then(|a| a.bool()) else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.synced = synced;
            log::debug!("[clock] {} sync status: {}", peer_id, synced);
        }
    }

    // ===== Clock plumbing =====

    fn send_clock_probe(&mut self, serial: i32) {
        let Some(master_id) = self.clock.master_id().map(str::to_string) else {
            return;
        };
        let Some(peer) = self.peers.get(&master_id) else {
            return;
        };
        let addr = peer.udp_addr();
        let mut b = MessageBuilder::new();
        b.add_int32(serial).add_string("!_o2/cs/put");
        let Ok(probe) = b.finish(0.0, "!_o2/cs/get") else {
            return;
        };
        if let Err(e) = self.transports.send_udp(&probe.to_wire(), addr) {
            log::debug!("[clock] probe to {} failed: {}", master_id, e);
        } else {
            log::trace!("[clock] probe {} -> {}", serial, master_id);
        }
    }

    fn announce_sync_if_changed(&mut self) {
        let synced = self.clock.synced();
        if synced == self.announced_sync {
            return;
        }
        self.announced_sync = synced;
        if let Some(gnow) = self.clock.global_time() {
            self.position_gtsched(gnow);
        }
        let status = self.sync_status_message();
        self.send_to_all_peers(&status);
    }

    fn sync_status_message(&self) -> Message {
        let mut b = MessageBuilder::new();
        b.add_string(&self.peer_id).add_bool(self.clock.synced());
        // System addresses are constant and well-formed.
        b.finish(0.0, "!_o2/cs/st")
            .expect("system message encoding is infallible")
    }

    fn service_list_message(&self) -> Message {
        let mut b = MessageBuilder::new();
        b.add_string(&self.peer_id);
        for name in self.directory.local_names() {
            if name != SYSTEM_SERVICE {
                b.add_string(&name);
            }
        }
        b.finish(0.0, "!_o2/sv")
            .expect("system message encoding is infallible")
    }

    fn replicate_service_change(&mut self, address: &str, name: &str) {
        let mut b = MessageBuilder::new();
        b.add_string(&self.peer_id).add_string(name);
        let Ok(msg) = b.finish(0.0, address) else {
            return;
        };
        self.send_to_all_peers(&msg);
    }

    fn send_to_all_peers(&mut self, msg: &Message) {
        let wire = msg.to_wire();
        let conns: Vec<ConnId> = self.peers.conn_ids().collect();
        for conn in conns {
            if let Err(e) = self.transports.send_frame(conn, &wire) {
                log::debug!("[net] replication on conn {} failed: {}", conn, e);
                self.drop_peer_conn(conn);
            }
        }
    }

    fn run_election(&mut self) {
        let Process {
            clock,
            peers,
            peer_id,
            ..
        } = self;
        let mut winner: Option<&str> = clock.is_candidate().then_some(peer_id.as_str());
        for id in peers.candidate_ids() {
            if winner.map_or(true, |w| id < w) {
                winner = Some(id);
            }
        }
        let winner = winner.map(str::to_string);
        clock.elect(winner.as_deref(), peer_id);
        self.announce_sync_if_changed();
    }

    fn position_gtsched(&mut self, gnow: f64) {
        if !self.gtsched_positioned {
            self.gtsched.reposition(gnow);
            self.gtsched_positioned = true;
        }
    }

    // ===== Peer teardown =====

    /// A connection died: tear down the peer behind it, if any.
    fn drop_peer_conn(&mut self, conn: ConnId) {
        self.hello_sent.remove(&conn);
        let peer_id = self.peers.id_by_conn(conn).map(str::to_string);
        self.transports.close(conn);
        if let Some(peer_id) = peer_id {
            log::info!("[peers] connection to {} closed", peer_id);
            self.drop_peer(&peer_id);
        }
    }

    fn drop_peer(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.remove(peer_id) {
            if let Some(conn) = peer.conn {
                self.hello_sent.remove(&conn);
                self.transports.close(conn);
            }
            let dropped = self.directory.remove_peer(peer_id);
            if !dropped.is_empty() {
                log::info!("[peers] {} took services {:?}", peer_id, dropped);
            }
            self.run_election();
        }
    }
}

/// System messages live under the reserved `_o2` service.
fn is_system_address(address: &str) -> bool {
    path::segments(address).first() == Some(&SYSTEM_SERVICE)
}

/// Service names are plain ASCII path segments.
fn valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.is_ascii()
        && !name.contains('/')
        && name != SYSTEM_SERVICE
        && !path::pattern::has_pattern_chars(name)
}
