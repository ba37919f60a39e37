// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! # O2 - realtime communication for interactive music and media
//!
//! A communication substrate for cooperating processes on a local
//! network. Processes join a named *ensemble*, discover one another
//! automatically, publish named *services*, and exchange type-tagged,
//! hierarchically addressed messages either immediately or at a
//! specified global wall-clock instant. One process is elected clock
//! master; the others discipline their clocks to it so timestamped
//! messages dispatch with bounded jitter.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use o2::{ArgView, Process, Result};
//!
//! fn main() -> Result<()> {
//!     let mut proc = Process::initialize("jam")?;
//!     proc.add_service("synth")?;
//!     proc.add_method("/synth/vol", Some("f"), true, true,
//!         Box::new(|_outbox, d| {
//!             let vol = d.args.expect("parsed")[0].f32().expect("float");
//!             println!("volume -> {vol}");
//!         }))?;
//!
//!     proc.send_args("/synth/vol", 0.0, &[ArgView::Float(0.5)])?;
//!     proc.run(500) // poll at 500 Hz until a handler stops us
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Process::poll()                        |
//! |   sockets -> discovery -> clock -> ltsched -> gtsched -> drain|
//! +--------------------------------------------------------------+
//! |  Directory          |  Peer table        |  Clock             |
//! |  services + method  |  endpoints, offers,|  election, probes, |
//! |  trie dispatch      |  liveness          |  skew discipline   |
//! +--------------------------------------------------------------+
//! |  Schedulers (x2)    |  Wire codec        |  Message pool      |
//! |  128-bin wheels     |  OSC-compatible    |  size-classed over |
//! |  local/global time  |  body + bundles    |  a pluggable heap  |
//! +--------------------------------------------------------------+
//! |  Transport: discovery UDP | data UDP | framed TCP (mio poll)  |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Process`] | One participant: services, peers, clock, schedulers |
//! | [`Message`] | Timestamp plus OSC-compatible wire body |
//! | [`MessageBuilder`] | Incremental, typed message construction |
//! | [`ArgView`] | One decoded argument, borrowing from its message |
//! | [`Outbox`] | What handlers use to emit messages without recursion |
//! | [`Status`] | Service status; ordering is part of the contract |
//!
//! ## Concurrency model
//!
//! Single-threaded and cooperative: everything runs inside
//! [`Process::poll`] on the calling thread. There are no internal
//! locks; handlers must not re-enter the loop, and anything they send
//! is queued and drained after the sweep. Rates of 200-1000 Hz are
//! recommended where rhythmic accuracy matters.

/// Clock subsystem: local/global time, election, sync discipline.
pub mod clock;
/// Compile-time protocol constants (ports, periods, wheel geometry).
pub mod config;
/// Service directory and the dispatch pipeline.
pub mod directory;
/// Discovery datagrams, broadcast cadence, peer ids.
pub mod discovery;
/// Errors, numeric return codes, and service status.
pub mod error;
/// Messages: codec, builder, extraction, pooling.
pub mod msg;
/// Address paths, the method trie, OSC pattern matching.
pub mod path;
/// The peer table.
pub mod peers;
/// The process handle and poll loop.
pub mod process;
/// The timing wheels.
pub mod sched;
/// Sockets, readiness polling, TCP framing.
pub mod transport;

pub use clock::{MonotonicClock, RoundTrip, TimeSource};
pub use directory::Delivery;
pub use error::{Error, Result, Status};
pub use msg::{ArgView, Blob, Heap, Message, MessageBuilder, SystemHeap, TypeCode};
pub use path::Handler;
pub use process::{Outbox, Process, ProcessBuilder, TimeBase};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
