// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Service directory and the local dispatch pipeline.
//!
//! Maps each service name to a local method trie or to the peer that
//! provides it. Local dispatch expands OSC patterns against the trie,
//! gates each method on its typespec (with optional lossless coercion),
//! materializes an argument vector when asked, and invokes handlers in
//! insertion order.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::msg::extract::coerce;
use crate::msg::{ArgView, Message, TypeCode};
use crate::path::{self, Handler, Method, PathNode};
use crate::process::Outbox;

/// What a delivered message looks like from inside a handler.
#[derive(Debug)]
pub struct Delivery<'m> {
    /// The message being delivered. Do not retain it past the call.
    pub msg: &'m Message,
    /// Effective typetag: the method's typespec when one was given
    /// (coerced arguments follow it), otherwise the message's own.
    pub types: &'m str,
    /// Materialized arguments when the method asked for parsing;
    /// `None` means the handler extracts arguments itself.
    pub args: Option<&'m [ArgView<'m>]>,
}

/// One entry in the directory.
#[derive(Debug)]
pub enum ServiceEntry {
    /// Served by this process through a method trie.
    Local(PathNode),
    /// Served by a peer; messages are forwarded unchanged.
    Remote {
        /// The providing peer's id.
        peer_id: String,
    },
    /// Reserved: served through a non-IP bridge.
    Bridge,
    /// Reserved: forwarded to an OSC server.
    OscOut,
}

/// The process-local service table.
#[derive(Debug, Default)]
pub struct Directory {
    services: HashMap<String, ServiceEntry>,
}

impl Directory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a service entry.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    /// Register a local service.
    ///
    /// # Errors
    /// [`Error::Fail`] when the name is already taken (one entry per
    /// name per process).
    pub fn add_local(&mut self, name: &str) -> Result<()> {
        if self.services.contains_key(name) {
            return Err(Error::Fail);
        }
        self.services
            .insert(name.to_string(), ServiceEntry::Local(PathNode::default()));
        Ok(())
    }

    /// Register a service offered by a peer. A name already present
    /// stays as it is (first provider wins).
    pub fn add_remote(&mut self, name: &str, peer_id: &str) {
        if let Some(existing) = self.services.get(name) {
            log::warn!(
                "[dir] service {:?} already {}; ignoring offer from {}",
                name,
                match existing {
                    ServiceEntry::Local(_) => "local",
                    ServiceEntry::Remote { .. } => "remote",
                    ServiceEntry::Bridge => "bridged",
                    ServiceEntry::OscOut => "an OSC forwarder",
                },
                peer_id
            );
            return;
        }
        self.services.insert(
            name.to_string(),
            ServiceEntry::Remote {
                peer_id: peer_id.to_string(),
            },
        );
    }

    /// Remove one service by name. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    /// Remove a specific peer's offer of `name`; another provider's
    /// entry (or a local one) is left alone.
    pub fn remove_remote(&mut self, name: &str, peer_id: &str) {
        if matches!(self.services.get(name),
                    Some(ServiceEntry::Remote { peer_id: p }) if p == peer_id)
        {
            self.services.remove(name);
        }
    }

    /// Drop every service the given peer provided, returning their
    /// names.
    pub fn remove_peer(&mut self, peer_id: &str) -> Vec<String> {
        let doomed: Vec<String> = self
            .services
            .iter()
            .filter(|(_, e)| matches!(e, ServiceEntry::Remote { peer_id: p } if p == peer_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &doomed {
            self.services.remove(name);
        }
        doomed
    }

    /// Names of the services this process itself offers.
    #[must_use]
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter(|(_, e)| matches!(e, ServiceEntry::Local(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Install a handler at `path` (which includes the service as its
    /// first segment).
    ///
    /// # Errors
    /// [`Error::UnknownService`] when the first segment is not a local
    /// service; [`Error::Fail`] for an empty or pattern-bearing path.
    pub fn add_method(
        &mut self,
        full_path: &str,
        typespec: Option<&str>,
        coerce: bool,
        parse: bool,
        handler: Handler,
    ) -> Result<()> {
        let segs = path::segments(full_path);
        let Some((service, rest)) = segs.split_first() else {
            return Err(Error::Fail);
        };
        if segs.iter().any(|s| path::pattern::has_pattern_chars(s)) {
            // Patterns live in message addresses, not method paths.
            return Err(Error::Fail);
        }
        match self.services.get_mut(*service) {
            Some(ServiceEntry::Local(root)) => {
                root.insert(
                    rest,
                    Method {
                        typespec: typespec.map(str::to_string),
                        coerce,
                        parse,
                        handler,
                    },
                );
                Ok(())
            }
            Some(_) => Err(Error::Fail),
            None => Err(Error::UnknownService((*service).to_string())),
        }
    }

    /// Deliver a message to every matching local method. Returns the
    /// number of handlers invoked.
    pub fn dispatch(&mut self, msg: &Message, outbox: &mut Outbox<'_>) -> usize {
        let address = msg.address();
        let segs = path::segments(address);
        let Some((service, rest)) = segs.split_first() else {
            log::debug!("[dir] dropping message with empty address");
            return 0;
        };
        let Some(ServiceEntry::Local(root)) = self.services.get_mut(*service) else {
            log::debug!("[dir] no local service for {:?}", address);
            return 0;
        };
        let literal = path::is_literal(address);
        let mut invoked = 0;
        for node_path in root.matches(rest, literal) {
            let Some(node) = root.node_mut(&node_path) else {
                continue;
            };
            for method in &mut node.methods {
                if invoke_method(method, msg, outbox) {
                    invoked += 1;
                }
            }
        }
        if invoked == 0 {
            log::debug!("[dir] no method matched {:?}", address);
        }
        invoked
    }
}

/// Gate one method and call it. Returns whether the handler ran.
fn invoke_method(method: &mut Method, msg: &Message, outbox: &mut Outbox<'_>) -> bool {
    let Method {
        typespec,
        coerce: allow_coerce,
        parse,
        handler,
    } = method;

    let msg_types = msg.types();
    let mut coerced: Option<Vec<ArgView<'_>>> = None;
    let effective: &str = match typespec.as_deref() {
        None => msg_types,
        Some(spec) if spec == msg_types => spec,
        Some(spec) => {
            if !*allow_coerce {
                return false;
            }
            match coerce_args(msg, spec) {
                Some(views) => {
                    coerced = Some(views);
                    spec
                }
                None => return false,
            }
        }
    };

    let argv: Option<Vec<ArgView<'_>>> = if *parse {
        match coerced {
            Some(views) => Some(views),
            None => match collect_args(msg) {
                Some(views) => Some(views),
                None => return false,
            },
        }
    } else {
        None
    };

    let delivery = Delivery {
        msg,
        types: effective,
        args: argv.as_deref(),
    };
    handler(outbox, &delivery);
    true
}

/// Coerce every argument to `spec`, or `None` when counts differ or
/// any conversion would lose information.
fn coerce_args<'m>(msg: &'m Message, spec: &str) -> Option<Vec<ArgView<'m>>> {
    if spec.len() != msg.types().len() {
        return None;
    }
    let mut ex = msg.extract();
    let mut out = Vec::with_capacity(spec.len());
    for want in spec.bytes() {
        let code = TypeCode::from_u8(want)?;
        let raw = ex.next_value()?;
        out.push(coerce(raw, code)?);
    }
    Some(out)
}

/// All arguments in stored order, or `None` on a malformed body.
fn collect_args(msg: &Message) -> Option<Vec<ArgView<'_>>> {
    let mut ex = msg.extract();
    let count = ex.arg_count();
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(ex.next_value()?);
    }
    Some(out)
}
