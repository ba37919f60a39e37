// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Messages: type codes, argument views, and the message record itself.
//!
//! A [`Message`] is a delivery timestamp plus a flat wire body laid out
//! exactly as it travels: NUL-padded address, NUL-padded `,`-prefixed
//! typetag, then the arguments with per-type padding. Keeping the wire
//! image flat means receive is a validation pass, send is a copy, and
//! argument access is cursor arithmetic.

pub mod builder;
pub mod codec;
pub mod cursor;
pub mod extract;
pub mod pool;

pub use builder::MessageBuilder;
pub use extract::Extractor;
pub use pool::{Heap, MessagePool, SystemHeap};

use crate::error::WireError;
use cursor::{pad4, ReadCursor, WriteCursor};

/// One data item's type code, as it appears in a typetag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    /// 32-bit signed integer.
    Int32 = b'i',
    /// 32-bit IEEE-754 float.
    Float = b'f',
    /// NUL-terminated string.
    String = b's',
    /// Binary large object.
    Blob = b'b',
    /// 64-bit signed integer.
    Int64 = b'h',
    /// Time tag (seconds, as a double).
    Time = b't',
    /// 64-bit IEEE-754 double.
    Double = b'd',
    /// Symbol; a string in systems that distinguish the two.
    Symbol = b'S',
    /// 8-bit character carried as a 32-bit int.
    Char = b'c',
    /// 4-byte MIDI packet.
    Midi = b'm',
    /// True; carries no payload.
    True = b'T',
    /// False; carries no payload.
    False = b'F',
    /// Nil; carries no payload.
    Nil = b'N',
    /// Infinitum; carries no payload.
    Infinitum = b'I',
    /// Boolean carried as a 32-bit 0/1.
    Bool = b'B',
}

impl TypeCode {
    /// Decode a typetag byte.
    #[must_use]
    pub fn from_u8(c: u8) -> Option<TypeCode> {
        Some(match c {
            b'i' => TypeCode::Int32,
            b'f' => TypeCode::Float,
            b's' => TypeCode::String,
            b'b' => TypeCode::Blob,
            b'h' => TypeCode::Int64,
            b't' => TypeCode::Time,
            b'd' => TypeCode::Double,
            b'S' => TypeCode::Symbol,
            b'c' => TypeCode::Char,
            b'm' => TypeCode::Midi,
            b'T' => TypeCode::True,
            b'F' => TypeCode::False,
            b'N' => TypeCode::Nil,
            b'I' => TypeCode::Infinitum,
            b'B' => TypeCode::Bool,
            _ => return None,
        })
    }

    /// The typetag byte for this code.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A view of one decoded argument, borrowing string and blob payloads
/// from the message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgView<'m> {
    /// `i`
    Int32(i32),
    /// `h`
    Int64(i64),
    /// `f`
    Float(f32),
    /// `d`
    Double(f64),
    /// `t`
    Time(f64),
    /// `s`
    Str(&'m str),
    /// `S`
    Symbol(&'m str),
    /// `c`
    Char(char),
    /// `m`
    Midi([u8; 4]),
    /// `b`
    Blob(&'m [u8]),
    /// `B`
    Bool(bool),
    /// `T`
    True,
    /// `F`
    False,
    /// `N`
    Nil,
    /// `I`
    Infinitum,
}

impl<'m> ArgView<'m> {
    /// The `i` value, if this argument is an `Int32`.
    #[must_use]
    pub fn i32(&self) -> Option<i32> {
        match self {
            ArgView::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// The `h` value, if this argument is an `Int64`.
    #[must_use]
    pub fn i64(&self) -> Option<i64> {
        match self {
            ArgView::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// The `f` value, if this argument is a `Float`.
    #[must_use]
    pub fn f32(&self) -> Option<f32> {
        match self {
            ArgView::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// The `d` or `t` value, if this argument is a `Double` or `Time`.
    #[must_use]
    pub fn f64(&self) -> Option<f64> {
        match self {
            ArgView::Double(v) | ArgView::Time(v) => Some(*v),
            _ => None,
        }
    }

    /// The string payload, if this argument is a `Str` or `Symbol`.
    #[must_use]
    pub fn str(&self) -> Option<&'m str> {
        match self {
            ArgView::Str(s) | ArgView::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// The blob payload, if this argument is a `Blob`.
    #[must_use]
    pub fn blob(&self) -> Option<&'m [u8]> {
        match self {
            ArgView::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// The boolean, if this argument is a `Bool`, `True`, or `False`.
    #[must_use]
    pub fn bool(&self) -> Option<bool> {
        match self {
            ArgView::Bool(v) => Some(*v),
            ArgView::True => Some(true),
            ArgView::False => Some(false),
            _ => None,
        }
    }

    /// The wire type code of this argument.
    #[must_use]
    pub fn type_code(&self) -> TypeCode {
        match self {
            ArgView::Int32(_) => TypeCode::Int32,
            ArgView::Int64(_) => TypeCode::Int64,
            ArgView::Float(_) => TypeCode::Float,
            ArgView::Double(_) => TypeCode::Double,
            ArgView::Time(_) => TypeCode::Time,
            ArgView::Str(_) => TypeCode::String,
            ArgView::Symbol(_) => TypeCode::Symbol,
            ArgView::Char(_) => TypeCode::Char,
            ArgView::Midi(_) => TypeCode::Midi,
            ArgView::Blob(_) => TypeCode::Blob,
            ArgView::Bool(_) => TypeCode::Bool,
            ArgView::True => TypeCode::True,
            ArgView::False => TypeCode::False,
            ArgView::Nil => TypeCode::Nil,
            ArgView::Infinitum => TypeCode::Infinitum,
        }
    }
}

/// Binary large object, attachable to a message with the `b` type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob {
    /// The payload bytes.
    pub data: Vec<u8>,
}

impl Blob {
    /// Allocate a blob with `size` zeroed bytes.
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            data: vec![0; size as usize],
        }
    }

    /// Wrap existing bytes.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// An O2 message: a delivery timestamp and its validated wire body.
///
/// The body holds the address, typetag, and arguments exactly as sent.
/// Construction always validates, so accessors are infallible.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    timestamp: f64,
    /// Offset of the `,` introducing the typetag.
    tag_off: u32,
    /// Offset of the first argument byte.
    args_off: u32,
    body: Vec<u8>,
}

impl Message {
    /// Build a message from a timestamp and a wire body
    /// (address + typetag + arguments), validating the framing.
    ///
    /// # Errors
    /// [`WireError`] if the address or typetag framing is broken. The
    /// arguments are validated lazily by extraction; a truncated
    /// argument shows up there (and in [`codec::validate_args`]).
    pub fn from_parts(timestamp: f64, body: Vec<u8>) -> Result<Message, WireError> {
        if body.len() % 4 != 0 {
            return Err(WireError::BadLength { length: body.len() });
        }
        let first = *body.first().ok_or(WireError::BadAddress)?;
        if first != b'/' && first != b'!' {
            return Err(WireError::BadAddress);
        }
        let addr_nul = body
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::BadAddress)?;
        if std::str::from_utf8(&body[..addr_nul]).is_err() {
            return Err(WireError::BadAddress);
        }
        let tag_off = pad4(addr_nul + 1);
        if tag_off >= body.len() || body[tag_off] != b',' {
            return Err(WireError::BadTypeTag);
        }
        let tag_nul = body[tag_off..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| tag_off + p)
            .ok_or(WireError::BadTypeTag)?;
        for &c in &body[tag_off + 1..tag_nul] {
            if TypeCode::from_u8(c).is_none() {
                return Err(WireError::BadTypeTag);
            }
        }
        let args_off = pad4(tag_nul + 1);
        if args_off > body.len() {
            return Err(WireError::BadTypeTag);
        }
        Ok(Message {
            timestamp,
            tag_off: tag_off as u32,
            args_off: args_off as u32,
            body,
        })
    }

    /// Delivery time in global (or local, when explicitly scheduled so)
    /// seconds; `0.0` means immediate.
    #[must_use]
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// The address pattern. A leading `!` instead of `/` marks the
    /// sender's promise that the address contains no pattern characters.
    #[must_use]
    pub fn address(&self) -> &str {
        let addr = &self.body[..self.addr_len()];
        // Validated UTF-8 at construction.
        std::str::from_utf8(addr).unwrap_or_default()
    }

    /// The typetag without its leading `,`.
    #[must_use]
    pub fn types(&self) -> &str {
        let start = self.tag_off as usize + 1;
        let end = self.body[start..]
            .iter()
            .position(|&b| b == 0)
            .map_or(self.body.len(), |p| start + p);
        std::str::from_utf8(&self.body[start..end]).unwrap_or_default()
    }

    /// The raw argument bytes.
    #[must_use]
    pub fn args_bytes(&self) -> &[u8] {
        &self.body[self.args_off as usize..]
    }

    /// The full wire body (address through arguments).
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Total wire length: timestamp field plus body.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        8 + self.body.len()
    }

    /// Serialize to the wire image: big-endian timestamp, then the body.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut w = WriteCursor::with_buffer(Vec::with_capacity(self.wire_len()));
        let _ = w.write_f64(self.timestamp);
        let _ = w.write_bytes(&self.body);
        w.into_inner()
    }

    /// Parse a wire image produced by [`Message::to_wire`].
    ///
    /// # Errors
    /// [`WireError`] on truncation or framing violations.
    pub fn from_wire(data: &[u8]) -> Result<Message, WireError> {
        let mut r = ReadCursor::new(data);
        let timestamp = r.read_f64()?;
        let body = data[r.offset()..].to_vec();
        Message::from_parts(timestamp, body)
    }

    /// Begin sequential argument extraction.
    #[must_use]
    pub fn extract(&self) -> Extractor<'_> {
        Extractor::new(self)
    }

    /// Reclaim the body buffer (for pooling).
    #[must_use]
    pub(crate) fn into_body(self) -> Vec<u8> {
        self.body
    }

    fn addr_len(&self) -> usize {
        self.body
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.body.len())
    }
}
