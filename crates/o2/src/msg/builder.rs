// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Incremental message construction.
//!
//! Build a message one argument at a time, then seal it with a
//! timestamp and address. The builder owns its buffers; `finish`
//! produces a validated [`Message`] ready to send or schedule.

use super::cursor::WriteCursor;
use super::{ArgView, Blob, Message};
use crate::error::WireError;

/// Accumulates typetag characters and argument bytes.
///
/// Add calls cannot fail; errors surface once at [`MessageBuilder::finish`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    types: String,
    args: WriteCursor,
}

impl MessageBuilder {
    /// Start an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty message reusing a pooled buffer for the arguments.
    #[must_use]
    pub(crate) fn with_buffer(buffer: Vec<u8>) -> Self {
        Self {
            types: String::new(),
            args: WriteCursor::with_buffer(buffer),
        }
    }

    /// Number of arguments added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when no argument has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Add an `i` argument.
    pub fn add_int32(&mut self, v: i32) -> &mut Self {
        self.types.push('i');
        let _ = self.args.write_i32(v);
        self
    }

    /// Add an `h` argument.
    pub fn add_int64(&mut self, v: i64) -> &mut Self {
        self.types.push('h');
        let _ = self.args.write_i64(v);
        self
    }

    /// Add an `f` argument.
    pub fn add_float(&mut self, v: f32) -> &mut Self {
        self.types.push('f');
        let _ = self.args.write_f32(v);
        self
    }

    /// Add a `d` argument.
    pub fn add_double(&mut self, v: f64) -> &mut Self {
        self.types.push('d');
        let _ = self.args.write_f64(v);
        self
    }

    /// Add a `t` (time) argument.
    pub fn add_time(&mut self, v: f64) -> &mut Self {
        self.types.push('t');
        let _ = self.args.write_f64(v);
        self
    }

    /// Add an `s` argument.
    pub fn add_string(&mut self, s: &str) -> &mut Self {
        self.types.push('s');
        let _ = self.args.write_padded_str(s);
        self
    }

    /// Add an `S` (symbol) argument.
    pub fn add_symbol(&mut self, s: &str) -> &mut Self {
        self.types.push('S');
        let _ = self.args.write_padded_str(s);
        self
    }

    /// Add a `c` argument.
    pub fn add_char(&mut self, c: char) -> &mut Self {
        self.types.push('c');
        let _ = self.args.write_i32(c as i32);
        self
    }

    /// Add an `m` (MIDI) argument.
    pub fn add_midi(&mut self, m: [u8; 4]) -> &mut Self {
        self.types.push('m');
        let _ = self.args.write_bytes(&m);
        self
    }

    /// Add a `b` argument from a [`Blob`].
    pub fn add_blob(&mut self, b: &Blob) -> &mut Self {
        self.add_blob_data(&b.data)
    }

    /// Add a `b` argument from raw bytes.
    pub fn add_blob_data(&mut self, data: &[u8]) -> &mut Self {
        self.types.push('b');
        let _ = self.args.write_u32(data.len() as u32);
        let _ = self.args.write_padded_bytes(data);
        self
    }

    /// Add a `B` argument.
    pub fn add_bool(&mut self, v: bool) -> &mut Self {
        self.types.push('B');
        let _ = self.args.write_i32(i32::from(v));
        self
    }

    /// Add a `T` argument.
    pub fn add_true(&mut self) -> &mut Self {
        self.types.push('T');
        self
    }

    /// Add an `F` argument.
    pub fn add_false(&mut self) -> &mut Self {
        self.types.push('F');
        self
    }

    /// Add an `N` argument.
    pub fn add_nil(&mut self) -> &mut Self {
        self.types.push('N');
        self
    }

    /// Add an `I` argument.
    pub fn add_infinitum(&mut self) -> &mut Self {
        self.types.push('I');
        self
    }

    /// Add any argument from a view (used by the one-shot encoder and
    /// by message rewriting).
    pub fn add_arg(&mut self, arg: &ArgView<'_>) -> &mut Self {
        match arg {
            ArgView::Int32(v) => self.add_int32(*v),
            ArgView::Int64(v) => self.add_int64(*v),
            ArgView::Float(v) => self.add_float(*v),
            ArgView::Double(v) => self.add_double(*v),
            ArgView::Time(v) => self.add_time(*v),
            ArgView::Str(s) => self.add_string(s),
            ArgView::Symbol(s) => self.add_symbol(s),
            ArgView::Char(c) => self.add_char(*c),
            ArgView::Midi(m) => self.add_midi(*m),
            ArgView::Blob(b) => self.add_blob_data(b),
            ArgView::Bool(v) => self.add_bool(*v),
            ArgView::True => self.add_true(),
            ArgView::False => self.add_false(),
            ArgView::Nil => self.add_nil(),
            ArgView::Infinitum => self.add_infinitum(),
        }
    }

    /// Seal the message with its delivery time and address.
    ///
    /// # Errors
    /// [`WireError::BadAddress`] unless the address starts with `/`
    /// (pattern allowed) or `!` (promise of no pattern characters).
    pub fn finish(self, timestamp: f64, address: &str) -> Result<Message, WireError> {
        if !(address.starts_with('/') || address.starts_with('!')) || address.len() < 2 {
            return Err(WireError::BadAddress);
        }
        let args = self.args.into_inner();
        let mut w = WriteCursor::with_buffer(Vec::with_capacity(
            address.len() + self.types.len() + args.len() + 16,
        ));
        w.write_padded_str(address)?;
        let mut tag = String::with_capacity(self.types.len() + 1);
        tag.push(',');
        tag.push_str(&self.types);
        w.write_padded_str(&tag)?;
        w.write_bytes(&args)?;
        Message::from_parts(timestamp, w.into_inner())
    }
}
