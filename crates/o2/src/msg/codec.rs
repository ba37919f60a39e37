// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Wire codec: message encoding, argument validation, and
//! OSC-compatible bundles.
//!
//! Message layout after the 8-byte big-endian timestamp is OSC: padded
//! address, padded `,`-typetag, then arguments. Bundles use the OSC
//! `#bundle` header with a 32.32 fixed-point timetag; the sentinel tag
//! `1` maps to "immediate" (timestamp `0.0`).

use super::cursor::{ReadCursor, WriteCursor};
use super::{ArgView, Message, MessageBuilder, TypeCode};
use crate::error::WireError;

/// Leading bytes of a bundle wire image.
pub const BUNDLE_HEADER: &[u8; 8] = b"#bundle\0";

/// Maximum nesting depth accepted when unpacking bundles.
const MAX_BUNDLE_DEPTH: usize = 8;

/// Encode a message in one call from argument views.
///
/// The typetag is derived from the arguments. This is the one-shot
/// counterpart of [`MessageBuilder`].
///
/// # Errors
/// [`WireError::BadAddress`] for an address not starting `/` or `!`.
pub fn encode_message(
    timestamp: f64,
    address: &str,
    args: &[ArgView<'_>],
) -> Result<Message, WireError> {
    let mut b = MessageBuilder::new();
    for arg in args {
        b.add_arg(arg);
    }
    b.finish(timestamp, address)
}

/// Decode and fully validate one message wire image
/// (timestamp + body), including the argument section.
///
/// # Errors
/// [`WireError`] when the declared structure reads past the end of the
/// buffer or the framing is broken.
pub fn decode_message(data: &[u8]) -> Result<Message, WireError> {
    let msg = Message::from_wire(data)?;
    validate_args(&msg)?;
    Ok(msg)
}

/// Check that every argument declared by the typetag fits inside the
/// message body.
///
/// # Errors
/// [`WireError::ReadFailed`] naming the argument that runs past the end.
pub fn validate_args(msg: &Message) -> Result<(), WireError> {
    let mut r = ReadCursor::new(msg.args_bytes());
    for c in msg.types().bytes() {
        let code = TypeCode::from_u8(c).ok_or(WireError::BadTypeTag)?;
        skip_arg(&mut r, code)?;
    }
    Ok(())
}

fn skip_arg(r: &mut ReadCursor<'_>, code: TypeCode) -> Result<(), WireError> {
    match code {
        TypeCode::Int32 | TypeCode::Char | TypeCode::Bool => {
            r.read_i32()?;
        }
        TypeCode::Float => {
            r.read_f32()?;
        }
        TypeCode::Int64 => {
            r.read_i64()?;
        }
        TypeCode::Double | TypeCode::Time => {
            r.read_f64()?;
        }
        TypeCode::String | TypeCode::Symbol => {
            r.read_padded_str()?;
        }
        TypeCode::Midi => {
            r.read_bytes(4)?;
        }
        TypeCode::Blob => {
            let size = r.read_u32()? as usize;
            r.read_bytes(size)?;
            r.align4()?;
        }
        TypeCode::True | TypeCode::False | TypeCode::Nil | TypeCode::Infinitum => {}
    }
    Ok(())
}

/// True when a wire image is a bundle rather than a single message.
#[must_use]
pub fn is_bundle(data: &[u8]) -> bool {
    data.len() >= BUNDLE_HEADER.len() && &data[..BUNDLE_HEADER.len()] == BUNDLE_HEADER
}

/// Pack messages into one bundle wire image delivering at `timestamp`.
///
/// Elements are stored OSC-style: each is a length-prefixed body without
/// its own timestamp field; the bundle timetag carries the time.
#[must_use]
pub fn encode_bundle(timestamp: f64, elements: &[Message]) -> Vec<u8> {
    let mut w = WriteCursor::new();
    let _ = w.write_bytes(BUNDLE_HEADER);
    let _ = w.write_i64(timetag_from_seconds(timestamp) as i64);
    for msg in elements {
        let _ = w.write_u32(msg.body().len() as u32);
        let _ = w.write_bytes(msg.body());
    }
    w.into_inner()
}

/// Unpack a (possibly nested) bundle into its component messages, each
/// stamped with its innermost enclosing bundle's time.
///
/// # Errors
/// [`WireError`] on truncated elements, depth overflow, or an element
/// that is neither a message nor a bundle.
pub fn decode_bundle(data: &[u8]) -> Result<Vec<Message>, WireError> {
    let mut out = Vec::new();
    unpack_into(data, &mut out, 0)?;
    Ok(out)
}

fn unpack_into(data: &[u8], out: &mut Vec<Message>, depth: usize) -> Result<(), WireError> {
    if depth >= MAX_BUNDLE_DEPTH {
        return Err(WireError::ReadFailed {
            offset: 0,
            reason: "bundle nesting too deep",
        });
    }
    if !is_bundle(data) {
        return Err(WireError::BadAddress);
    }
    let mut r = ReadCursor::new(data);
    r.read_bytes(BUNDLE_HEADER.len())?;
    let timestamp = seconds_from_timetag(r.read_i64()? as u64);
    while r.remaining() > 0 {
        let size = r.read_u32()? as usize;
        if size % 4 != 0 {
            return Err(WireError::BadLength { length: size });
        }
        let element = r.read_bytes(size)?;
        if is_bundle(element) {
            unpack_into(element, out, depth + 1)?;
        } else {
            let msg = Message::from_parts(timestamp, element.to_vec())?;
            validate_args(&msg)?;
            out.push(msg);
        }
    }
    Ok(())
}

/// Convert seconds to a 32.32 fixed-point timetag; `0.0` becomes the
/// OSC "immediately" sentinel `1`.
#[must_use]
pub fn timetag_from_seconds(t: f64) -> u64 {
    if t <= 0.0 {
        return 1;
    }
    let secs = t.floor();
    let frac = ((t - secs) * (1u64 << 32) as f64) as u64;
    ((secs as u64) << 32) | frac
}

/// Inverse of [`timetag_from_seconds`].
#[must_use]
pub fn seconds_from_timetag(tag: u64) -> f64 {
    if tag <= 1 {
        return 0.0;
    }
    (tag >> 32) as f64 + (tag & 0xFFFF_FFFF) as f64 / (1u64 << 32) as f64
}
