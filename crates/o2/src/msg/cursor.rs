// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Read/write cursors for wire buffer manipulation.
//!
//! All multi-byte values on the wire are big-endian (network order, as in
//! OSC). Strings and blobs are NUL-padded to 4-byte boundaries; the
//! cursors provide the padding arithmetic so callers never do it by hand.

use crate::error::WireError;

/// Result alias for cursor operations.
pub type WireResult<T> = std::result::Result<T, WireError>;

/// Round `offset` up to the next 4-byte boundary.
#[inline]
#[must_use]
pub fn pad4(offset: usize) -> usize {
    (offset + 3) & !3
}

/// Generate write methods for primitive types.
///
/// Each generated method bounds-checks, converts via `to_be_bytes()`,
/// copies, and advances the offset.
macro_rules! impl_write_be {
    ($name:ident, $type:ty, $size:expr) => {
        /// Write one big-endian value.
        pub fn $name(&mut self, value: $type) -> WireResult<()> {
            self.write_bytes(&value.to_be_bytes())
        }
    };
}

/// Generate read methods for primitive types.
///
/// Each generated method bounds-checks, reads `$size` bytes, converts via
/// `from_be_bytes()`, and advances the offset.
macro_rules! impl_read_be {
    ($name:ident, $type:ty, $size:expr) => {
        /// Read one big-endian value.
        pub fn $name(&mut self) -> WireResult<$type> {
            if self.offset + $size > self.buffer.len() {
                return Err(WireError::ReadFailed {
                    offset: self.offset,
                    reason: "unexpected end of buffer",
                });
            }
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(&self.buffer[self.offset..self.offset + $size]);
            self.offset += $size;
            Ok(<$type>::from_be_bytes(bytes))
        }
    };
}

/// Growable write cursor used by the encoder and message builder.
#[derive(Debug, Default)]
pub struct WriteCursor {
    buffer: Vec<u8>,
}

impl WriteCursor {
    /// Create an empty cursor.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a cursor reusing `buffer` (cleared), typically from the
    /// message pool.
    #[must_use]
    pub fn with_buffer(mut buffer: Vec<u8>) -> Self {
        buffer.clear();
        Self { buffer }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) -> WireResult<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    impl_write_be!(write_i32, i32, 4);
    impl_write_be!(write_u32, u32, 4);
    impl_write_be!(write_i64, i64, 8);
    impl_write_be!(write_f32, f32, 4);
    impl_write_be!(write_f64, f64, 8);

    /// Append a NUL-terminated string padded to a 4-byte boundary.
    pub fn write_padded_str(&mut self, s: &str) -> WireResult<()> {
        self.buffer.extend_from_slice(s.as_bytes());
        let padded = pad4(s.len() + 1);
        self.buffer.resize(self.buffer.len() + (padded - s.len()), 0);
        Ok(())
    }

    /// Append raw bytes then NUL-pad to a 4-byte boundary.
    pub fn write_padded_bytes(&mut self, data: &[u8]) -> WireResult<()> {
        self.buffer.extend_from_slice(data);
        let pad = pad4(data.len()) - data.len();
        self.buffer.resize(self.buffer.len() + pad, 0);
        Ok(())
    }

    /// Take the finished buffer.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

/// Bounds-checked read cursor over a received buffer.
#[derive(Debug)]
pub struct ReadCursor<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> ReadCursor<'a> {
    /// Create a cursor at offset 0.
    #[must_use]
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    /// Current offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes remaining.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    impl_read_be!(read_i32, i32, 4);
    impl_read_be!(read_u32, u32, 4);
    impl_read_be!(read_i64, i64, 8);
    impl_read_be!(read_f32, f32, 4);
    impl_read_be!(read_f64, f64, 8);

    /// Read exactly `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.offset + n > self.buffer.len() {
            return Err(WireError::ReadFailed {
                offset: self.offset,
                reason: "unexpected end of buffer",
            });
        }
        let slice = &self.buffer[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    /// Read a NUL-terminated string and skip its padding to the next
    /// 4-byte boundary. The returned slice excludes the NUL.
    pub fn read_padded_str(&mut self) -> WireResult<&'a str> {
        let start = self.offset;
        let rest = &self.buffer[start.min(self.buffer.len())..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::ReadFailed {
                offset: start,
                reason: "unterminated string",
            })?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| WireError::ReadFailed {
            offset: start,
            reason: "string is not valid UTF-8",
        })?;
        let end = start + pad4(nul + 1);
        if end > self.buffer.len() {
            return Err(WireError::ReadFailed {
                offset: start,
                reason: "string padding past end",
            });
        }
        self.offset = end;
        Ok(s)
    }

    /// Skip padding bytes so the offset lands on a 4-byte boundary.
    pub fn align4(&mut self) -> WireResult<()> {
        let aligned = pad4(self.offset);
        if aligned > self.buffer.len() {
            return Err(WireError::ReadFailed {
                offset: self.offset,
                reason: "padding past end",
            });
        }
        self.offset = aligned;
        Ok(())
    }
}
