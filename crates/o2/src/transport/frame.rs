// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Length-prefix framing for messages over TCP.
//!
//! TCP is a stream without message boundaries; each message travels as
//!
//! ```text
//! +----------------+--------------------+
//! | Length (4B BE) | message wire image |
//! +----------------+--------------------+
//! ```
//!
//! The codec keeps partial-read state so frames split across arbitrary
//! segment boundaries reassemble correctly.

use crate::error::WireError;

/// Frame header size (4 bytes of length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Length-prefix frame codec with incremental read state.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    buffer: Vec<u8>,
    max_size: usize,
    frames_decoded: u64,
}

/// Internal state for incremental reading.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Accumulating the 4-byte length header.
    ReadingLength { bytes_read: usize },
    /// Accumulating the frame body.
    ReadingBody { expected_len: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

impl FrameCodec {
    /// Create a codec rejecting frames over `max_size` bytes.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: Vec::with_capacity(FRAME_HEADER_SIZE),
            max_size,
            frames_decoded: 0,
        }
    }

    /// Frames successfully decoded over this codec's lifetime.
    #[must_use]
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Prefix one payload with its length header.
    #[must_use]
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Consume freshly read stream bytes, appending each completed
    /// frame body to `out`.
    ///
    /// # Errors
    /// [`WireError::BadLength`] when a header declares a frame over the
    /// size cap; the connection should be dropped, the codec state is
    /// unusable afterwards.
    pub fn feed(&mut self, mut data: &[u8], out: &mut Vec<Vec<u8>>) -> Result<(), WireError> {
        while !data.is_empty() {
            match self.state {
                ReadState::ReadingLength { bytes_read } => {
                    let need = FRAME_HEADER_SIZE - bytes_read;
                    let take = need.min(data.len());
                    self.buffer.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if take < need {
                        self.state = ReadState::ReadingLength {
                            bytes_read: bytes_read + take,
                        };
                        continue;
                    }
                    let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
                    len_bytes.copy_from_slice(&self.buffer[..FRAME_HEADER_SIZE]);
                    let expected_len = u32::from_be_bytes(len_bytes) as usize;
                    if expected_len > self.max_size {
                        return Err(WireError::BadLength {
                            length: expected_len,
                        });
                    }
                    self.buffer.clear();
                    if expected_len == 0 {
                        // Nothing further arrives for an empty frame.
                        out.push(Vec::new());
                        self.frames_decoded += 1;
                        self.state = ReadState::default();
                        continue;
                    }
                    self.buffer.reserve(expected_len);
                    self.state = ReadState::ReadingBody { expected_len };
                }
                ReadState::ReadingBody { expected_len } => {
                    let need = expected_len - self.buffer.len();
                    let take = need.min(data.len());
                    self.buffer.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.buffer.len() == expected_len {
                        out.push(std::mem::take(&mut self.buffer));
                        self.frames_decoded += 1;
                        self.state = ReadState::default();
                    }
                }
            }
        }
        Ok(())
    }
}
