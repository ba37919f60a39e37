// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Errors and service status codes.
//!
//! Every fallible operation returns [`Result`]. Numeric codes mirror the
//! original C ABI: [`Error::code`] yields the classic negative values and
//! [`Status`] keeps the exact 0..=7 ordering that clients use for
//! category tests such as `status >= Status::Local`.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Reserved code, kept for ABI compatibility. Never returned.
pub const SERVICE_CONFLICT: i32 = -2;
/// Reserved code, kept for ABI compatibility. Never returned.
pub const NO_SERVICE: i32 = -3;

/// Errors returned by O2 operations.
#[derive(Debug)]
pub enum Error {
    /// Non-specific failure.
    Fail,
    /// Out of free message memory; the current operation was aborted and
    /// any partially built message released.
    NoMemory,
    /// A second run loop was started while one is active.
    AlreadyRunning,
    /// The ensemble name is empty, non-ASCII, or contains `/`.
    BadName(String),
    /// The peer's TCP connection closed.
    TcpHangup,
    /// The addressed service is not in the directory; the message was
    /// dropped.
    UnknownService(String),
    /// A timestamped send was attempted before global time is defined;
    /// the message was dropped.
    NoClock,
    /// The message failed wire validation and was dropped.
    Malformed(WireError),
    /// Underlying socket error.
    Io(io::Error),
}

impl Error {
    /// The classic numeric return code for this error.
    ///
    /// Codes `-2` ([`SERVICE_CONFLICT`]) and `-3` ([`NO_SERVICE`]) are
    /// reserved and never produced.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Error::NoMemory => -4,
            Error::AlreadyRunning => -5,
            Error::BadName(_) => -6,
            Error::TcpHangup => -7,
            Error::Fail
            | Error::UnknownService(_)
            | Error::NoClock
            | Error::Malformed(_)
            | Error::Io(_) => -1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fail => write!(f, "operation failed"),
            Error::NoMemory => write!(f, "out of message memory"),
            Error::AlreadyRunning => write!(f, "already running"),
            Error::BadName(name) => write!(f, "bad ensemble name: {:?}", name),
            Error::TcpHangup => write!(f, "peer connection closed"),
            Error::UnknownService(name) => write!(f, "unknown service: {}", name),
            Error::NoClock => write!(f, "no clock synchronization"),
            Error::Malformed(e) => write!(f, "malformed message: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Malformed(e)
    }
}

/// Wire-level validation error produced by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A read would run past the end of the buffer.
    ReadFailed {
        /// Byte offset at which the read was attempted.
        offset: usize,
        /// What was being read.
        reason: &'static str,
    },
    /// A write would run past the end of the buffer.
    WriteFailed {
        /// Byte offset at which the write was attempted.
        offset: usize,
        /// What was being written.
        reason: &'static str,
    },
    /// The address field is missing, unterminated, or does not begin
    /// with `/` or `!`.
    BadAddress,
    /// The typetag is missing its leading `,`, is not NUL-terminated
    /// within the message, or contains an unknown type code.
    BadTypeTag,
    /// The declared length is not a multiple of 4 or exceeds the cap.
    BadLength {
        /// The offending length.
        length: usize,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::ReadFailed { offset, reason } => {
                write!(f, "read failed at offset {}: {}", offset, reason)
            }
            WireError::WriteFailed { offset, reason } => {
                write!(f, "write failed at offset {}: {}", offset, reason)
            }
            WireError::BadAddress => write!(f, "invalid address field"),
            WireError::BadTypeTag => write!(f, "invalid typetag field"),
            WireError::BadLength { length } => write!(f, "invalid length {}", length),
        }
    }
}

impl std::error::Error for WireError {}

/// Service status as reported by `Process::status`.
///
/// The numeric ordering is load-bearing: values below [`Status::Local`]
/// mean the path exists but timestamped delivery is not yet possible;
/// `status >= Status::Local` means clock sync is established end to end.
/// An unknown service is reported as `None` (the C API's `-1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum Status {
    /// Local service, no clock sync yet.
    LocalNoTime = 0,
    /// Remote service, no clock sync yet.
    RemoteNoTime = 1,
    /// Bridged service, no clock sync yet. Reserved extension point.
    BridgeNoTime = 2,
    /// OSC forwarder, no clock sync yet. Reserved extension point.
    ToOscNoTime = 3,
    /// Local service with clock sync.
    Local = 4,
    /// Remote service with clock sync on both sides.
    Remote = 5,
    /// Bridged service with clock sync. Reserved extension point.
    Bridge = 6,
    /// OSC forwarder with clock sync. Reserved extension point.
    ToOsc = 7,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_abi() {
        assert_eq!(Error::Fail.code(), -1);
        assert_eq!(Error::NoMemory.code(), -4);
        assert_eq!(Error::AlreadyRunning.code(), -5);
        assert_eq!(Error::BadName(String::new()).code(), -6);
        assert_eq!(Error::TcpHangup.code(), -7);
        assert_eq!(Error::UnknownService("x".into()).code(), -1);
        assert_eq!(Error::NoClock.code(), -1);
        assert_eq!(SERVICE_CONFLICT, -2);
        assert_eq!(NO_SERVICE, -3);
    }

    #[test]
    fn test_status_ordering_is_load_bearing() {
        assert!(Status::Local > Status::ToOscNoTime);
        assert!(Status::Remote >= Status::Local);
        assert_eq!(Status::LocalNoTime as i8, 0);
        assert_eq!(Status::ToOsc as i8, 7);
        // Category test used by clients: synced iff >= Local.
        for s in [Status::Local, Status::Remote, Status::Bridge, Status::ToOsc] {
            assert!(s >= Status::Local);
        }
        for s in [
            Status::LocalNoTime,
            Status::RemoteNoTime,
            Status::BridgeNoTime,
            Status::ToOscNoTime,
        ] {
            assert!(s < Status::Local);
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", Error::UnknownService("synth".into())),
            "unknown service: synth"
        );
        assert_eq!(format!("{}", Error::NoClock), "no clock synchronization");
        let e = WireError::ReadFailed {
            offset: 12,
            reason: "blob body",
        };
        assert_eq!(format!("{}", e), "read failed at offset 12: blob body");
    }
}
