// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error type shared by every corebus operation.
//!
//! All fallible operations return [`Result`]. Handler callbacks follow a
//! tri-valued convention built on top of it: `Err(_)` aborts the current
//! dispatch step and surfaces from `process`, `Ok(false)` means "not handled,
//! try the next stage", `Ok(true)` means "handled, stop".

use std::fmt;
use std::io;

use crate::message::BusError;

/// Errors returned by corebus operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Caller errors
    // ========================================================================
    /// Malformed input: bad path, interface, member, signature or address.
    InvalidArgument(String),
    /// Lifecycle violation: setup call outside the unset state, double start,
    /// fd query on a split-descriptor connection.
    PermissionDenied(&'static str),
    /// Recursive `process` invocation on the same connection.
    Busy,
    /// A fork separated this connection from its owning process.
    ChildProcess,

    // ========================================================================
    // Connection errors
    // ========================================================================
    /// I/O requested on a connection that is not open.
    NotConnected,
    /// A queue hit its configured capacity.
    NoBufferSpace,
    /// A call or tracker deadline elapsed.
    TimedOut,
    /// Wire-level violation: invalid hello reply, unexpected message in the
    /// hello phase, mismatched reply serial.
    Protocol(String),
    /// Transport failure. Fatal errors close the connection before returning.
    Io(io::Error),

    // ========================================================================
    // Object tree errors
    // ========================================================================
    /// An interface is already registered at this node.
    AlreadyExists(String),
    /// Fallback and non-fallback registrations mixed on one node.
    WrongProtocol(String),
    /// Referenced registration does not exist (e.g. a property named in a
    /// PropertiesChanged emission).
    NotFound(String),
    /// Operation is recognized but intentionally not provided.
    NotSupported,
    /// A required file or directory is missing (e.g. the user runtime dir).
    NoSuchFile(String),

    // ========================================================================
    // Remote errors
    // ========================================================================
    /// Error carried in a method-error message, propagated to the caller.
    Remote(BusError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::PermissionDenied(msg) => write!(f, "operation not permitted: {}", msg),
            Error::Busy => write!(f, "connection is busy dispatching"),
            Error::ChildProcess => write!(f, "connection does not survive fork()"),
            Error::NotConnected => write!(f, "connection is not open"),
            Error::NoBufferSpace => write!(f, "message queue is full"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::Io(e) => write!(f, "transport error: {}", e),
            Error::AlreadyExists(msg) => write!(f, "already registered: {}", msg),
            Error::WrongProtocol(msg) => write!(f, "incompatible registration: {}", msg),
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::NotSupported => write!(f, "operation not supported"),
            Error::NoSuchFile(msg) => write!(f, "no such file or directory: {}", msg),
            Error::Remote(e) => write!(f, "{}: {}", e.name, e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for results using the corebus [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let e = Error::InvalidArgument("bad path".into());
        assert_eq!(e.to_string(), "invalid argument: bad path");

        let e = Error::Remote(BusError::new(
            "org.freedesktop.DBus.Error.Timeout",
            "Timed out",
        ));
        assert_eq!(e.to_string(), "org.freedesktop.DBus.Error.Timeout: Timed out");
    }

    #[test]
    fn test_io_source() {
        use std::error::Error as _;

        let e = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(e.source().is_some());
        assert!(Error::Busy.source().is_none());
    }
}
