//! Socket error classification.
//!
//! Maps an I/O error to how loudly it should be reported. Used by the
//! accept loop, the relay and the half-close path. Classification only
//! affects log severity and whether the accept loop keeps running;
//! nothing is ever retried because of it.

use std::fmt;
use std::io;

/// The socket operation that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Accept,
    Read,
    Write,
    CloseWrite,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            IoOp::Accept => "accept",
            IoOp::Read => "read",
            IoOp::Write => "write",
            IoOp::CloseWrite => "close_write",
        };
        f.write_str(op)
    }
}

/// Semantic category of a socket error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The local socket was already closed or disconnected on purpose.
    BenignShutdown,
    /// The peer reset the connection while we were reading.
    BenignPeerReset,
    /// Anything else.
    Real,
}

impl ErrorClass {
    pub fn is_benign(self) -> bool {
        !matches!(self, ErrorClass::Real)
    }
}

/// Classify an error raised by `op`.
pub fn classify(op: IoOp, err: &io::Error) -> ErrorClass {
    // Half-closing a socket the peer already tore down
    if op == IoOp::CloseWrite && err.kind() == io::ErrorKind::NotConnected {
        return ErrorClass::BenignShutdown;
    }

    match (op, err.raw_os_error()) {
        (_, Some(libc::EBADF)) => return ErrorClass::BenignShutdown,
        // accept(2) on a listener that has been shut down
        (IoOp::Accept, Some(libc::EINVAL)) => return ErrorClass::BenignShutdown,
        _ => {}
    }

    if op == IoOp::Read && err.kind() == io::ErrorKind::ConnectionReset {
        return ErrorClass::BenignPeerReset;
    }

    ErrorClass::Real
}
