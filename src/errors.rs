//! Errors of the host controller interface
//!
//! Every fallible operation of this crate returns [`Error`]. The variants split errors into the
//! few categories that matter to a caller: the manager was shut down, a command got stuck, a
//! packet was malformed, or the controller itself reported a status code.

use core::fmt;

/// The error type for HCI operations
///
/// # Recoverability
/// `Closed` and `Controller` are recoverable by the caller abandoning the operation (or retrying
/// it against a new manager). `Timeout` is fatal to the command manager that produced it as the
/// opcode and credit bookkeeping can no longer be trusted. `Transport` is fatal to everything
/// sharing the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operation was attempted during or after shutdown of the owning manager
    Closed,
    /// The command liveness watchdog declared an outstanding command permanently stuck
    Timeout,
    /// A malformed event or frame was detected
    ///
    /// The offending frame or event is dropped, no manager state is corrupted by it.
    Protocol(&'static str),
    /// The controller reported a non-zero status code
    ///
    /// The code is passed through from the controller unmodified.
    Controller(u8),
    /// The link to the controller failed
    Transport(String),
    /// A connection handle was outside the valid 12 bit range
    InvalidHandle(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Closed => f.write_str("manager is closed"),
            Error::Timeout => f.write_str("command timed out, the state of the controller is unknown"),
            Error::Protocol(reason) => write!(f, "protocol error, {}", reason),
            Error::Controller(status) => match status_name(*status) {
                Some(name) => write!(f, "controller error ({:#x}): {}", status, name),
                None => write!(f, "controller error ({:#x})", status),
            },
            Error::Transport(reason) => write!(f, "transport error, {}", reason),
            Error::InvalidHandle(reason) => write!(f, "invalid connection handle, {}", reason),
        }
    }
}

impl std::error::Error for Error {}

/// Get the specification name of a controller status code
///
/// Only the codes commonly seen by this layer are named, everything else displays as its raw
/// value.
fn status_name(status: u8) -> Option<&'static str> {
    match status {
        0x00 => Some("success"),
        0x01 => Some("unknown HCI command"),
        0x02 => Some("unknown connection identifier"),
        0x08 => Some("connection timeout"),
        0x0C => Some("command disallowed"),
        0x0E => Some("connection rejected due to limited resources"),
        0x13 => Some("remote user terminated connection"),
        0x16 => Some("connection terminated by local host"),
        0x1F => Some("unspecified error"),
        0x3E => Some("connection failed to be established"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_status_display() {
        assert_eq!(
            Error::Controller(0x13).to_string(),
            "controller error (0x13): remote user terminated connection"
        );

        assert_eq!(Error::Controller(0xFE).to_string(), "controller error (0xfe)");
    }
}
