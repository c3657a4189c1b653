//! Error taxonomy for the bus observer and client channel surfaces.

use std::fmt;

/// Errors surfaced by [`crate::observer::BusObserver`] and
/// [`crate::channel::ClientChannel`].
///
/// `NotFound` from the error taxonomy this type implements is modeled as
/// `Option::None` on the lookup APIs rather than a variant here; a missing
/// or unpublished node is an expected outcome, not a failure.
#[derive(Debug)]
pub enum Error {
    /// Failed to open an `AF_QIPCRTR` datagram socket. Fatal to the object
    /// being constructed.
    SocketCreate(std::io::Error),
    /// A send, receive, or `getsockname` call failed. Fatal to the observer;
    /// per-call for a client channel.
    SocketIO(std::io::Error),
    /// `create` or `wait_for_node` exceeded its deadline.
    Timeout,
    /// An external cancellation handle fired before completion.
    Cancelled,
    /// A decoded control packet violated an expected invariant (a stray
    /// `DEL_SERVER` for an unknown node or port). Logged at the call site,
    /// never propagated to a subscriber.
    InvariantViolation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketCreate(e) => write!(f, "failed to create qrtr socket: {e}"),
            Self::SocketIO(e) => write!(f, "qrtr socket i/o error: {e}"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SocketCreate(e) | Self::SocketIO(e) => Some(e),
            Self::Timeout | Self::Cancelled | Self::InvariantViolation(_) => None,
        }
    }
}

impl From<wire::Error> for Error {
    fn from(value: wire::Error) -> Self {
        Self::InvariantViolation(value.to_string())
    }
}
