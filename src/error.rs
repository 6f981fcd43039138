use serde::{Deserialize, Serialize};
use std::fmt;

use crate::value::Value;

/// Stable identifiers for every error kind that can cross the wire.
///
/// The textual form of a kind is its wire encoding; it must never change
/// for an existing kind, otherwise peers running older builds lose the
/// ability to map it back to a local error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Destination object is not registered in the destination context.
    UnknownReceiver,
    /// Method is not in the service catalogue.
    UnknownMethod,
    /// Destination context is neither local nor reachable.
    UnknownPeer,
    /// Method refused because the object is locked with a different token.
    Locked,
    /// Argument failed server-side validation.
    InvalidArgument,
    /// Wrapped service-side error.
    ApplicationError,
    /// Deadline exceeded.
    Timeout,
    /// Peer connection dropped before a reply arrived.
    PeerLost,
    /// Handshake failed due to workgroup or protocol version mismatch.
    ProtocolMismatch,
    /// Loop task missed its period under the TERMINATE policy.
    Overrun,
    /// Operation invalid in the current lifecycle state.
    IllegalState,
}

impl ErrorKind {
    /// The stable wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownReceiver => "UnknownReceiver",
            ErrorKind::UnknownMethod => "UnknownMethod",
            ErrorKind::UnknownPeer => "UnknownPeer",
            ErrorKind::Locked => "Locked",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::ApplicationError => "ApplicationError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::PeerLost => "PeerLost",
            ErrorKind::ProtocolMismatch => "ProtocolMismatch",
            ErrorKind::Overrun => "Overrun",
            ErrorKind::IllegalState => "IllegalState",
        }
    }

    /// Map a wire name back to a kind. Unknown names map to `None`;
    /// the caller falls back to `ApplicationError` and preserves the
    /// original name in the error descriptor.
    pub fn parse(name: &str) -> Option<ErrorKind> {
        match name {
            "UnknownReceiver" => Some(ErrorKind::UnknownReceiver),
            "UnknownMethod" => Some(ErrorKind::UnknownMethod),
            "UnknownPeer" => Some(ErrorKind::UnknownPeer),
            "Locked" => Some(ErrorKind::Locked),
            "InvalidArgument" => Some(ErrorKind::InvalidArgument),
            "ApplicationError" => Some(ErrorKind::ApplicationError),
            "Timeout" => Some(ErrorKind::Timeout),
            "PeerLost" => Some(ErrorKind::PeerLost),
            "ProtocolMismatch" => Some(ErrorKind::ProtocolMismatch),
            "Overrun" => Some(ErrorKind::Overrun),
            "IllegalState" => Some(ErrorKind::IllegalState),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type used throughout the runtime.
///
/// Carries a kind (stable across the wire), a human-readable message and an
/// optional structured descriptor. Application errors raised by a service
/// keep their original kind string in the descriptor record when the kind
/// is not one of the built-in ones.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub descriptor: Option<Value>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: message.into(),
            descriptor: None,
        }
    }

    pub fn with_descriptor(mut self, descriptor: Value) -> Error {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn unknown_receiver(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::UnknownReceiver, message)
    }

    pub fn unknown_method(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::UnknownMethod, message)
    }

    pub fn unknown_peer(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::UnknownPeer, message)
    }

    pub fn locked(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Locked, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::InvalidArgument, message)
    }

    pub fn application(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::ApplicationError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Timeout, message)
    }

    pub fn peer_lost(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::PeerLost, message)
    }

    pub fn protocol_mismatch(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::ProtocolMismatch, message)
    }

    pub fn overrun(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Overrun, message)
    }

    pub fn illegal_state(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::IllegalState, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::application(format!("i/o error: {}", err))
    }
}
