use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::address::Address;
use crate::error::{Error, ErrorKind};
use crate::value::{Args, Timestamp, Value};

/// Protocol version carried in handshakes and discovery responses.
/// Bumped whenever the wire encoding changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Application-level error payload carried inside a reply message.
///
/// The kind is a string so that peers can transport kinds they do not know;
/// a receiver maps it back to a local [`ErrorKind`], falling back to
/// `ApplicationError` while preserving the original kind string in the
/// descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub descriptor: Option<Value>,
}

impl From<Error> for RemoteError {
    fn from(err: Error) -> RemoteError {
        RemoteError {
            kind: err.kind.as_str().to_string(),
            message: err.message,
            descriptor: err.descriptor,
        }
    }
}

impl From<RemoteError> for Error {
    fn from(remote: RemoteError) -> Error {
        match ErrorKind::parse(&remote.kind) {
            Some(kind) => Error {
                kind,
                message: remote.message,
                descriptor: remote.descriptor,
            },
            None => {
                // Unknown kind from a foreign implementation; keep the
                // original kind string in the descriptor record.
                let mut fields = BTreeMap::new();
                fields.insert("kind".to_string(), Value::Str(remote.kind));
                if let Some(descriptor) = remote.descriptor {
                    fields.insert("descriptor".to_string(), descriptor);
                }
                Error {
                    kind: ErrorKind::ApplicationError,
                    message: remote.message,
                    descriptor: Some(Value::Record {
                        tag: "foreign_error".to_string(),
                        fields,
                    }),
                }
            }
        }
    }
}

/// A message routed between handlers, within a context or across a peer
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Method invocation; expects exactly one corresponding reply.
    Request {
        source: Address,
        destination: Address,
        request_id: u64,
        method: String,
        args: Args,
        lock_token: Option<String>,
    },
    /// Successful or failed completion of a request.
    Reply {
        source: Address,
        destination: Address,
        request_id: u64,
        result: Result<Value, RemoteError>,
    },
    /// Transport or protocol level failure of a request, distinct from an
    /// application-level error raised by the service.
    ErrorReply {
        source: Address,
        destination: Address,
        request_id: u64,
        kind: String,
        message: String,
    },
    /// Published signal payload on its way to one subscriber.
    Signal {
        source: Address,
        destination: Address,
        name: String,
        seq: u64,
        timestamp: Timestamp,
        payload: Value,
    },
    /// First frame on every peer connection, in both directions.
    Handshake {
        context: String,
        workgroup: String,
        protocol_version: u32,
    },
}

/// Allocate a fresh 64-bit random request id.
pub fn new_request_id() -> u64 {
    rand::thread_rng().gen()
}

impl Message {
    /// Source endpoint, if this message kind carries one.
    pub fn source(&self) -> Option<&Address> {
        match self {
            Message::Request { source, .. }
            | Message::Reply { source, .. }
            | Message::ErrorReply { source, .. }
            | Message::Signal { source, .. } => Some(source),
            Message::Handshake { .. } => None,
        }
    }

    /// Destination endpoint, if this message kind carries one.
    pub fn destination(&self) -> Option<&Address> {
        match self {
            Message::Request { destination, .. }
            | Message::Reply { destination, .. }
            | Message::ErrorReply { destination, .. }
            | Message::Signal { destination, .. } => Some(destination),
            Message::Handshake { .. } => None,
        }
    }

    /// Request id for messages that participate in request/reply pairing.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::Request { request_id, .. }
            | Message::Reply { request_id, .. }
            | Message::ErrorReply { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Message::Reply { .. } | Message::ErrorReply { .. })
    }

    /// Build a reply to a request, endpoints swapped.
    pub fn reply_to(request: &Message, result: Result<Value, RemoteError>) -> Option<Message> {
        match request {
            Message::Request {
                source,
                destination,
                request_id,
                ..
            } => Some(Message::Reply {
                source: destination.clone(),
                destination: source.clone(),
                request_id: *request_id,
                result,
            }),
            _ => None,
        }
    }

    /// Build an error reply to a request, endpoints swapped.
    pub fn error_reply_to(request: &Message, error: &Error) -> Option<Message> {
        match request {
            Message::Request {
                source,
                destination,
                request_id,
                ..
            } => Some(Message::ErrorReply {
                source: destination.clone(),
                destination: source.clone(),
                request_id: *request_id,
                kind: error.kind.as_str().to_string(),
                message: error.message.clone(),
            }),
            _ => None,
        }
    }
}
