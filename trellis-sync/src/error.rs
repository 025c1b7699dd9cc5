//! Error types for the synchronization layer.

use thiserror::Error;
use trellis_core::{ComponentKey, KeyCollisionError, StateError};
use uuid::Uuid;

use crate::protocol::MessageType;

/// A malformed, misordered or unroutable message. Recovering requires a
/// resynchronization (full state resend) or ending the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected message type {0:?}")]
    UnexpectedMessage(MessageType),
    #[error("Duplicate message: sequence {received} already applied (last {last})")]
    Duplicate { last: u64, received: u64 },
    #[error("Out-of-order message: expected sequence {expected}, got {received}")]
    OutOfOrder { expected: u64, received: u64 },
    #[error("State diff for unbound key {0}")]
    UnboundKey(ComponentKey),
    #[error("Key {0} appears twice in one message")]
    RepeatedKey(ComponentKey),
    #[error("Unknown connector type '{connector_type}' for key {key}")]
    UnknownConnectorType {
        key: ComponentKey,
        connector_type: String,
    },
    #[error("Key {key} is bound to a {bound} connector, message says {received}")]
    ConnectorTypeMismatch {
        key: ComponentKey,
        bound: String,
        received: String,
    },
    #[error("Invalid state for key {key}: {source}")]
    InvalidState {
        key: ComponentKey,
        source: StateError,
    },
    #[error("Server fault: {0}")]
    Fault(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// A retransmission of an already applied message; safe to ignore.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Session-level failure.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    KeyCollision(#[from] KeyCollisionError),
    #[error("Session {0} not found")]
    SessionNotFound(Uuid),
    #[error("Session limit of {0} reached")]
    SessionLimit(usize),
    #[error("UI provider failed: {0}")]
    Provider(String),
}
