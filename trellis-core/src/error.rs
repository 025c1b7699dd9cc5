//! Error taxonomy shared by both peers.
//!
//! | Error                   | Meaning                                        |
//! |-------------------------|------------------------------------------------|
//! | `DuplicateListenerError`| same listener instance added twice             |
//! | `KeyCollisionError`     | key already bound on this peer                 |
//! | `StateError`            | state diff does not fit the state type         |
//! | `RpcError`              | call cannot be decoded or its handler failed   |
//! | `FireError`             | one or more listeners failed during a pass     |
//!
//! Work that targets an unbound key is not an error anywhere in this crate:
//! it is dropped and logged at `trace`.

use thiserror::Error;

use crate::key::ComponentKey;
use crate::listener::ListenerId;

/// Boxed error returned by application callbacks and RPC handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A single value could not be converted to the requested Rust type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected}, found {found}")]
pub struct ValueError {
    pub expected: &'static str,
    pub found: &'static str,
}

impl ValueError {
    pub fn new(expected: &'static str, found: &'static str) -> Self {
        Self { expected, found }
    }

    /// Attach the name of the state field being converted.
    pub fn for_field(self, field: &str) -> StateError {
        StateError::TypeMismatch {
            field: field.to_string(),
            expected: self.expected,
            found: self.found,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Unknown state field: {0}")]
    UnknownField(String),
    #[error("Type mismatch for field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("No handler registered for {interface}.{method}")]
    NotRegistered { interface: String, method: String },
    #[error("Unknown method {interface}.{method}")]
    UnknownMethod { interface: String, method: String },
    #[error("{interface}.{method} expects {expected} arguments, got {found}")]
    Arity {
        interface: String,
        method: String,
        expected: usize,
        found: usize,
    },
    #[error("Argument '{argument}' of {interface}.{method}: {source}")]
    ArgumentType {
        interface: String,
        method: String,
        argument: String,
        source: ValueError,
    },
    #[error("Handler for {interface}.{method} failed: {message}")]
    Handler {
        interface: String,
        method: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Listener already registered for {event_type}")]
pub struct DuplicateListenerError {
    pub event_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Communication key already bound: {key}")]
pub struct KeyCollisionError {
    pub key: ComponentKey,
}

/// One listener that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub listener: ListenerId,
    pub message: String,
}

/// Aggregate failure of a fire pass. Every listener in the pass was invoked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} listener(s) failed for {event_type}", failures.len())]
pub struct FireError {
    pub event_type: &'static str,
    pub failures: Vec<ListenerFailure>,
}

impl FireError {
    pub fn messages(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.message.as_str()).collect()
    }
}
