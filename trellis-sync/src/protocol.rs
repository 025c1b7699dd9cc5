//! Binary wire protocol for synchronization cycles.
//!
//! Every frame is one bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌──────────┬────────────┬──────────────────────────────────────┐
//! │ msg_type │ session_id │ payload                              │
//! │ 1 byte   │ 16 bytes   │ ServerMessage | ClientMessage | text │
//! └──────────┴────────────┴──────────────────────────────────────┘
//! ```
//!
//! A server cycle carries, per communication key, an optional state diff
//! and the ClientRpc calls queued for it, in enqueue order. A client cycle
//! carries its ServerRpc calls as one flat list in the order they were made,
//! so the server dispatches them in exactly that order.
//!
//! Both directions number their cycles from 1. The receiver expects exactly
//! `last + 1`: a lower number is a duplicate, a higher one means a message
//! was lost. A resync may jump ahead but never back.

use serde::{Deserialize, Serialize};
use trellis_core::{ComponentKey, RpcCall, StateDiff};
use uuid::Uuid;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client opens (or resumes) a session
    Hello = 1,
    /// Server → client cycle
    ServerCycle = 2,
    /// Client → server cycle
    ClientCycle = 3,
    Ping = 4,
    Pong = 5,
    /// Server rejected a client message; a resync follows
    Fault = 6,
}

/// Everything the client needs for one key in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorUpdate {
    pub key: ComponentKey,
    /// Present the first time the client hears about the key
    pub connector_type: Option<String>,
    pub state: Option<StateDiff>,
    pub calls: Vec<RpcCall>,
}

/// Server → client payload of one cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerMessage {
    pub seq: u64,
    /// Full resend: the client discards every connector before applying
    pub resync: bool,
    pub updates: Vec<ConnectorUpdate>,
    /// Keys unbound on the server since the last cycle
    pub removed: Vec<ComponentKey>,
}

impl ServerMessage {
    /// No updates and no removals.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.removed.is_empty()
    }

    pub fn update(&self, key: &ComponentKey) -> Option<&ConnectorUpdate> {
        self.updates.iter().find(|u| &u.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedCall {
    pub key: ComponentKey,
    pub call: RpcCall,
}

/// Client → server payload of one cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClientMessage {
    pub seq: u64,
    pub calls: Vec<KeyedCall>,
}

/// Top-level frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Nil in a `Hello` that asks for a new session
    pub session_id: Uuid,
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl SyncMessage {
    fn empty(msg_type: MessageType, session_id: Uuid) -> Self {
        Self {
            msg_type,
            session_id,
            payload: Vec::new(),
        }
    }

    /// Open a new session (`None`) or resume an existing one.
    pub fn hello(session_id: Option<Uuid>) -> Self {
        Self::empty(MessageType::Hello, session_id.unwrap_or_else(Uuid::nil))
    }

    pub fn server_cycle(session_id: Uuid, message: &ServerMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::ServerCycle,
            session_id,
            payload: encode_payload(message)?,
        })
    }

    pub fn client_cycle(session_id: Uuid, message: &ClientMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::ClientCycle,
            session_id,
            payload: encode_payload(message)?,
        })
    }

    pub fn ping(session_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, session_id)
    }

    pub fn pong(session_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, session_id)
    }

    pub fn fault(session_id: Uuid, reason: &str) -> Self {
        Self {
            msg_type: MessageType::Fault,
            session_id,
            payload: reason.as_bytes().to_vec(),
        }
    }

    /// The session this `Hello` asks to resume, if any.
    pub fn resume_id(&self) -> Option<Uuid> {
        (self.msg_type == MessageType::Hello && !self.session_id.is_nil())
            .then_some(self.session_id)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    pub fn server_message(&self) -> Result<ServerMessage, ProtocolError> {
        if self.msg_type != MessageType::ServerCycle {
            return Err(ProtocolError::UnexpectedMessage(self.msg_type));
        }
        decode_payload(&self.payload)
    }

    pub fn client_message(&self) -> Result<ClientMessage, ProtocolError> {
        if self.msg_type != MessageType::ClientCycle {
            return Err(ProtocolError::UnexpectedMessage(self.msg_type));
        }
        decode_payload(&self.payload)
    }

    pub fn fault_reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Fault {
            return Err(ProtocolError::UnexpectedMessage(self.msg_type));
        }
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }
}

/// Receiver-side cycle numbering for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCheck {
    last: u64,
}

impl SequenceCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn expected(&self) -> u64 {
        self.last + 1
    }

    /// Validate `seq` without consuming it.
    pub fn check(&self, seq: u64) -> Result<(), ProtocolError> {
        let expected = self.expected();
        if seq == expected {
            Ok(())
        } else if seq <= self.last {
            Err(ProtocolError::Duplicate {
                last: self.last,
                received: seq,
            })
        } else {
            Err(ProtocolError::OutOfOrder {
                expected,
                received: seq,
            })
        }
    }

    /// Validate a resync. It may skip ahead of `expected()` to re-align the
    /// numbering, but an already applied number is still a duplicate.
    pub fn check_resync(&self, seq: u64) -> Result<(), ProtocolError> {
        if seq <= self.last {
            return Err(ProtocolError::Duplicate {
                last: self.last,
                received: seq,
            });
        }
        Ok(())
    }

    /// Record `seq` as applied. Also used to re-align after a resync.
    pub fn accept(&mut self, seq: u64) {
        self.last = seq;
    }

    pub fn reset(&mut self) {
        self.last = 0;
    }
}
