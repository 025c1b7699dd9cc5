//! # trellis-sync: Synchronization cycles for trellis components
//!
//! Moves Shared State diffs and RPC calls between a server session and its
//! client, one cycle at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐    WebSocket     ┌───────────────┐
//! │ SyncClient    │ ◄──────────────► │ SyncServer    │
//! │ ClientSession │   bincode frames │ SessionManager│
//! └──────┬────────┘                  └──────┬────────┘
//!        │                                  │ per-session lock
//!        ▼                                  ▼
//! ┌───────────────┐                  ┌───────────────┐
//! │ Connectors    │                  │ ServerSession │
//! │ (mirrors)     │                  │ + coordinator │
//! └───────────────┘                  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire frames, cycle payloads, sequence checking
//! - [`coordinator`]: Incoming dispatch and outgoing collection
//! - [`session`]: Server-side session context
//! - [`client_session`]: Client-side session context
//! - [`manager`]: Session registry with per-session locks
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod client;
pub mod client_session;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use client_session::{ApplyReport, ClientSession};
pub use coordinator::{CycleOutcome, DispatchFailure, DispatchReport};
pub use error::{ProtocolError, SyncError};
pub use manager::{SessionManager, SharedSession, UiProvider};
pub use protocol::{
    ClientMessage, ConnectorUpdate, KeyedCall, MessageType, SequenceCheck, ServerMessage,
    SyncMessage,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{ServerSession, SessionTasks};
