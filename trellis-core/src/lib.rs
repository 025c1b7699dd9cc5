//! # trellis-core: Peer-neutral primitives for server-driven UI components
//!
//! A server process owns a tree of stateful components; a thin client mirrors
//! each one through a connector. This crate holds everything both peers share:
//!
//! ```text
//!   server peer                                  client peer
//! ┌──────────────────┐   communication key   ┌──────────────────┐
//! │ Component<S>     │ ◄───────────────────► │ Connector<S>     │
//! │  state: S        │                       │  state: S (mirror)│
//! │  ServerRpc table │   ClientRpc calls ──► │  ClientRpc table │
//! │  listeners       │ ◄── ServerRpc calls   │  listeners       │
//! └────────┬─────────┘                       └────────┬─────────┘
//!          │ ConnectorHandle                          │ ConnectorHandle
//!          ▼                                          ▼
//!   SyncTracker (dirty set + RPC queues, one per session and peer)
//! ```
//!
//! ## Modules
//!
//! - [`key`]: Communication keys and per-session key allocation
//! - [`value`]: Serializable field/argument values
//! - [`state`]: Shared State trait, field maps, field-level diffing
//! - [`rpc`]: ClientRpc/ServerRpc contracts, dispatch tables, proxies
//! - [`listener`]: Copy-on-write listener registry
//! - [`tracker`]: Dirty set and outgoing RPC queues
//! - [`binding`]: Key → instance tables
//! - [`component`]: Server-side component instances
//! - [`connector`]: Client-side connector instances
//! - [`widgets`]: Built-in component states and RPC interfaces

pub mod binding;
pub mod component;
pub mod connector;
pub mod error;
pub mod event;
pub mod key;
pub mod listener;
pub mod rpc;
pub mod state;
pub mod tracker;
pub mod value;
pub mod widgets;

// Re-exports for convenience
pub use binding::Bindings;
pub use component::{Component, FieldState, ServerConnector};
pub use connector::{ClientConnector, Connector, ConnectorRegistry, StagedState};
pub use error::{
    BoxError, DuplicateListenerError, FireError, KeyCollisionError, ListenerFailure, RpcError,
    StateError, ValueError,
};
pub use event::{
    BlurEvent, FocusEvent, ReadOnlyStatusChangeEvent, StateChangeEvent, TreeGridExpansionEvent,
    ValueChangeEvent,
};
pub use key::{ComponentKey, KeyAllocator};
pub use listener::{Listener, ListenerId, ListenerRegistry, RegistrationHandle};
pub use rpc::{ClientRpc, RpcCall, RpcDispatchTable, RpcInterface, RpcProxy, ServerRpc};
pub use state::{diff_fields, FieldMap, SharedState, StateDiff};
pub use tracker::{ConnectorHandle, SyncTracker};
pub use value::{FromStateValue, IntoStateValue, StateValue};
