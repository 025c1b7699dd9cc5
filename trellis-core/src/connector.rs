//! Client-side connector instances.
//!
//! A [`Connector<S>`] mirrors the Shared State of one server component. The
//! mirror is only written by applying server diffs, in two steps so a whole
//! message can be validated before anything is committed:
//!
//! ```text
//!   stage_state(diff) ──► StagedState ──► commit_state() ──► fire_state_change()
//!        (no effect)        (owned copy)     (swap mirror)      (listeners)
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{BoxError, DuplicateListenerError, FireError, RpcError, StateError};
use crate::event::StateChangeEvent;
use crate::key::ComponentKey;
use crate::listener::{Listener, ListenerRegistry, RegistrationHandle};
use crate::rpc::{ClientRpc, RpcCall, RpcDispatchTable, RpcProxy, ServerRpc};
use crate::state::{apply_atomic, diff_fields, SharedState, StateDiff};
use crate::tracker::ConnectorHandle;

/// A validated state update waiting to be committed.
pub struct StagedState {
    changed: Vec<String>,
    full: bool,
    state: Box<dyn Any + Send>,
}

impl StagedState {
    /// Fields whose value differs from the current mirror.
    pub fn changed(&self) -> &[String] {
        &self.changed
    }

    pub fn is_full(&self) -> bool {
        self.full
    }
}

impl fmt::Debug for StagedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedState")
            .field("changed", &self.changed)
            .field("full", &self.full)
            .finish()
    }
}

/// Object-safe view of a client connector, used by the client session.
pub trait ClientConnector: Send + 'static {
    fn connector_type(&self) -> &'static str;

    fn handle(&self) -> &ConnectorHandle;

    fn attach(&mut self, handle: ConnectorHandle);

    fn detach(&mut self);

    /// Validate `diff` against a copy of the mirror. A full diff starts from
    /// the default state.
    fn stage_state(&self, diff: &StateDiff) -> Result<StagedState, StateError>;

    /// Swap in a staged state. Returns the changed field names.
    fn commit_state(&mut self, staged: StagedState) -> Vec<String>;

    fn fire_state_change(&self, changed: Vec<String>, full: bool) -> Result<usize, FireError>;

    fn dispatch_rpc(&mut self, call: &RpcCall) -> Result<(), RpcError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct Connector<S: SharedState> {
    handle: ConnectorHandle,
    state: S,
    received: bool,
    listeners: ListenerRegistry,
    rpc: RpcDispatchTable<Connector<S>>,
}

impl<S: SharedState> Connector<S> {
    pub fn new() -> Self {
        Self {
            handle: ConnectorHandle::detached(),
            state: S::default(),
            received: false,
            listeners: ListenerRegistry::new(),
            rpc: RpcDispatchTable::new(),
        }
    }

    pub fn key(&self) -> Option<&ComponentKey> {
        self.handle.key()
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_attached()
    }

    /// Local mirror of the server's state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Write to the mirror for a value the user changed in the UI and the
    /// server will not echo back. Does not fire a state change event.
    pub fn update_local(&mut self, update: impl FnOnce(&mut S)) {
        update(&mut self.state);
    }

    /// At least one state update has been applied.
    pub fn has_state(&self) -> bool {
        self.received
    }

    /// Typed sender for a ServerRpc interface.
    pub fn server_rpc<R: ServerRpc>(&self) -> RpcProxy<R> {
        RpcProxy::new(self.handle.clone())
    }

    pub fn call_server<R: ServerRpc>(&self, rpc: R) -> bool {
        self.handle.enqueue_rpc(rpc.into_call())
    }

    /// Register the handler for a ClientRpc interface.
    pub fn register_rpc<R, F>(&mut self, handler: F)
    where
        R: ClientRpc,
        F: Fn(&mut Connector<S>, R) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.rpc.register::<R, F>(handler);
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn add_listener<E: 'static>(
        &self,
        listener: Listener<E>,
    ) -> Result<RegistrationHandle, DuplicateListenerError> {
        self.listeners.add_listener(listener)
    }

    pub fn remove_listener(&self, handle: &RegistrationHandle) -> bool {
        self.listeners.remove_listener(handle)
    }

    pub fn fire_event<E: 'static>(&self, event: &E) -> Result<usize, FireError> {
        self.listeners.fire_event(event)
    }

    pub fn add_state_change_listener(
        &self,
        listener: Listener<StateChangeEvent>,
    ) -> Result<RegistrationHandle, DuplicateListenerError> {
        self.listeners.add_listener(listener)
    }
}

impl<S: SharedState> Default for Connector<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SharedState> fmt::Debug for Connector<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("type", &S::TYPE_NAME)
            .field("key", &self.key())
            .field("state", &self.state)
            .finish()
    }
}

impl<S: SharedState> ClientConnector for Connector<S> {
    fn connector_type(&self) -> &'static str {
        S::TYPE_NAME
    }

    fn handle(&self) -> &ConnectorHandle {
        &self.handle
    }

    fn attach(&mut self, handle: ConnectorHandle) {
        self.handle = handle;
    }

    fn detach(&mut self) {
        self.handle = ConnectorHandle::detached();
    }

    fn stage_state(&self, diff: &StateDiff) -> Result<StagedState, StateError> {
        let mut next = if diff.full {
            S::default()
        } else {
            self.state.clone()
        };
        apply_atomic(&mut next, &diff.fields)?;

        let current = next.to_fields();
        let changed = if self.received {
            diff_fields(&self.state.to_fields(), &current)
                .into_keys()
                .collect()
        } else {
            current.into_keys().collect()
        };

        Ok(StagedState {
            changed,
            full: diff.full,
            state: Box::new(next),
        })
    }

    fn commit_state(&mut self, staged: StagedState) -> Vec<String> {
        match staged.state.downcast::<S>() {
            Ok(state) => {
                self.state = *state;
                self.received = true;
                staged.changed
            }
            Err(_) => {
                log::error!("Staged state does not belong to {}", S::TYPE_NAME);
                Vec::new()
            }
        }
    }

    fn fire_state_change(&self, changed: Vec<String>, full: bool) -> Result<usize, FireError> {
        if changed.is_empty() && !full {
            return Ok(0);
        }
        let event = StateChangeEvent {
            key: self.key().cloned(),
            changed_fields: changed,
            full,
        };
        self.listeners.fire_event(&event)
    }

    fn dispatch_rpc(&mut self, call: &RpcCall) -> Result<(), RpcError> {
        let handler = self.rpc.resolve(call)?;
        match catch_unwind(AssertUnwindSafe(|| handler(self, call))) {
            Ok(result) => result,
            Err(_) => Err(RpcError::Handler {
                interface: call.interface.clone(),
                method: call.method.clone(),
                message: "handler panicked".to_string(),
            }),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

type ConnectorFactory = Arc<dyn Fn() -> Box<dyn ClientConnector> + Send + Sync>;

/// Connector type name → factory. The client session uses it to instantiate
/// connectors for keys announced by the server.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: HashMap<&'static str, ConnectorFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in widget connectors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::widgets::register_builtin_connectors(&mut registry);
        registry
    }

    /// Register a factory for `S`'s connector type. Replaces an existing one.
    pub fn register<S, F>(&mut self, make: F)
    where
        S: SharedState,
        F: Fn() -> Connector<S> + Send + Sync + 'static,
    {
        let factory: ConnectorFactory =
            Arc::new(move || -> Box<dyn ClientConnector> { Box::new(make()) });
        if self.factories.insert(S::TYPE_NAME, factory).is_some() {
            log::debug!("Replacing connector factory for {}", S::TYPE_NAME);
        }
    }

    /// Register a connector with no RPC handlers or listeners.
    pub fn register_default<S: SharedState>(&mut self) {
        self.register::<S, _>(Connector::<S>::new);
    }

    pub fn create(&self, connector_type: &str) -> Option<Box<dyn ClientConnector>> {
        self.factories.get(connector_type).map(|factory| factory())
    }

    pub fn contains(&self, connector_type: &str) -> bool {
        self.factories.contains_key(connector_type)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("ConnectorRegistry")
            .field("types", &types)
            .finish()
    }
}
