//! Server-side component instances.
//!
//! A [`Component<S>`] owns its Shared State, the snapshot last sent to the
//! client, its ServerRpc dispatch table and its listeners. It reaches the
//! session only through its [`ConnectorHandle`]: reading state is free,
//! `state_mut()` marks the component dirty, `client_rpc()` queues calls.
//!
//! The session stores components as `Box<dyn ServerConnector>` so one
//! binding table can hold every component type.

use std::any::Any;
use std::fmt;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::{BoxError, DuplicateListenerError, FireError, RpcError};
use crate::event::{ReadOnlyStatusChangeEvent, ValueChangeEvent};
use crate::key::ComponentKey;
use crate::listener::{Listener, ListenerRegistry, RegistrationHandle};
use crate::rpc::{ClientRpc, RpcCall, RpcDispatchTable, RpcProxy, ServerRpc};
use crate::state::{diff_fields, FieldMap, SharedState, StateDiff};
use crate::tracker::ConnectorHandle;
use crate::value::{IntoStateValue, StateValue};

/// Object-safe view of a server component, used by the session and the
/// cycle coordinator.
pub trait ServerConnector: Send + 'static {
    /// Connector type the client instantiates for this component.
    fn connector_type(&self) -> &'static str;

    fn handle(&self) -> &ConnectorHandle;

    /// Called by the session when the component is bound to a key.
    fn attach(&mut self, handle: ConnectorHandle);

    /// Called by the session when the key is released.
    fn detach(&mut self);

    /// The client has received this component's state at least once.
    fn is_synced(&self) -> bool;

    /// Forget the synced snapshot so the next encode sends full state.
    fn reset_sync(&mut self);

    /// Full state on first sync, otherwise only changed fields. `None` when
    /// nothing changed since the last encode.
    fn encode_state(&mut self) -> Option<StateDiff>;

    fn dispatch_rpc(&mut self, call: &RpcCall) -> Result<(), RpcError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct Component<S: SharedState> {
    handle: ConnectorHandle,
    state: S,
    /// Field map last sent to the client (None = never sent)
    synced: Option<FieldMap>,
    listeners: ListenerRegistry,
    rpc: RpcDispatchTable<Component<S>>,
}

impl<S: SharedState> Component<S> {
    pub fn new() -> Self {
        Self::with_state(S::default())
    }

    pub fn with_state(state: S) -> Self {
        Self {
            handle: ConnectorHandle::detached(),
            state,
            synced: None,
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

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Mutable access to the shared state. Marks the component dirty; the
    /// actual diff is computed at cycle end, so writes that restore the
    /// previous values produce no update.
    pub fn state_mut(&mut self) -> &mut S {
        self.handle.mark_dirty();
        &mut self.state
    }

    pub fn mark_dirty(&self) -> bool {
        self.handle.mark_dirty()
    }

    /// Typed sender for a ClientRpc interface.
    pub fn client_rpc<R: ClientRpc>(&self) -> RpcProxy<R> {
        RpcProxy::new(self.handle.clone())
    }

    /// Queue one ClientRpc call. Returns `false` if dropped.
    pub fn call_client<R: ClientRpc>(&self, rpc: R) -> bool {
        self.handle.enqueue_rpc(rpc.into_call())
    }

    /// Register the handler for a ServerRpc interface.
    pub fn register_rpc<R, F>(&mut self, handler: F)
    where
        R: ServerRpc,
        F: Fn(&mut Component<S>, R) -> Result<(), BoxError> + Send + Sync + 'static,
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

    /// Record `field`'s current value as already known to the client.
    ///
    /// Used when the client itself originated the change.
    pub fn confirm_synced_field(&mut self, field: &str) {
        let Some(synced) = self.synced.as_mut() else {
            return;
        };
        if let Some(value) = self.state.to_fields().remove(field) {
            synced.insert(field.to_string(), value);
        }
    }

    /// Record `value` as the client's copy of `field`, forcing a resend of
    /// the server value if they differ.
    fn override_synced_field(&mut self, field: &str, value: StateValue) {
        if let Some(synced) = self.synced.as_mut() {
            synced.insert(field.to_string(), value);
            self.handle.mark_dirty();
        }
    }
}

impl<S: SharedState> Default for Component<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SharedState> Debug for Component<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("type", &S::TYPE_NAME)
            .field("key", &self.key())
            .field("state", &self.state)
            .field("synced", &self.synced.is_some())
            .finish()
    }
}

impl<S: SharedState> ServerConnector for Component<S> {
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
        self.synced = None;
    }

    fn is_synced(&self) -> bool {
        self.synced.is_some()
    }

    fn reset_sync(&mut self) {
        self.synced = None;
    }

    fn encode_state(&mut self) -> Option<StateDiff> {
        let current = self.state.to_fields();
        match &self.synced {
            None => {
                self.synced = Some(current.clone());
                Some(StateDiff::full(current))
            }
            Some(previous) => {
                let changed = diff_fields(previous, &current);
                if changed.is_empty() {
                    return None;
                }
                self.synced = Some(current);
                Some(StateDiff::partial(changed))
            }
        }
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

/// Shared State of an editable field: one value plus a read-only flag.
pub trait FieldState: SharedState {
    type Value: Clone + PartialEq + Debug + IntoStateValue + Send + Sync + 'static;

    /// Name of the state field holding the value.
    const VALUE_FIELD: &'static str;

    fn value(&self) -> &Self::Value;
    fn set_value(&mut self, value: Self::Value);
    fn read_only(&self) -> bool;
    fn set_read_only(&mut self, read_only: bool);
}

impl<S: FieldState> Component<S> {
    pub fn value(&self) -> &S::Value {
        self.state.value()
    }

    /// Set the value from server code. Fires a [`ValueChangeEvent`] only if
    /// the value differs; returns whether it changed.
    pub fn set_value(&mut self, value: S::Value) -> Result<bool, FireError> {
        self.change_value(value, false)
    }

    /// Apply a value sent by the client.
    ///
    /// The client already shows this value, so it is not echoed back. On a
    /// read-only field the change is refused and the server value is resent.
    pub fn set_value_from_client(&mut self, value: S::Value) -> Result<bool, FireError> {
        if self.state.read_only() {
            log::warn!(
                "Ignoring client value change on read-only {} {:?}",
                S::TYPE_NAME,
                self.key()
            );
            self.override_synced_field(S::VALUE_FIELD, value.into_state_value());
            return Ok(false);
        }
        self.change_value(value, true)
    }

    fn change_value(&mut self, value: S::Value, user_originated: bool) -> Result<bool, FireError> {
        if *self.state.value() == value {
            return Ok(false);
        }
        let old_value = self.state.value().clone();
        self.state_mut().set_value(value.clone());
        if user_originated {
            self.confirm_synced_field(S::VALUE_FIELD);
        }

        let event = ValueChangeEvent {
            source: self.key().cloned(),
            old_value,
            new_value: value,
            user_originated,
        };
        self.fire_event(&event)?;
        Ok(true)
    }

    pub fn is_read_only(&self) -> bool {
        self.state.read_only()
    }

    /// Fires a [`ReadOnlyStatusChangeEvent`] only if the flag flips.
    pub fn set_read_only(&mut self, read_only: bool) -> Result<bool, FireError> {
        if self.state.read_only() == read_only {
            return Ok(false);
        }
        self.state_mut().set_read_only(read_only);
        let event = ReadOnlyStatusChangeEvent {
            source: self.key().cloned(),
            read_only,
        };
        self.fire_event(&event)?;
        Ok(true)
    }

    pub fn add_value_change_listener(
        &self,
        listener: Listener<ValueChangeEvent<S::Value>>,
    ) -> Result<RegistrationHandle, DuplicateListenerError> {
        self.listeners.add_listener(listener)
    }

    pub fn add_read_only_status_change_listener(
        &self,
        listener: Listener<ReadOnlyStatusChangeEvent>,
    ) -> Result<RegistrationHandle, DuplicateListenerError> {
        self.listeners.add_listener(listener)
    }
}
