//! Client-side session context.
//!
//! Applies one [`ServerMessage`] at a time, all or nothing:
//!
//! 1. check the cycle number (a resync may skip ahead, never back)
//! 2. resolve or instantiate a connector for every update and stage its
//!    state; any failure rejects the whole message with nothing applied
//! 3. drop removed connectors (all of them on resync), bind new ones and
//!    commit staged states
//! 4. fire state change events, then dispatch ClientRpc calls in order
//!
//! ServerRpc calls made by connectors are queued on the session tracker and
//! leave with [`ClientSession::take_outgoing`].

use std::collections::HashSet;

use trellis_core::{
    Bindings, ClientConnector, ComponentKey, ConnectorHandle, ConnectorRegistry, FireError,
    StagedState, SyncTracker,
};

use crate::coordinator::DispatchFailure;
use crate::error::ProtocolError;
use crate::protocol::{ClientMessage, KeyedCall, SequenceCheck, ServerMessage};

/// What applying one server message did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub seq: u64,
    pub resync: bool,
    /// Connectors instantiated by this message, in message order
    pub created: Vec<ComponentKey>,
    pub removed: Vec<ComponentKey>,
    /// Connectors whose mirrored state actually changed
    pub state_changes: usize,
    pub dispatched: usize,
    /// Calls for keys without a connector
    pub dropped: usize,
    pub rpc_failures: Vec<DispatchFailure>,
    pub listener_failures: Vec<FireError>,
}

struct Prepared {
    key: ComponentKey,
    created: Option<Box<dyn ClientConnector>>,
    staged: Option<StagedState>,
}

pub struct ClientSession {
    registry: ConnectorRegistry,
    tracker: SyncTracker,
    bindings: Bindings<Box<dyn ClientConnector>>,
    incoming: SequenceCheck,
    outgoing_seq: u64,
}

impl ClientSession {
    pub fn new(registry: ConnectorRegistry) -> Self {
        Self {
            registry,
            tracker: SyncTracker::new(),
            bindings: Bindings::new(),
            incoming: SequenceCheck::new(),
            outgoing_seq: 0,
        }
    }

    /// Session using the built-in widget connectors.
    pub fn with_builtins() -> Self {
        Self::new(ConnectorRegistry::with_builtins())
    }

    pub fn registry_mut(&mut self) -> &mut ConnectorRegistry {
        &mut self.registry
    }

    pub fn tracker(&self) -> &SyncTracker {
        &self.tracker
    }

    pub fn keys(&self) -> &[ComponentKey] {
        self.bindings.keys()
    }

    pub fn connector_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn contains(&self, key: &ComponentKey) -> bool {
        self.bindings.contains(key)
    }

    /// Typed access to a bound connector.
    pub fn connector<C: ClientConnector>(&self, key: &ComponentKey) -> Option<&C> {
        self.bindings.resolve(key)?.as_any().downcast_ref::<C>()
    }

    pub fn connector_mut<C: ClientConnector>(&mut self, key: &ComponentKey) -> Option<&mut C> {
        self.bindings.resolve_mut(key)?.as_any_mut().downcast_mut::<C>()
    }

    /// Last server cycle applied.
    pub fn last_seq(&self) -> u64 {
        self.incoming.last()
    }

    pub fn has_outgoing(&self) -> bool {
        self.tracker.dirty_count() > 0
    }

    /// Apply one server message.
    pub fn apply(&mut self, message: &ServerMessage) -> Result<ApplyReport, ProtocolError> {
        if message.resync {
            self.incoming.check_resync(message.seq)?;
        } else {
            self.incoming.check(message.seq)?;
        }
        let prepared = self.prepare(message)?;

        let mut report = ApplyReport {
            seq: message.seq,
            resync: message.resync,
            ..ApplyReport::default()
        };

        if message.resync {
            for (key, mut connector) in self.bindings.drain() {
                connector.detach();
                report.removed.push(key);
            }
            self.tracker.clear();
        } else {
            for key in &message.removed {
                if self.release(key) {
                    report.removed.push(key.clone());
                }
            }
        }

        let mut changes = Vec::with_capacity(prepared.len());
        for Prepared { key, created, staged } in prepared {
            if let Some(mut connector) = created {
                self.tracker.register(&key);
                connector.attach(ConnectorHandle::bound(key.clone(), self.tracker.clone()));
                self.bindings.bind(key.clone(), connector).map_err(|e| ProtocolError::RepeatedKey(e.key))?;
                report.created.push(key.clone());
            }
            if let (Some(staged), Some(connector)) = (staged, self.bindings.resolve_mut(&key)) {
                let full = staged.is_full();
                let changed = connector.commit_state(staged);
                changes.push((key, changed, full));
            }
        }

        for (key, changed, full) in changes {
            let Some(connector) = self.bindings.resolve(&key) else {
                continue;
            };
            if !changed.is_empty() {
                report.state_changes += 1;
            }
            if let Err(e) = connector.fire_state_change(changed, full) {
                log::debug!("State listeners failed for {key}: {e}");
                report.listener_failures.push(e);
            }
        }

        for update in &message.updates {
            for call in &update.calls {
                let Some(connector) = self.bindings.resolve_mut(&update.key) else {
                    log::trace!(
                        "Dropping {}.{} for unknown key {}",
                        call.interface,
                        call.method,
                        update.key
                    );
                    report.dropped += 1;
                    continue;
                };
                match connector.dispatch_rpc(call) {
                    Ok(()) => report.dispatched += 1,
                    Err(error) => {
                        log::debug!("ClientRpc dispatch to {} failed: {error}", update.key);
                        report.rpc_failures.push(DispatchFailure {
                            key: update.key.clone(),
                            error,
                        });
                    }
                }
            }
        }

        self.incoming.accept(message.seq);
        Ok(report)
    }

    /// Validate the whole message and stage every state change.
    fn prepare(&self, message: &ServerMessage) -> Result<Vec<Prepared>, ProtocolError> {
        let removed: HashSet<&ComponentKey> = message.removed.iter().collect();
        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(message.updates.len());

        for update in &message.updates {
            if !seen.insert(&update.key) {
                return Err(ProtocolError::RepeatedKey(update.key.clone()));
            }

            let existing = if message.resync || removed.contains(&update.key) {
                None
            } else {
                self.bindings.resolve(&update.key)
            };

            let created = match (existing, &update.connector_type) {
                (Some(bound), Some(connector_type)) if bound.connector_type() != connector_type.as_str() => {
                    return Err(ProtocolError::ConnectorTypeMismatch {
                        key: update.key.clone(),
                        bound: bound.connector_type().to_string(),
                        received: connector_type.clone(),
                    });
                }
                (Some(_), _) => None,
                (None, Some(connector_type)) => {
                    let connector = self.registry.create(connector_type).ok_or_else(|| {
                        ProtocolError::UnknownConnectorType {
                            key: update.key.clone(),
                            connector_type: connector_type.clone(),
                        }
                    })?;
                    Some(connector)
                }
                (None, None) => {
                    if update.state.is_some() {
                        return Err(ProtocolError::UnboundKey(update.key.clone()));
                    }
                    // Calls for a key we do not know are dropped at dispatch
                    None
                }
            };

            let staged = match &update.state {
                Some(diff) => {
                    let target: &dyn ClientConnector = match (&created, existing) {
                        (Some(new), _) => &**new,
                        (None, Some(bound)) => &**bound,
                        (None, None) => return Err(ProtocolError::UnboundKey(update.key.clone())),
                    };
                    let staged = target.stage_state(diff).map_err(|source| ProtocolError::InvalidState {
                        key: update.key.clone(),
                        source,
                    })?;
                    Some(staged)
                }
                None => None,
            };

            prepared.push(Prepared {
                key: update.key.clone(),
                created,
                staged,
            });
        }

        Ok(prepared)
    }

    fn release(&mut self, key: &ComponentKey) -> bool {
        let Some(mut connector) = self.bindings.unbind(key) else {
            return false;
        };
        self.tracker.release(key);
        connector.detach();
        true
    }

    /// Collect every queued ServerRpc call, in the order the calls were made,
    /// into the next numbered client message.
    pub fn take_outgoing(&mut self) -> ClientMessage {
        self.outgoing_seq += 1;
        let calls = self
            .tracker
            .drain_calls_in_order()
            .into_iter()
            .map(|(key, call)| KeyedCall { key, call })
            .collect();
        ClientMessage {
            seq: self.outgoing_seq,
            calls,
        }
    }

    /// Drop every connector and restart numbering in both directions, for a
    /// brand new server session.
    pub fn reset(&mut self) {
        for (_, mut connector) in self.bindings.drain() {
            connector.detach();
        }
        self.tracker.clear();
        self.incoming.reset();
        self.outgoing_seq = 0;
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("connectors", &self.bindings.len())
            .field("last_seq", &self.incoming.last())
            .field("outgoing_seq", &self.outgoing_seq)
            .finish()
    }
}
