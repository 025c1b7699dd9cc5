//! Synchronization cycle coordinator.
//!
//! One cycle is strictly two-phase:
//!
//! ```text
//!  incoming ClientMessage            outgoing ServerMessage
//!  ──────────────────────            ──────────────────────
//!  dispatch every call in order  ─►  snapshot + clear dirty set
//!  (failures isolated per call)      encode state diff per dirty key
//!  run deferred session tasks        attach queued ClientRpc calls
//! ```
//!
//! Nothing is serialized until the incoming phase has finished, so every
//! side effect of the client's calls lands in the same response.

use std::collections::HashSet;

use trellis_core::{Bindings, ComponentKey, RpcError, ServerConnector, SyncTracker};

use crate::protocol::{ConnectorUpdate, KeyedCall, ServerMessage};

/// One ServerRpc call that failed to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFailure {
    pub key: ComponentKey,
    pub error: RpcError,
}

/// Aggregated result of the incoming phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub dispatched: usize,
    /// Calls addressed to keys that are no longer bound
    pub dropped: usize,
    pub failures: Vec<DispatchFailure>,
    /// Deferred session tasks that returned an error
    pub task_failures: Vec<String>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.task_failures.is_empty()
    }
}

/// Result of running one full cycle on a server session.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub report: DispatchReport,
    pub response: ServerMessage,
}

pub(crate) type ServerBindings = Bindings<Box<dyn ServerConnector>>;

/// Dispatch `calls` in message order. A call for an unbound key is dropped;
/// a failing call does not stop the rest.
pub(crate) fn dispatch_calls(bindings: &mut ServerBindings, calls: &[KeyedCall]) -> DispatchReport {
    let mut report = DispatchReport::default();

    for KeyedCall { key, call } in calls {
        let Some(component) = bindings.resolve_mut(key) else {
            log::trace!(
                "Dropping {}.{} for unbound key {key}",
                call.interface,
                call.method
            );
            report.dropped += 1;
            continue;
        };

        match component.dispatch_rpc(call) {
            Ok(()) => report.dispatched += 1,
            Err(error) => {
                log::debug!("Dispatch to {key} failed: {error}");
                report.failures.push(DispatchFailure {
                    key: key.clone(),
                    error,
                });
            }
        }
    }

    report
}

/// Build the update list of one outgoing message.
///
/// Incremental: one entry per dirty key that has a state diff or queued
/// calls, in the order the keys became dirty. Resync: every bound key in
/// bind order with full state, keeping any calls still queued.
pub(crate) fn collect_updates(
    bindings: &mut ServerBindings,
    tracker: &SyncTracker,
    announced: &mut HashSet<ComponentKey>,
    resync: bool,
) -> Vec<ConnectorUpdate> {
    let mut pending = tracker.drain_cycle();

    if resync {
        announced.clear();
        let keys = bindings.keys().to_vec();
        pending = keys
            .into_iter()
            .map(|key| {
                let calls = pending
                    .iter_mut()
                    .find(|(k, _)| *k == key)
                    .map(|(_, calls)| std::mem::take(calls))
                    .unwrap_or_default();
                (key, calls)
            })
            .collect();
        for component in bindings.values_mut() {
            component.reset_sync();
        }
    }

    let mut updates = Vec::with_capacity(pending.len());
    for (key, calls) in pending {
        let Some(component) = bindings.resolve_mut(&key) else {
            continue;
        };
        let state = component.encode_state();
        let connector_type = if announced.insert(key.clone()) {
            Some(component.connector_type().to_string())
        } else {
            None
        };

        if state.is_none() && calls.is_empty() && connector_type.is_none() {
            continue;
        }
        updates.push(ConnectorUpdate {
            key,
            connector_type,
            state,
            calls,
        });
    }
    updates
}
