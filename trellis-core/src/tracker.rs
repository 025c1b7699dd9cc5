//! Per-session dirty set and outgoing RPC queues.
//!
//! ```text
//!  Component::state_mut() ──► ConnectorHandle::mark_dirty() ──┐
//!  RpcProxy::call()       ──► ConnectorHandle::enqueue_rpc() ─┤
//!                                                             ▼
//!                                   SyncTracker { live, dirty, queues }
//!                                                             │
//!                       coordinator, once per cycle:  drain_cycle()
//! ```
//!
//! The tracker only accepts work for keys registered as live. Releasing a
//! key discards its queued calls and dirty flag, so anything still holding a
//! handle or proxy for it becomes a silent no-op.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::key::ComponentKey;
use crate::rpc::RpcCall;

#[derive(Debug, Default)]
struct TrackerInner {
    live: HashSet<ComponentKey>,
    /// Dirty keys in the order they first became dirty this cycle
    dirty: Vec<ComponentKey>,
    dirty_lookup: HashSet<ComponentKey>,
    /// Per-key FIFO queues, each call stamped with a session-wide sequence
    queues: HashMap<ComponentKey, Vec<(u64, RpcCall)>>,
    next_call: u64,
    dropped: u64,
}

impl TrackerInner {
    fn mark(&mut self, key: &ComponentKey) {
        if self.dirty_lookup.insert(key.clone()) {
            self.dirty.push(key.clone());
        }
    }

    fn take_dirty(&mut self) -> Vec<ComponentKey> {
        self.dirty_lookup.clear();
        std::mem::take(&mut self.dirty)
    }
}

/// Shared handle to one peer's dirty set and RPC queues for one session.
#[derive(Debug, Clone, Default)]
pub struct SyncTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start accepting work for `key`.
    pub fn register(&self, key: &ComponentKey) {
        self.lock().live.insert(key.clone());
    }

    /// Stop accepting work for `key` and discard anything pending for it.
    ///
    /// Returns the number of queued calls that were discarded.
    pub fn release(&self, key: &ComponentKey) -> usize {
        let mut inner = self.lock();
        inner.live.remove(key);
        if inner.dirty_lookup.remove(key) {
            inner.dirty.retain(|k| k != key);
        }
        inner.queues.remove(key).map_or(0, |q| q.len())
    }

    pub fn is_live(&self, key: &ComponentKey) -> bool {
        self.lock().live.contains(key)
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Add `key` to the dirty set. Returns `false` (and drops) if unbound.
    pub fn mark_dirty(&self, key: &ComponentKey) -> bool {
        let mut inner = self.lock();
        if !inner.live.contains(key) {
            inner.dropped += 1;
            log::trace!("Dropping dirty mark for unbound key {key}");
            return false;
        }
        inner.mark(key);
        true
    }

    /// Queue `call` for `key` and mark it dirty. Returns `false` if dropped.
    pub fn enqueue_rpc(&self, key: &ComponentKey, call: RpcCall) -> bool {
        let mut inner = self.lock();
        if !inner.live.contains(key) {
            inner.dropped += 1;
            log::trace!(
                "Dropping {}.{} for unbound key {key}",
                call.interface,
                call.method
            );
            return false;
        }
        let seq = inner.next_call;
        inner.next_call += 1;
        inner.queues.entry(key.clone()).or_default().push((seq, call));
        inner.mark(key);
        true
    }

    pub fn is_dirty(&self, key: &ComponentKey) -> bool {
        self.lock().dirty_lookup.contains(key)
    }

    pub fn dirty_count(&self) -> usize {
        self.lock().dirty.len()
    }

    pub fn pending_rpc_count(&self, key: &ComponentKey) -> usize {
        self.lock().queues.get(key).map_or(0, Vec::len)
    }

    /// Work dropped because it targeted an unbound key.
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    /// Snapshot and clear the dirty set, leaving RPC queues in place.
    pub fn get_and_clear_dirty(&self) -> Vec<ComponentKey> {
        self.lock().take_dirty()
    }

    /// Remove and return the queued calls for `key`.
    pub fn take_rpc_queue(&self, key: &ComponentKey) -> Vec<RpcCall> {
        self.lock()
            .queues
            .remove(key)
            .map(|q| q.into_iter().map(|(_, call)| call).collect())
            .unwrap_or_default()
    }

    /// Atomically take every dirty key with its queued calls, in the order the
    /// keys first became dirty. Per-key call order is enqueue order.
    pub fn drain_cycle(&self) -> Vec<(ComponentKey, Vec<RpcCall>)> {
        let mut inner = self.lock();
        let dirty = inner.take_dirty();
        dirty
            .into_iter()
            .map(|key| {
                let calls = inner
                    .queues
                    .remove(&key)
                    .map(|q| q.into_iter().map(|(_, call)| call).collect())
                    .unwrap_or_default();
                (key, calls)
            })
            .collect()
    }

    /// Atomically take every queued call across all keys in global enqueue
    /// order and clear the dirty set.
    pub fn drain_calls_in_order(&self) -> Vec<(ComponentKey, RpcCall)> {
        let mut inner = self.lock();
        inner.take_dirty();
        let mut calls: Vec<(u64, ComponentKey, RpcCall)> = inner
            .queues
            .drain()
            .flat_map(|(key, queue)| {
                queue
                    .into_iter()
                    .map(move |(seq, call)| (seq, key.clone(), call))
            })
            .collect();
        calls.sort_by_key(|(seq, _, _)| *seq);
        calls.into_iter().map(|(_, key, call)| (key, call)).collect()
    }

    /// Release every key.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.live.clear();
        inner.dirty.clear();
        inner.dirty_lookup.clear();
        inner.queues.clear();
    }
}

/// A component's or connector's link to its session tracker.
#[derive(Debug, Clone, Default)]
pub struct ConnectorHandle {
    binding: Option<(ComponentKey, SyncTracker)>,
}

impl ConnectorHandle {
    /// A handle that drops everything (instance not bound yet).
    pub fn detached() -> Self {
        Self { binding: None }
    }

    pub fn bound(key: ComponentKey, tracker: SyncTracker) -> Self {
        Self {
            binding: Some((key, tracker)),
        }
    }

    pub fn key(&self) -> Option<&ComponentKey> {
        self.binding.as_ref().map(|(key, _)| key)
    }

    /// Bound and the key is still live.
    pub fn is_attached(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|(key, tracker)| tracker.is_live(key))
    }

    pub fn mark_dirty(&self) -> bool {
        match &self.binding {
            Some((key, tracker)) => tracker.mark_dirty(key),
            None => false,
        }
    }

    pub fn enqueue_rpc(&self, call: RpcCall) -> bool {
        match &self.binding {
            Some((key, tracker)) => tracker.enqueue_rpc(key, call),
            None => {
                log::trace!("Dropping {}.{} on detached handle", call.interface, call.method);
                false
            }
        }
    }
}
