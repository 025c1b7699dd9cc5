//! Server-side session context.
//!
//! A `ServerSession` is everything one user session owns on the server:
//! the binding table, the dirty/RPC tracker, key allocation, cycle numbering
//! and the set of keys the client already knows. It is always used under
//! the session lock held by [`SessionManager`](crate::manager::SessionManager).

use std::collections::HashSet;

use tokio::sync::mpsc;
use trellis_core::{
    BoxError, ComponentKey, ConnectorHandle, KeyAllocator, KeyCollisionError, ServerConnector,
    SyncTracker,
};
use uuid::Uuid;

use crate::coordinator::{self, CycleOutcome, DispatchReport, ServerBindings};
use crate::error::ProtocolError;
use crate::protocol::{ClientMessage, SequenceCheck, ServerMessage};

/// Upper bound on deferred tasks run in one cycle; the rest wait for the next.
const MAX_TASKS_PER_CYCLE: usize = 1024;

type SessionTask = Box<dyn FnOnce(&mut ServerSession) -> Result<(), BoxError> + Send>;

/// Sender for work that needs the whole session, e.g. a listener on one
/// component updating another. Tasks run after the incoming calls of the
/// current cycle have been dispatched.
#[derive(Clone)]
pub struct SessionTasks {
    tx: mpsc::UnboundedSender<SessionTask>,
}

impl SessionTasks {
    /// Returns `false` if the session is gone.
    pub fn defer<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut ServerSession) -> Result<(), BoxError> + Send + 'static,
    {
        self.tx.send(Box::new(task)).is_ok()
    }
}

pub struct ServerSession {
    id: Uuid,
    tracker: SyncTracker,
    bindings: ServerBindings,
    keys: KeyAllocator,
    /// Keys whose connector type the client has received
    announced: HashSet<ComponentKey>,
    removed: Vec<ComponentKey>,
    resync: bool,
    incoming: SequenceCheck,
    outgoing_seq: u64,
    task_tx: mpsc::UnboundedSender<SessionTask>,
    task_rx: mpsc::UnboundedReceiver<SessionTask>,
}

impl ServerSession {
    pub fn new(id: Uuid) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        Self {
            id,
            tracker: SyncTracker::new(),
            bindings: ServerBindings::new(),
            keys: KeyAllocator::new(),
            announced: HashSet::new(),
            removed: Vec::new(),
            resync: false,
            incoming: SequenceCheck::new(),
            outgoing_seq: 0,
            task_tx,
            task_rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tracker(&self) -> &SyncTracker {
        &self.tracker
    }

    /// Bind `component` under a freshly allocated key.
    pub fn attach<C: ServerConnector>(&mut self, component: C) -> Result<ComponentKey, KeyCollisionError> {
        let key = self.keys.next_key();
        self.bind(key.clone(), component)?;
        Ok(key)
    }

    /// Bind `component` under `key`. The component is sent with the next cycle.
    pub fn bind<C: ServerConnector>(&mut self, key: ComponentKey, component: C) -> Result<(), KeyCollisionError> {
        if self.bindings.contains(&key) {
            return Err(KeyCollisionError { key });
        }
        let mut component: Box<dyn ServerConnector> = Box::new(component);
        self.tracker.register(&key);
        component.attach(ConnectorHandle::bound(key.clone(), self.tracker.clone()));
        self.bindings.bind(key.clone(), component)?;
        self.tracker.mark_dirty(&key);
        log::debug!("Session {} bound {key}", self.id);
        Ok(())
    }

    /// Release `key`. Pending work for it is discarded; if the client knew
    /// about the key, the next message tells it to drop its connector.
    pub fn unbind(&mut self, key: &ComponentKey) -> Option<Box<dyn ServerConnector>> {
        let mut component = self.bindings.unbind(key)?;
        let discarded = self.tracker.release(key);
        if discarded > 0 {
            log::trace!("Discarded {discarded} queued calls for {key}");
        }
        component.detach();
        if self.announced.remove(key) {
            self.removed.push(key.clone());
        }
        Some(component)
    }

    pub fn contains(&self, key: &ComponentKey) -> bool {
        self.bindings.contains(key)
    }

    /// Bound keys in bind order.
    pub fn keys(&self) -> &[ComponentKey] {
        self.bindings.keys()
    }

    pub fn component_count(&self) -> usize {
        self.bindings.len()
    }

    /// Typed access to a bound component.
    pub fn component<C: ServerConnector>(&self, key: &ComponentKey) -> Option<&C> {
        self.bindings.resolve(key)?.as_any().downcast_ref::<C>()
    }

    pub fn component_mut<C: ServerConnector>(&mut self, key: &ComponentKey) -> Option<&mut C> {
        self.bindings.resolve_mut(key)?.as_any_mut().downcast_mut::<C>()
    }

    pub fn tasks(&self) -> SessionTasks {
        SessionTasks {
            tx: self.task_tx.clone(),
        }
    }

    /// Make the next outgoing message a full resend.
    pub fn request_resync(&mut self) {
        self.resync = true;
    }

    pub fn has_pending_changes(&self) -> bool {
        self.resync || !self.removed.is_empty() || self.tracker.dirty_count() > 0
    }

    /// Incoming phase: verify numbering, dispatch every call in order, then
    /// run deferred tasks.
    ///
    /// A duplicate or out-of-order message is rejected before anything is
    /// dispatched. After an out-of-order message the numbering is re-aligned
    /// to it and a resync is scheduled, so the session can continue.
    pub fn handle_client_message(&mut self, message: &ClientMessage) -> Result<DispatchReport, ProtocolError> {
        if let Err(e) = self.incoming.check(message.seq) {
            if !e.is_duplicate() {
                log::warn!("Session {}: {e}; scheduling resync", self.id);
                self.incoming.accept(message.seq);
                self.request_resync();
            }
            return Err(e);
        }
        self.incoming.accept(message.seq);

        let mut report = coordinator::dispatch_calls(&mut self.bindings, &message.calls);
        report.task_failures = self.run_tasks();
        if !report.is_clean() {
            log::debug!(
                "Session {}: {} dispatch failures, {} task failures",
                self.id,
                report.failures.len(),
                report.task_failures.len()
            );
        }
        Ok(report)
    }

    /// Run deferred tasks until none are left (or the per-cycle cap is hit).
    pub fn run_tasks(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        for _ in 0..MAX_TASKS_PER_CYCLE {
            let Ok(task) = self.task_rx.try_recv() else {
                return failures;
            };
            if let Err(e) = task(self) {
                log::warn!("Session {} task failed: {e}", self.id);
                failures.push(e.to_string());
            }
        }
        log::warn!("Session {}: deferred task limit reached", self.id);
        failures
    }

    /// Outgoing phase: collect every dirty key into one message.
    pub fn end_cycle(&mut self) -> ServerMessage {
        let resync = std::mem::take(&mut self.resync);
        let updates =
            coordinator::collect_updates(&mut self.bindings, &self.tracker, &mut self.announced, resync);
        let removed = if resync {
            self.removed.clear();
            Vec::new()
        } else {
            std::mem::take(&mut self.removed)
        };

        self.outgoing_seq += 1;
        ServerMessage {
            seq: self.outgoing_seq,
            resync,
            updates,
            removed,
        }
    }

    /// Both phases for one client message.
    ///
    /// A duplicate is reported as an error with no response. Any other
    /// protocol error still yields the error; the caller answers with
    /// [`end_cycle`](Self::end_cycle), which will be a resync.
    pub fn run_cycle(&mut self, message: &ClientMessage) -> Result<CycleOutcome, ProtocolError> {
        let report = self.handle_client_message(message)?;
        Ok(CycleOutcome {
            report,
            response: self.end_cycle(),
        })
    }

    /// Full-state message for a (re)connecting client.
    pub fn initial_message(&mut self) -> ServerMessage {
        self.request_resync();
        self.end_cycle()
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("components", &self.bindings.len())
            .field("outgoing_seq", &self.outgoing_seq)
            .field("resync", &self.resync)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KeyedCall;
    use std::sync::{Arc, Mutex};
    use trellis_core::widgets::{CheckBox, CheckBoxServerRpc, Label, LabelState, TreeGrid};
    use trellis_core::{Component, Listener, RpcInterface, StateValue, ValueChangeEvent};

    fn session() -> ServerSession {
        ServerSession::new(Uuid::new_v4())
    }

    fn client_message(seq: u64, calls: Vec<(ComponentKey, trellis_core::RpcCall)>) -> ClientMessage {
        ClientMessage {
            seq,
            calls: calls
                .into_iter()
                .map(|(key, call)| KeyedCall { key, call })
                .collect(),
        }
    }

    #[test]
    fn test_new_component_sent_with_type_and_full_state() {
        let mut session = session();
        let key = session.attach(Label::label("Hello")).unwrap();

        let message = session.end_cycle();
        assert_eq!(message.seq, 1);
        let update = message.update(&key).unwrap();
        assert_eq!(update.connector_type.as_deref(), Some("LabelState"));
        assert!(update.state.as_ref().unwrap().full);

        assert!(session.end_cycle().is_empty());
    }

    #[test]
    fn test_two_field_changes_one_diff() {
        let mut session = session();
        let key = session.attach(Label::label("x")).unwrap();
        session.end_cycle();

        let label = session.component_mut::<Label>(&key).unwrap();
        label.state_mut().visible = false;
        label.state_mut().caption = Some("Hi".into());

        let message = session.end_cycle();
        assert_eq!(message.updates.len(), 1);
        let diff = message.updates[0].state.as_ref().unwrap();
        assert!(!diff.full);
        assert_eq!(diff.fields.len(), 2);
        assert_eq!(diff.fields["visible"], StateValue::Bool(false));
        assert!(message.updates[0].connector_type.is_none());
    }

    #[test]
    fn test_clean_component_has_no_entry() {
        let mut session = session();
        let a = session.attach(Label::label("a")).unwrap();
        let b = session.attach(Label::label("b")).unwrap();
        session.end_cycle();

        session.component_mut::<Label>(&b).unwrap().set_text("B");
        let message = session.end_cycle();
        assert!(message.update(&a).is_none());
        assert!(message.update(&b).is_some());
    }

    #[test]
    fn test_client_rpc_order_preserved() {
        let mut session = session();
        let key = session.attach(TreeGrid::tree_grid(vec!["Name".into()])).unwrap();
        session.end_cycle();

        let grid = session.component::<TreeGrid>(&key).unwrap();
        grid.expand("1");
        grid.expand("2");
        grid.collapse("1");

        let message = session.end_cycle();
        let methods: Vec<_> = message.updates[0]
            .calls
            .iter()
            .map(|c| (c.method.as_str(), c.args[0].clone()))
            .collect();
        assert_eq!(
            methods,
            vec![
                ("SetExpanded", StateValue::Str("1".into())),
                ("SetExpanded", StateValue::Str("2".into())),
                ("SetCollapsed", StateValue::Str("1".into())),
            ]
        );
        assert!(message.updates[0].state.is_none());
    }

    #[test]
    fn test_unbind_drops_pending_work_and_announces_removal() {
        let mut session = session();
        let key = session.attach(TreeGrid::tree_grid(Vec::new())).unwrap();
        session.end_cycle();

        session.component::<TreeGrid>(&key).unwrap().expand("x");
        let mut grid = session.unbind(&key).unwrap();
        assert!(grid.handle().key().is_none());
        assert!(grid.dispatch_rpc(&trellis_core::RpcCall::new("X", "Y", Vec::new())).is_err());

        let message = session.end_cycle();
        assert!(message.updates.is_empty());
        assert_eq!(message.removed, vec![key]);
    }

    #[test]
    fn test_unbind_before_first_sync_sends_nothing() {
        let mut session = session();
        let key = session.attach(Label::label("short-lived")).unwrap();
        session.unbind(&key);
        assert!(!session.has_pending_changes());
        assert!(session.end_cycle().is_empty());
    }

    #[test]
    fn test_bind_collision() {
        let mut session = session();
        session.bind("k".into(), Label::label("a")).unwrap();
        let err = session.bind("k".into(), Label::label("b")).unwrap_err();
        assert_eq!(err.key, ComponentKey::from("k"));
    }

    #[test]
    fn test_dispatch_isolates_failures_and_drops_unbound() {
        let mut session = session();
        let key = session.attach(CheckBox::check_box("c")).unwrap();
        session.end_cycle();

        let good = CheckBoxServerRpc::Clicked { checked: true }.into_call();
        let bad = trellis_core::RpcCall::new("CheckBoxServerRpc", "Clicked", vec![StateValue::Int(1)]);
        let message = client_message(
            1,
            vec![
                (key.clone(), bad),
                ("ghost".into(), good.clone()),
                (key.clone(), good),
            ],
        );

        let outcome = session.run_cycle(&message).unwrap();
        assert_eq!(outcome.report.dispatched, 1);
        assert_eq!(outcome.report.dropped, 1);
        assert_eq!(outcome.report.failures.len(), 1);
        assert!(*session.component::<CheckBox>(&key).unwrap().value());
        // client-originated value is not echoed
        assert!(outcome.response.is_empty());
    }

    #[test]
    fn test_sequence_rules() {
        let mut session = session();
        session.attach(Label::label("a")).unwrap();
        session.initial_message();

        assert!(session.run_cycle(&client_message(1, Vec::new())).is_ok());
        let dup = session.run_cycle(&client_message(1, Vec::new())).unwrap_err();
        assert!(dup.is_duplicate());
        assert!(!session.has_pending_changes());

        let gap = session.run_cycle(&client_message(5, Vec::new())).unwrap_err();
        assert!(matches!(gap, ProtocolError::OutOfOrder { expected: 2, received: 5 }));
        let resync = session.end_cycle();
        assert!(resync.resync);
        assert_eq!(resync.updates.len(), 1);

        assert!(session.run_cycle(&client_message(6, Vec::new())).is_ok());
    }

    #[test]
    fn test_resync_resends_everything_in_bind_order() {
        let mut session = session();
        let a = session.attach(Label::label("a")).unwrap();
        let b = session.attach(CheckBox::check_box("b")).unwrap();
        session.end_cycle();

        session.request_resync();
        let message = session.end_cycle();
        assert!(message.resync);
        let keys: Vec<_> = message.updates.iter().map(|u| u.key.clone()).collect();
        assert_eq!(keys, vec![a, b]);
        for update in &message.updates {
            assert!(update.connector_type.is_some());
            assert!(update.state.as_ref().unwrap().full);
        }
    }

    #[test]
    fn test_deferred_task_updates_other_component() {
        let mut session = session();
        let check = session.attach(CheckBox::check_box("Show")).unwrap();
        let label = session.attach(Label::label("hidden")).unwrap();
        session.end_cycle();

        let tasks = session.tasks();
        let target = label.clone();
        session
            .component::<CheckBox>(&check)
            .unwrap()
            .add_value_change_listener(Listener::new(move |e: &ValueChangeEvent<bool>| {
                let checked = e.new_value;
                let target = target.clone();
                tasks.defer(move |session| {
                    if let Some(label) = session.component_mut::<Label>(&target) {
                        label.set_text(if checked { "shown" } else { "hidden" });
                    }
                    Ok(())
                });
                Ok(())
            }))
            .unwrap();

        let call = CheckBoxServerRpc::Clicked { checked: true }.into_call();
        let outcome = session.run_cycle(&client_message(1, vec![(check.clone(), call)])).unwrap();

        assert!(outcome.report.is_clean());
        assert!(outcome.response.update(&check).is_none());
        let update = outcome.response.update(&label).unwrap();
        assert_eq!(
            update.state.as_ref().unwrap().fields["text"],
            StateValue::Str("shown".into())
        );
    }

    #[test]
    fn test_failing_task_reported() {
        let mut session = session();
        session.tasks().defer(|_| Err("nope".into()));
        let report = session.handle_client_message(&client_message(1, Vec::new())).unwrap();
        assert_eq!(report.task_failures, vec!["nope".to_string()]);
    }

    #[test]
    fn test_typed_access_checks_type() {
        let mut session = session();
        let key = session.attach(Label::label("a")).unwrap();
        assert!(session.component::<Component<LabelState>>(&key).is_some());
        assert!(session.component::<CheckBox>(&key).is_none());
    }

    #[test]
    fn test_value_listener_sees_user_origin() {
        let mut session = session();
        let key = session.attach(CheckBox::check_box("c")).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session
            .component::<CheckBox>(&key)
            .unwrap()
            .add_value_change_listener(Listener::new(move |e: &ValueChangeEvent<bool>| {
                sink.lock().unwrap().push(e.user_originated);
                Ok(())
            }))
            .unwrap();

        let call = CheckBoxServerRpc::Clicked { checked: true }.into_call();
        session.run_cycle(&client_message(1, vec![(key.clone(), call)])).unwrap();
        session.component_mut::<CheckBox>(&key).unwrap().set_value(false).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }
}
