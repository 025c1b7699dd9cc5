//! Property tests for the listener registry and field diffing.
//!
//! 1. Active listeners are exactly the added-and-not-removed ones, in
//!    registration order, for any interleaving of add/remove.
//! 2. A fire pass invokes each active listener exactly once, in order.
//! 3. `version()` moves only on successful add/remove.
//! 4. Listeners that add or remove listeners (themselves included) while a
//!    pass is running: removed ones never run again in that pass, added ones
//!    first run on the next pass.
//! 5. Applying `diff_fields(a, b)` to `a` yields `b`.

use std::sync::{Arc, Mutex, Weak};

use proptest::prelude::*;
use trellis_core::{diff_fields, Listener, ListenerRegistry, RegistrationHandle, SharedState};

#[derive(Debug)]
struct Ping;

#[derive(Debug, Clone)]
enum Op {
    Add,
    /// Remove the n-th handle ever returned (modulo count)
    Remove(usize),
    Fire,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            3 => Just(Op::Add),
            2 => any::<usize>().prop_map(Op::Remove),
            1 => Just(Op::Fire),
        ],
        0..60,
    )
}

proptest! {
    #[test]
    fn active_set_matches_model(ops in ops()) {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut handles: Vec<(usize, RegistrationHandle)> = Vec::new();
        let mut model: Vec<usize> = Vec::new();
        let mut next_tag = 0usize;

        for op in ops {
            match op {
                Op::Add => {
                    let tag = next_tag;
                    next_tag += 1;
                    let sink = Arc::clone(&calls);
                    let handle = registry
                        .add_listener(Listener::new(move |_: &Ping| {
                            sink.lock().unwrap().push(tag);
                            Ok(())
                        }))
                        .unwrap();
                    handles.push((tag, handle));
                    model.push(tag);
                }
                Op::Remove(n) if !handles.is_empty() => {
                    let (tag, handle) = &handles[n % handles.len()];
                    let was_active = model.contains(tag);
                    prop_assert_eq!(registry.remove_listener(handle), was_active);
                    prop_assert!(!handle.is_active());
                    model.retain(|t| t != tag);
                }
                Op::Remove(_) => {}
                Op::Fire => {
                    calls.lock().unwrap().clear();
                    let invoked = registry.fire_event(&Ping).unwrap();
                    prop_assert_eq!(invoked, model.len());
                    prop_assert_eq!(&*calls.lock().unwrap(), &model);
                }
            }
            prop_assert_eq!(registry.listener_count::<Ping>(), model.len());
            prop_assert_eq!(registry.listeners::<Ping>().len(), model.len());
        }
    }

    #[test]
    fn version_counts_successful_mutations(ops in ops()) {
        let registry = ListenerRegistry::new();
        let mut handles = Vec::new();
        let mut expected = 0u64;

        for op in ops {
            match op {
                Op::Add => {
                    handles.push(registry.add_listener(Listener::new(|_: &Ping| Ok(()))).unwrap());
                    expected += 1;
                }
                Op::Remove(n) if !handles.is_empty() => {
                    if registry.remove_listener(&handles[n % handles.len()]) {
                        expected += 1;
                    }
                }
                Op::Remove(_) | Op::Fire => {
                    let _ = registry.fire_event(&Ping);
                }
            }
            prop_assert_eq!(registry.version(), expected);
        }
    }

    #[test]
    fn duplicate_rejected_only_while_active(readds in 1usize..5) {
        let registry = ListenerRegistry::new();
        let listener = Listener::new(|_: &Ping| Ok(()));

        for _ in 0..readds {
            let handle = registry.add_listener(listener.clone()).unwrap();
            prop_assert!(registry.add_listener(listener.clone()).is_err());
            prop_assert!(registry.remove_listener(&handle));
        }
        prop_assert!(registry.is_empty());
    }
}

/// What a listener does to the registry each time it runs.
#[derive(Debug, Clone, Copy)]
enum InPass {
    Nothing,
    RemoveSelf,
    /// Remove the listener with tag n (modulo tags created so far)
    RemoveTag(usize),
    AddOne,
}

#[derive(Debug, Clone)]
enum PassOp {
    Add(InPass),
    Remove(usize),
    Fire,
}

fn pass_ops() -> impl Strategy<Value = Vec<PassOp>> {
    let in_pass = prop_oneof![
        3 => Just(InPass::Nothing),
        1 => Just(InPass::RemoveSelf),
        1 => any::<usize>().prop_map(InPass::RemoveTag),
        1 => Just(InPass::AddOne),
    ];
    proptest::collection::vec(
        prop_oneof![
            3 => in_pass.prop_map(PassOp::Add),
            1 => any::<usize>().prop_map(PassOp::Remove),
            2 => Just(PassOp::Fire),
        ],
        0..40,
    )
}

/// Registry plus per-tag bookkeeping shared with the callbacks.
struct Harness {
    registry: ListenerRegistry,
    actions: Mutex<Vec<InPass>>,
    handles: Mutex<Vec<RegistrationHandle>>,
    calls: Mutex<Vec<usize>>,
}

impl Harness {
    /// Register a new listener and return its tag.
    fn add(self: &Arc<Self>, action: InPass) -> usize {
        let tag = {
            let mut actions = self.actions.lock().unwrap();
            actions.push(action);
            actions.len() - 1
        };
        let handle = self
            .registry
            .add_listener(tagged_listener(Arc::downgrade(self), tag))
            .unwrap();
        self.handles.lock().unwrap().push(handle);
        tag
    }

    fn remove(&self, tag: usize) -> bool {
        let handle = self.handles.lock().unwrap()[tag].clone();
        self.registry.remove_listener(&handle)
    }
}

fn tagged_listener(harness: Weak<Harness>, tag: usize) -> Listener<Ping> {
    Listener::new(move |_: &Ping| {
        let Some(harness) = harness.upgrade() else {
            return Ok(());
        };
        harness.calls.lock().unwrap().push(tag);
        let action = harness.actions.lock().unwrap()[tag];
        match action {
            InPass::Nothing => {}
            InPass::RemoveSelf => {
                harness.remove(tag);
            }
            InPass::RemoveTag(n) => {
                let count = harness.handles.lock().unwrap().len();
                harness.remove(n % count);
            }
            InPass::AddOne => {
                harness.add(InPass::Nothing);
            }
        }
        Ok(())
    })
}

/// Reference model: per-tag action and active flag, tags in registration order.
#[derive(Default)]
struct PassModel {
    actions: Vec<InPass>,
    active: Vec<bool>,
}

impl PassModel {
    fn add(&mut self, action: InPass) {
        self.actions.push(action);
        self.active.push(true);
    }

    fn fire(&mut self) -> Vec<usize> {
        let snapshot: Vec<usize> = (0..self.active.len()).filter(|&t| self.active[t]).collect();
        let mut invoked = Vec::new();
        for tag in snapshot {
            if !self.active[tag] {
                continue;
            }
            invoked.push(tag);
            match self.actions[tag] {
                InPass::Nothing => {}
                InPass::RemoveSelf => self.active[tag] = false,
                InPass::RemoveTag(n) => {
                    let target = n % self.active.len();
                    self.active[target] = false;
                }
                InPass::AddOne => self.add(InPass::Nothing),
            }
        }
        invoked
    }

    fn active_count(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }
}

proptest! {
    #[test]
    fn mutations_during_fire_match_model(ops in pass_ops()) {
        let harness = Arc::new(Harness {
            registry: ListenerRegistry::new(),
            actions: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        });
        let mut model = PassModel::default();

        for op in ops {
            match op {
                PassOp::Add(action) => {
                    harness.add(action);
                    model.add(action);
                }
                PassOp::Remove(n) if !model.active.is_empty() => {
                    let tag = n % model.active.len();
                    prop_assert_eq!(harness.remove(tag), model.active[tag]);
                    model.active[tag] = false;
                }
                PassOp::Remove(_) => {}
                PassOp::Fire => {
                    harness.calls.lock().unwrap().clear();
                    let expected = model.fire();
                    let invoked = harness.registry.fire_event(&Ping).unwrap();
                    prop_assert_eq!(invoked, expected.len());
                    prop_assert_eq!(&*harness.calls.lock().unwrap(), &expected);
                }
            }
            prop_assert_eq!(harness.registry.listener_count::<Ping>(), model.active_count());
        }
    }
}

trellis_core::shared_state! {
    struct FormState {
        title: Option<String> = None,
        count: i64 = 0,
        enabled: bool = true,
        tags: Vec<String> = Vec::new(),
    }
}

fn form_state() -> impl Strategy<Value = FormState> {
    (
        proptest::option::of("[a-z]{0,8}"),
        any::<i64>(),
        any::<bool>(),
        proptest::collection::vec("[a-z]{1,4}", 0..4),
    )
        .prop_map(|(title, count, enabled, tags)| FormState {
            title,
            count,
            enabled,
            tags,
        })
}

proptest! {
    #[test]
    fn diff_applied_to_previous_yields_current(before in form_state(), after in form_state()) {
        let diff = diff_fields(&before.to_fields(), &after.to_fields());
        let mut patched = before.clone();
        patched.apply_fields(&diff).unwrap();
        prop_assert_eq!(&patched, &after);

        let before_fields = before.to_fields();
        let after_fields = after.to_fields();
        for name in diff.keys() {
            prop_assert_ne!(before_fields.get(name), after_fields.get(name));
        }
    }
}
