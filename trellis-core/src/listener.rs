//! Listener registry with snapshot-at-fire semantics.
//!
//! The registration list is copy-on-write: every add/remove publishes a new
//! `Arc<Vec<_>>`, and a fire pass iterates the list it captured when it
//! started. Consequences:
//!
//! - a listener added during a pass is not in the snapshot, so it first runs
//!   on the next pass;
//! - a listener removed during a pass flips its `active` flag, which the pass
//!   checks right before invoking, so it never runs again.
//!
//! Listener identity is the `Arc` behind a [`Listener`]: adding a clone of an
//! already registered listener for the same event type is rejected.
//!
//! ```text
//! Active ──remove()──► Removed      (permanent; re-add for a new handle)
//! ```

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{BoxError, DuplicateListenerError, FireError, ListenerFailure};

/// Identifier of one registration, unique within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// A callback for events of type `E`. Clones share identity.
pub struct Listener<E> {
    callback: Arc<dyn Fn(&E) -> Result<(), BoxError> + Send + Sync>,
}

impl<E: 'static> Listener<E> {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&E) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Same underlying callback instance.
    pub fn same_as(&self, other: &Listener<E>) -> bool {
        Arc::ptr_eq(&self.callback, &other.callback)
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.callback) as *const () as usize
    }

    fn invoke(&self, event: &E) -> Result<(), BoxError> {
        (self.callback)(event)
    }
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<E> fmt::Debug for Listener<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("event", &type_name::<E>())
            .finish()
    }
}

/// Returned by `add_listener`; pass it back to remove the registration.
#[derive(Debug, Clone)]
pub struct RegistrationHandle {
    id: ListenerId,
    registration: Arc<Registration>,
}

impl RegistrationHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.registration.active.load(Ordering::Acquire)
    }
}

struct Registration {
    id: ListenerId,
    event_type: TypeId,
    identity: usize,
    active: AtomicBool,
    /// Holds a `Listener<E>` for the registered `E`
    callback: Box<dyn Any + Send + Sync>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: Arc<Vec<Arc<Registration>>>,
    next_id: u64,
    version: u64,
}

/// Per-instance collection of listeners. Cheap to clone; clones share the
/// same registrations, so a callback may capture one and remove itself.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Registration>>> {
        Arc::clone(&self.lock().entries)
    }

    /// Register `listener` for events of type `E`.
    pub fn add_listener<E: 'static>(
        &self,
        listener: Listener<E>,
    ) -> Result<RegistrationHandle, DuplicateListenerError> {
        let event_type = TypeId::of::<E>();
        let identity = listener.identity();
        let mut inner = self.lock();

        if inner
            .entries
            .iter()
            .any(|r| r.event_type == event_type && r.identity == identity)
        {
            return Err(DuplicateListenerError {
                event_type: type_name::<E>(),
            });
        }

        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        let registration = Arc::new(Registration {
            id,
            event_type,
            identity,
            active: AtomicBool::new(true),
            callback: Box::new(listener),
        });

        let mut entries = Vec::with_capacity(inner.entries.len() + 1);
        entries.extend(inner.entries.iter().cloned());
        entries.push(Arc::clone(&registration));
        inner.entries = Arc::new(entries);
        inner.version += 1;

        Ok(RegistrationHandle { id, registration })
    }

    /// Unregister. Removing an already removed handle, or a handle issued by
    /// another registry, is a no-op (`false`).
    pub fn remove_listener(&self, handle: &RegistrationHandle) -> bool {
        let mut inner = self.lock();
        if !inner
            .entries
            .iter()
            .any(|r| Arc::ptr_eq(r, &handle.registration))
        {
            return false;
        }
        if !handle.registration.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let entries: Vec<_> = inner
            .entries
            .iter()
            .filter(|r| !Arc::ptr_eq(r, &handle.registration))
            .cloned()
            .collect();
        inner.entries = Arc::new(entries);
        inner.version += 1;
        true
    }

    /// Invoke every active listener for `E` in registration order.
    ///
    /// All listeners in the snapshot run even if some fail; failures (errors
    /// or panics) are collected into one [`FireError`]. Returns the number of
    /// listeners invoked.
    pub fn fire_event<E: 'static>(&self, event: &E) -> Result<usize, FireError> {
        let event_type = TypeId::of::<E>();
        let snapshot = self.snapshot();
        let mut invoked = 0;
        let mut failures = Vec::new();

        for registration in snapshot.iter().filter(|r| r.event_type == event_type) {
            if !registration.active.load(Ordering::Acquire) {
                continue;
            }
            let Some(listener) = registration.callback.downcast_ref::<Listener<E>>() else {
                continue;
            };
            invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| listener.invoke(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(ListenerFailure {
                    listener: registration.id,
                    message: e.to_string(),
                }),
                Err(panic) => failures.push(ListenerFailure {
                    listener: registration.id,
                    message: panic_message(panic.as_ref()),
                }),
            }
        }

        if failures.is_empty() {
            Ok(invoked)
        } else {
            log::debug!(
                "{} of {invoked} listeners failed for {}",
                failures.len(),
                type_name::<E>()
            );
            Err(FireError {
                event_type: type_name::<E>(),
                failures,
            })
        }
    }

    /// Active listeners for `E`, in registration order.
    pub fn listeners<E: 'static>(&self) -> Vec<Listener<E>> {
        let event_type = TypeId::of::<E>();
        self.snapshot()
            .iter()
            .filter(|r| r.event_type == event_type)
            .filter_map(|r| r.callback.downcast_ref::<Listener<E>>().cloned())
            .collect()
    }

    pub fn listener_count<E: 'static>(&self) -> usize {
        let event_type = TypeId::of::<E>();
        self.snapshot()
            .iter()
            .filter(|r| r.event_type == event_type)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Incremented on every successful add or remove.
    pub fn version(&self) -> u64 {
        self.lock().version
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("registrations", &self.snapshot().len())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_string()
    }
}
