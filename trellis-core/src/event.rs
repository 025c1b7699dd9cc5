//! Event types fired through [`ListenerRegistry`](crate::listener::ListenerRegistry).

use crate::key::ComponentKey;

/// A field's value changed. Never fired for a write of an equal value.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChangeEvent<V> {
    /// `None` while the component is not bound to a session
    pub source: Option<ComponentKey>,
    pub old_value: V,
    pub new_value: V,
    /// Change arrived from the client through a ServerRpc call
    pub user_originated: bool,
}

/// A field's read-only flag flipped.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOnlyStatusChangeEvent {
    pub source: Option<ComponentKey>,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FocusEvent {
    pub source: Option<ComponentKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlurEvent {
    pub source: Option<ComponentKey>,
}

/// Client side: a connector's mirrored state changed after applying a diff.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangeEvent {
    pub key: Option<ComponentKey>,
    /// Fields whose value actually changed, in name order
    pub changed_fields: Vec<String>,
    /// The diff was a full state (first sync or resync)
    pub full: bool,
}

impl StateChangeEvent {
    pub fn has_changed(&self, field: &str) -> bool {
        self.changed_fields.iter().any(|f| f == field)
    }
}

/// Client side: the server expanded or collapsed a tree grid item.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeGridExpansionEvent {
    pub source: Option<ComponentKey>,
    pub item_key: String,
    pub expanded: bool,
}
