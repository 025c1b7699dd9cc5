//! Communication keys.
//!
//! A key is the only cross-peer identity a component has: the server binds a
//! `Component` to it, the client binds the matching `Connector` to the same
//! string. Keys are never reused within a session.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier pairing one server component with one client connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKey(String);

impl ComponentKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ComponentKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Monotonic key source for one session.
#[derive(Debug, Default)]
pub struct KeyAllocator {
    next: u64,
}

impl KeyAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next key (`c0`, `c1`, ...).
    pub fn next_key(&mut self) -> ComponentKey {
        let key = ComponentKey(format!("c{}", self.next));
        self.next += 1;
        key
    }

    /// Number of keys handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next
    }
}
