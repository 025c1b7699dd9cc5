//! Key → instance tables.
//!
//! Each peer keeps one table per session: the server maps keys to
//! components, the client maps the same keys to connectors. A key is bound
//! at most once at any time.

use std::collections::HashMap;

use crate::error::KeyCollisionError;
use crate::key::ComponentKey;

#[derive(Debug)]
pub struct Bindings<T> {
    entries: HashMap<ComponentKey, T>,
    /// Bind order, used for deterministic full resends
    order: Vec<ComponentKey>,
}

impl<T> Bindings<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Bind `instance` to `key`. Fails if `key` is already bound.
    pub fn bind(&mut self, key: ComponentKey, instance: T) -> Result<(), KeyCollisionError> {
        if self.entries.contains_key(&key) {
            return Err(KeyCollisionError { key });
        }
        self.order.push(key.clone());
        self.entries.insert(key, instance);
        Ok(())
    }

    /// `None` means the key is not bound on this peer.
    pub fn resolve(&self, key: &ComponentKey) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn resolve_mut(&mut self, key: &ComponentKey) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    /// Release `key`, returning the instance that was bound to it.
    pub fn unbind(&mut self, key: &ComponentKey) -> Option<T> {
        let instance = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(instance)
    }

    pub fn contains(&self, key: &ComponentKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bound keys in bind order.
    pub fn keys(&self) -> &[ComponentKey] {
        &self.order
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    /// Unbind everything, returning instances in bind order.
    pub fn drain(&mut self) -> Vec<(ComponentKey, T)> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|instance| (key, instance)))
            .collect()
    }
}

impl<T> Default for Bindings<T> {
    fn default() -> Self {
        Self::new()
    }
}
