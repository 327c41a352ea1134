use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use super::BoxedValue;

/// Per-invocation key/value bag carried by a [`PipelineContext`](super::PipelineContext).
///
/// Pipeline steps use it to hand data to later steps and to the terminal
/// handler of the same dispatch. The bag is cleared when the context goes
/// back to its pool, so nothing leaks into the next dispatch.
#[derive(Default)]
pub struct ContextItems {
    items: HashMap<String, BoxedValue>,
}

impl ContextItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.items.insert(key.into(), Box::new(value));
    }

    /// Returns the value under `key` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.items.get(key)?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self, key: &str) -> Option<&mut T> {
        self.items.get_mut(key)?.downcast_mut::<T>()
    }

    /// Removes and returns the value under `key`.
    ///
    /// A value of a different type is left in place.
    pub fn remove<T: Any + Send + Sync>(&mut self, key: &str) -> Option<T> {
        if !self.items.get(key)?.is::<T>() {
            return None;
        }
        let value = self.items.remove(key)?;
        value.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl fmt::Debug for ContextItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("ContextItems").field("keys", &keys).finish()
    }
}
