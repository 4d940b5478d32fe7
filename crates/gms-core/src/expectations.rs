//! Pending expectations: which handler consumes the next message of a kind.

use std::collections::HashMap;
use std::hash::Hash;

/// How long a registration lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Consumed by the first matching message.
    Once,
    /// Stays until cancelled or cleared.
    Persistent,
}

#[derive(Debug)]
pub struct ExpectationTable<K, H> {
    entries: HashMap<K, (H, Expectation)>,
}

impl<K, H> Default for ExpectationTable<K, H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, H: Clone> ExpectationTable<K, H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for the next message of `kind`, replacing any
    /// earlier registration for that kind.
    pub fn expect(&mut self, kind: K, handler: H, lifetime: Expectation) {
        self.entries.insert(kind, (handler, lifetime));
    }

    /// The handler for a received message of `kind`, if any. One-shot
    /// registrations are removed by this call.
    pub fn take(&mut self, kind: &K) -> Option<H> {
        match self.entries.get(kind)? {
            (handler, Expectation::Persistent) => Some(handler.clone()),
            (_, Expectation::Once) => self.entries.remove(kind).map(|(handler, _)| handler),
        }
    }

    pub fn cancel(&mut self, kind: &K) -> bool {
        self.entries.remove(kind).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_expecting(&self, kind: &K) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
