//! Concurrent name -> token map (spec §4.5, component C5).
//!
//! The registry is the ledger [`crate::server::TokenServer`] publishes into
//! and every `fetch` call reads from first. Readers never block writers;
//! writers never block readers - each entry's cached token lives behind a
//! `std::sync::RwLock` that is held only for the instant of a clone, never
//! across an `.await`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::token::{now_epoch, Token};

/// One entry's mutable cell: the latest published token, if any.
#[derive(Debug, Default)]
struct Slot(RwLock<Option<Token>>);

impl Slot {
    fn publish(&self, token: Token) {
        *self.0.write().expect("registry slot lock poisoned") = Some(token);
    }

    fn snapshot(&self) -> Option<Token> {
        self.0.read().expect("registry slot lock poisoned").clone()
    }
}

/// Process-global `name -> token` map. `Name` is any value the embedding
/// application chooses to identify a server; it just needs to be usable as
/// a `HashMap` key.
#[derive(Debug, Clone)]
pub struct Registry<Name: Eq + Hash + Clone> {
    entries: Arc<RwLock<HashMap<Name, Arc<Slot>>>>,
}

impl<Name: Eq + Hash + Clone> Registry<Name> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Idempotent: registering a name that already exists returns the
    /// existing slot instead of creating a new one, so that in-flight
    /// `fetch` callers keep seeing the same cache cell.
    pub(crate) fn register(&self, name: Name) -> Arc<Slot> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        entries.entry(name).or_insert_with(|| Arc::new(Slot::default())).clone()
    }

    pub(crate) fn publish(&self, name: &Name, token: Token) {
        if let Some(slot) = self.entries.read().expect("registry lock poisoned").get(name) {
            slot.publish(token);
        }
    }

    /// A fresh (non-stale) snapshot is sufficient to answer a cache hit
    /// without contacting the server (spec §4.5's invariant). A stale
    /// snapshot is treated as absent.
    #[must_use]
    pub fn snapshot(&self, name: &Name) -> Option<Token> {
        let slot = self.entries.read().expect("registry lock poisoned").get(name)?.clone();
        let token = slot.snapshot()?;
        if token.is_stale(now_epoch()) {
            None
        } else {
            Some(token)
        }
    }

    #[must_use]
    pub fn contains(&self, name: &Name) -> bool {
        self.entries.read().expect("registry lock poisoned").contains_key(name)
    }
}

impl<Name: Eq + Hash + Clone> Default for Registry<Name> {
    fn default() -> Self {
        Self::new()
    }
}
