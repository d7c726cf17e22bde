//! Symbol interning and the bidirectional symbol/subscriber index.
//!
//! Both sides of the mapping live behind one lock so every mutation,
//! including the purge on an abrupt disconnect, is atomic with respect to
//! concurrent readers. Readers get snapshot copies, never references into
//! the guarded state.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::core::{SessionId, SymbolId};


struct IndexState {
    ids_by_name: HashMap<String, SymbolId>,
    names_by_id: HashMap<SymbolId, String>,
    subscribers: HashMap<SymbolId, HashSet<SessionId>>,
    next_symbol_id: SymbolId,
}

pub struct SubscriptionIndex {
    inner: RwLock<IndexState>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexState {
                ids_by_name: HashMap::new(),
                names_by_id: HashMap::new(),
                subscribers: HashMap::new(),
                next_symbol_id: 1,
            }),
        }
    }

    /// Resolve `name` to its server-global id, binding it on first use.
    /// The first binder fixes the id: `requested_id` is honored when nonzero
    /// and free, otherwise the next free id is allocated. Later callers get
    /// the canonical id regardless of what they request.
    pub fn intern(&self, name: &str, requested_id: SymbolId) -> SymbolId {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.ids_by_name.get(name) {
            return id;
        }
        let id = if requested_id != 0 && !inner.names_by_id.contains_key(&requested_id) {
            requested_id
        } else {
            let mut candidate = inner.next_symbol_id;
            while inner.names_by_id.contains_key(&candidate) {
                candidate += 1;
            }
            candidate
        };
        inner.ids_by_name.insert(name.to_string(), id);
        inner.names_by_id.insert(id, name.to_string());
        if id >= inner.next_symbol_id {
            inner.next_symbol_id = id + 1;
        }
        id
    }

    pub fn resolve(&self, name: &str) -> Option<SymbolId> {
        self.inner.read().ids_by_name.get(name).copied()
    }

    pub fn symbol_name(&self, symbol_id: SymbolId) -> Option<String> {
        self.inner.read().names_by_id.get(&symbol_id).cloned()
    }

    /// Record a session's interest in a symbol. Idempotent.
    pub fn subscribe(&self, session_id: SessionId, symbol_id: SymbolId) {
        self.inner
            .write()
            .subscribers
            .entry(symbol_id)
            .or_default()
            .insert(session_id);
    }

    /// Remove a session's interest in a symbol. No-op when absent.
    pub fn unsubscribe(&self, session_id: SessionId, symbol_id: SymbolId) -> bool {
        let mut inner = self.inner.write();
        match inner.subscribers.get_mut(&symbol_id) {
            Some(sessions) => {
                let removed = sessions.remove(&session_id);
                if sessions.is_empty() {
                    inner.subscribers.remove(&symbol_id);
                }
                removed
            }
            None => false,
        }
    }

    /// Remove every entry referencing `session_id` in one critical section.
    /// Invoked once on session termination; afterwards no `subscribers_of`
    /// snapshot can contain the session.
    pub fn purge_session(&self, session_id: SessionId) {
        let mut inner = self.inner.write();
        inner.subscribers.retain(|_, sessions| {
            sessions.remove(&session_id);
            !sessions.is_empty()
        });
    }

    /// Snapshot copy of the subscriber set for a symbol, ordered by session
    /// id so fan-out order is deterministic.
    pub fn subscribers_of(&self, symbol_id: SymbolId) -> Vec<SessionId> {
        let inner = self.inner.read();
        let mut sessions: Vec<SessionId> = inner
            .subscribers
            .get(&symbol_id)
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default();
        sessions.sort_unstable();
        sessions
    }

    pub fn has_subscribers(&self, symbol_id: SymbolId) -> bool {
        self.inner.read().subscribers.contains_key(&symbol_id)
    }

    /// Names of every symbol that currently has at least one subscriber.
    /// Drives the dynamic feed subscriptions.
    pub fn active_symbols(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .subscribers
            .keys()
            .filter_map(|id| inner.names_by_id.get(id).cloned())
            .collect();
        names.sort_unstable();
        names
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}
