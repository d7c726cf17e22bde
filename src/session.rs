//! Per-connection session state and the thread-safe registry of live
//! sessions. The registry never owns a connection's I/O; fan-out code takes a
//! point-in-time snapshot and performs all socket work against the copy, so
//! no lock is ever held across blocking I/O.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use crate::core::{now_micros, SessionId, SymbolId};


/// Capacity of a connection's outbound frame queue. A client that lets this
/// many frames pile up is treated as dead rather than allowed to stall
/// delivery to other subscribers.
pub const OUTBOUND_QUEUE_LEN: usize = 128;

/// Connection lifecycle. Transitions only move forward, except that
/// `Disconnected` is terminal and reachable from every state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ClientState {
    Connected,
    Authenticating,
    Authenticated,
    Subscribed,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: ClientState, to: ClientState },
    #[error("session is not authenticated")]
    NotAuthenticated,
    #[error("send to session {0} failed")]
    SendFailed(SessionId),
}

struct SessionState {
    state: ClientState,
    username: String,
    subscribed: HashSet<SymbolId>,
    last_activity: Instant,
}

pub struct ClientSession {
    id: SessionId,
    remote_addr: SocketAddr,
    connection_time: u64,
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    close_signal: Notify,
    inner: Mutex<SessionState>,
}

impl ClientSession {
    pub fn new(id: SessionId, remote_addr: SocketAddr, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id,
            remote_addr,
            connection_time: now_micros(),
            outbound: Mutex::new(Some(outbound)),
            close_signal: Notify::new(),
            inner: Mutex::new(SessionState {
                state: ClientState::Connected,
                username: String::new(),
                subscribed: HashSet::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Microseconds since the Unix epoch at which the connection was accepted.
    pub fn connection_time(&self) -> u64 {
        self.connection_time
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    pub fn username(&self) -> String {
        self.inner.lock().username.clone()
    }

    pub fn set_username(&self, username: &str) {
        self.inner.lock().username = username.to_string();
    }

    pub fn is_connected(&self) -> bool {
        self.state() != ClientState::Disconnected
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state(),
            ClientState::Authenticated | ClientState::Subscribed
        )
    }

    /// Move the session forward. A transition that would move backward is
    /// rejected, except that `Disconnected` is always reachable.
    pub fn transition(&self, to: ClientState) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if to != ClientState::Disconnected && to < inner.state {
            return Err(SessionError::InvalidTransition {
                from: inner.state,
                to,
            });
        }
        inner.state = to;
        Ok(())
    }

    /// Record a symbol in the session's own subscription set. Idempotent;
    /// returns whether the symbol was newly added.
    pub fn add_subscription(&self, symbol_id: SymbolId) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock();
        if !matches!(
            inner.state,
            ClientState::Authenticated | ClientState::Subscribed
        ) {
            return Err(SessionError::NotAuthenticated);
        }
        Ok(inner.subscribed.insert(symbol_id))
    }

    /// Idempotent counterpart of [`add_subscription`](Self::add_subscription).
    pub fn remove_subscription(&self, symbol_id: SymbolId) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock();
        if !matches!(
            inner.state,
            ClientState::Authenticated | ClientState::Subscribed
        ) {
            return Err(SessionError::NotAuthenticated);
        }
        Ok(inner.subscribed.remove(&symbol_id))
    }

    pub fn is_subscribed(&self, symbol_id: SymbolId) -> bool {
        self.inner.lock().subscribed.contains(&symbol_id)
    }

    pub fn subscribed_symbols(&self) -> Vec<SymbolId> {
        let inner = self.inner.lock();
        let mut symbols: Vec<SymbolId> = inner.subscribed.iter().copied().collect();
        symbols.sort_unstable();
        symbols
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscribed.len()
    }

    /// Drain the session's subscription set, returning what it held.
    /// Used on termination together with the index purge, so the session
    /// side of the mapping empties in the same teardown step; unlike
    /// [`remove_subscription`](Self::remove_subscription) it works in any
    /// state.
    pub fn take_subscriptions(&self) -> Vec<SymbolId> {
        let mut inner = self.inner.lock();
        let mut symbols: Vec<SymbolId> = inner.subscribed.drain().collect();
        symbols.sort_unstable();
        symbols
    }

    /// Queue one encoded frame for the connection's writer task. Never
    /// blocks: a full or closed queue is a send failure, and the caller is
    /// expected to drive the session to `Disconnecting`.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        let sender = self.outbound.lock().clone();
        match sender {
            Some(sender) => sender
                .try_send(frame)
                .map_err(|_| SessionError::SendFailed(self.id)),
            None => Err(SessionError::SendFailed(self.id)),
        }
    }

    /// Drop the outbound queue so the writer task drains and exits.
    pub fn close_outbound(&self) {
        self.outbound.lock().take();
    }

    /// Ask the connection's read loop to shut the socket down.
    pub fn request_close(&self) {
        self.close_signal.notify_one();
    }

    /// Resolves once [`request_close`](Self::request_close) has been called.
    pub async fn wait_close(&self) {
        self.close_signal.notified().await;
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }
}

/// Thread-safe collection of live sessions keyed by id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<ClientSession>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, session: Arc<ClientSession>) {
        self.sessions.write().insert(session.id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.write().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Point-in-time copy of every live session, ordered by id. Fan-out
    /// iterates the copy so the registry lock is released before any I/O.
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        let mut sessions: Vec<Arc<ClientSession>> =
            self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|session| session.id());
        sessions
    }

    pub fn find_by_username(&self, username: &str) -> Option<Arc<ClientSession>> {
        self.sessions
            .read()
            .values()
            .find(|session| session.username() == username)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(id: SessionId) -> (Arc<ClientSession>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        (Arc::new(ClientSession::new(id, addr, tx)), rx)
    }

    #[test]
    fn test_transitions_move_forward_only() {
        let (session, _rx) = make_session(1);
        assert_eq!(session.state(), ClientState::Connected);
        session.transition(ClientState::Authenticating).unwrap();
        session.transition(ClientState::Authenticated).unwrap();
        assert_eq!(
            session.transition(ClientState::Connected),
            Err(SessionError::InvalidTransition {
                from: ClientState::Authenticated,
                to: ClientState::Connected,
            })
        );
        // Same-state transitions are allowed.
        session.transition(ClientState::Authenticated).unwrap();
    }

    #[test]
    fn test_disconnected_is_reachable_from_any_state() {
        let (session, _rx) = make_session(1);
        session.transition(ClientState::Disconnected).unwrap();
        assert!(!session.is_connected());
        // Terminal: nothing but Disconnected is accepted afterwards.
        assert!(session.transition(ClientState::Authenticated).is_err());
        session.transition(ClientState::Disconnected).unwrap();
    }

    #[test]
    fn test_subscriptions_require_authentication() {
        let (session, _rx) = make_session(1);
        assert_eq!(
            session.add_subscription(1),
            Err(SessionError::NotAuthenticated)
        );
        session.transition(ClientState::Authenticating).unwrap();
        session.transition(ClientState::Authenticated).unwrap();
        assert_eq!(session.add_subscription(1), Ok(true));
        assert_eq!(session.add_subscription(1), Ok(false));
        assert!(session.is_subscribed(1));
        assert_eq!(session.remove_subscription(1), Ok(true));
        assert_eq!(session.remove_subscription(1), Ok(false));
    }

    #[test]
    fn test_take_subscriptions_drains_in_any_state() {
        let (session, _rx) = make_session(1);
        session.transition(ClientState::Authenticating).unwrap();
        session.transition(ClientState::Authenticated).unwrap();
        session.add_subscription(2).unwrap();
        session.add_subscription(1).unwrap();
        session.transition(ClientState::Disconnecting).unwrap();
        assert_eq!(session.take_subscriptions(), vec![1, 2]);
        assert_eq!(session.subscription_count(), 0);
    }

    #[test]
    fn test_send_fails_when_queue_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let session = ClientSession::new(7, addr, tx);
        session.send(vec![1]).unwrap();
        assert_eq!(session.send(vec![2]), Err(SessionError::SendFailed(7)));
    }

    #[test]
    fn test_send_fails_after_close_outbound() {
        let (session, mut rx) = make_session(3);
        session.send(vec![9]).unwrap();
        session.close_outbound();
        assert_eq!(session.send(vec![9]), Err(SessionError::SendFailed(3)));
        // The frame queued before the close is still delivered.
        assert_eq!(rx.try_recv().unwrap(), vec![9]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_registry_snapshot_is_ordered_and_detached() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = make_session(registry.next_session_id());
        let (b, _rx_b) = make_session(registry.next_session_id());
        let (c, _rx_c) = make_session(registry.next_session_id());
        registry.insert(c.clone());
        registry.insert(a.clone());
        registry.insert(b.clone());
        assert_eq!(registry.count(), 3);

        let snapshot = registry.snapshot();
        let ids: Vec<SessionId> = snapshot.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id(), c.id()]);

        // Removing after the snapshot does not invalidate the copy.
        registry.remove(b.id());
        assert_eq!(registry.count(), 2);
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn test_registry_find_by_username() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = make_session(registry.next_session_id());
        a.set_username("alice");
        registry.insert(a.clone());
        assert_eq!(registry.find_by_username("alice").unwrap().id(), a.id());
        assert!(registry.find_by_username("bob").is_none());
    }
}
