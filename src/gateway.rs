//! Inbound request handling against the session registry and subscription
//! index, plus the periodic heartbeat/idle monitor.
//!
//! A subscribe or unsubscribe request is fully applied to the session and
//! the index before any frame is produced for it, so the client's view of
//! its subscriptions is read-consistent with the index from that point on.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::codec::{
    DecodeError, LogonRequest, LogonResponse, LogonStatus, MarketDataRequest, Message,
    SubscriptionAction, PROTOCOL_VERSION,
};
use crate::exchange::FeedManager;
use crate::session::{ClientSession, ClientState, SessionRegistry};
use crate::subscription::SubscriptionIndex;


/// Heartbeat intervals a session may stay silent before it is presumed dead.
const IDLE_GRACE_INTERVALS: u32 = 3;

pub struct Gateway {
    registry: Arc<SessionRegistry>,
    index: Arc<SubscriptionIndex>,
    feeds: Arc<Mutex<FeedManager>>,
    heartbeat_interval: Duration,
}

impl Gateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        index: Arc<SubscriptionIndex>,
        feeds: Arc<Mutex<FeedManager>>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            registry,
            index,
            feeds,
            heartbeat_interval,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn index(&self) -> &Arc<SubscriptionIndex> {
        &self.index
    }

    /// Handle one complete frame from a client connection. A decode error is
    /// returned to the caller, which terminates that connection only.
    pub async fn handle_frame(
        &self,
        session: &Arc<ClientSession>,
        frame: &[u8],
    ) -> Result<(), DecodeError> {
        let message = Message::decode(frame)?;
        session.touch();
        match message {
            Message::LogonRequest(request) => self.handle_logon(session, request),
            Message::MarketDataRequest(request) => {
                self.handle_market_data_request(session, request).await
            }
            Message::Heartbeat => debug!("heartbeat from client {}", session.id()),
            // Server-to-client opcodes arriving inbound are a protocol
            // violation.
            other => {
                warn!(
                    "client {} sent unexpected {:?}, closing",
                    session.id(),
                    other.message_type()
                );
                let _ = session.transition(ClientState::Disconnecting);
                session.request_close();
            }
        }
        Ok(())
    }

    fn handle_logon(&self, session: &Arc<ClientSession>, request: LogonRequest) {
        if session.transition(ClientState::Authenticating).is_err() {
            self.reject_logon(session, "logon after authentication");
            return;
        }
        if request.protocol_version != PROTOCOL_VERSION {
            self.reject_logon(
                session,
                &format!(
                    "unsupported protocol version {} (server speaks {})",
                    request.protocol_version, PROTOCOL_VERSION
                ),
            );
            return;
        }
        if request.username.is_empty() {
            self.reject_logon(session, "username required");
            return;
        }
        if let Some(existing) = self.registry.find_by_username(&request.username) {
            if existing.id() != session.id() {
                self.reject_logon(session, "username already connected");
                return;
            }
        }

        session.set_username(&request.username);
        let _ = session.transition(ClientState::Authenticated);
        info!(
            "client {} authenticated as {} ({})",
            session.id(),
            request.username,
            session.remote_addr()
        );
        let response = Message::LogonResponse(LogonResponse {
            result: LogonStatus::Success,
            result_text: "logon accepted".to_string(),
        });
        if session.send(response.encode()).is_err() {
            let _ = session.transition(ClientState::Disconnecting);
            session.request_close();
        }
    }

    fn reject_logon(&self, session: &Arc<ClientSession>, reason: &str) {
        warn!("rejecting logon from client {}: {}", session.id(), reason);
        let response = Message::LogonResponse(LogonResponse {
            result: LogonStatus::Failure,
            result_text: reason.to_string(),
        });
        let _ = session.send(response.encode());
        let _ = session.transition(ClientState::Disconnecting);
        session.request_close();
    }

    async fn handle_market_data_request(
        &self,
        session: &Arc<ClientSession>,
        request: MarketDataRequest,
    ) {
        if !session.is_authenticated() {
            warn!(
                "client {} requested market data while unauthenticated, closing",
                session.id()
            );
            let _ = session.transition(ClientState::Disconnecting);
            session.request_close();
            return;
        }
        match request.action {
            SubscriptionAction::Subscribe => {
                let symbol_id = self.index.intern(&request.symbol, request.symbol_id);
                if session.add_subscription(symbol_id).is_err() {
                    return;
                }
                self.index.subscribe(session.id(), symbol_id);
                let _ = session.transition(ClientState::Subscribed);
                info!(
                    "client {} subscribed to {} (id {})",
                    session.id(),
                    request.symbol,
                    symbol_id
                );
                self.feeds.lock().await.ensure_symbol(&request.symbol).await;
            }
            SubscriptionAction::Unsubscribe => {
                let Some(symbol_id) = self.index.resolve(&request.symbol) else {
                    debug!(
                        "client {} unsubscribed unknown symbol {}",
                        session.id(),
                        request.symbol
                    );
                    return;
                };
                let _ = session.remove_subscription(symbol_id);
                self.index.unsubscribe(session.id(), symbol_id);
                info!(
                    "client {} unsubscribed from {} (id {})",
                    session.id(),
                    request.symbol,
                    symbol_id
                );
                if !self.index.has_subscribers(symbol_id) {
                    self.feeds.lock().await.release_symbol(&request.symbol).await;
                }
            }
        }
    }

    /// Tear down a terminated session: purge the index, release feed symbols
    /// that lost their last subscriber, drop the registry entry.
    pub async fn on_disconnect(&self, session: &Arc<ClientSession>) {
        let _ = session.transition(ClientState::Disconnecting);
        let subscribed = session.take_subscriptions();
        self.index.purge_session(session.id());
        self.registry.remove(session.id());

        let mut released = Vec::new();
        for symbol_id in subscribed {
            if !self.index.has_subscribers(symbol_id) {
                if let Some(name) = self.index.symbol_name(symbol_id) {
                    released.push(name);
                }
            }
        }
        if !released.is_empty() {
            let mut feeds = self.feeds.lock().await;
            for name in released {
                feeds.release_symbol(&name).await;
            }
        }

        session.close_outbound();
        let _ = session.transition(ClientState::Disconnected);
    }

    /// Spawn the periodic heartbeat/idle monitor. It encodes one heartbeat
    /// per tick and fans it out over a registry snapshot; sessions that fail
    /// the send or have been silent too long are closed.
    pub fn spawn_heartbeat_monitor(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let gateway = self;
        tokio::spawn(async move {
            let mut ticker = interval(gateway.heartbeat_interval);
            let idle_limit = gateway.heartbeat_interval * IDLE_GRACE_INTERVALS;
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let frame = Message::Heartbeat.encode();
                        for session in gateway.registry.snapshot() {
                            if session.idle_for() > idle_limit {
                                warn!(
                                    "client {} idle for {:?}, closing",
                                    session.id(),
                                    session.idle_for()
                                );
                                let _ = session.transition(ClientState::Disconnecting);
                                session.request_close();
                                continue;
                            }
                            if session.send(frame.clone()).is_err() {
                                warn!("heartbeat to client {} failed, closing", session.id());
                                let _ = session.transition(ClientState::Disconnecting);
                                session.request_close();
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("heartbeat monitor stopped");
        })
    }
}


#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::MarketDataUpdateTrade;
    use crate::core::{MarketTrade, Side};
    use crate::dispatcher::BroadcastDispatcher;
    use crate::session::OUTBOUND_QUEUE_LEN;

    fn test_gateway() -> Arc<Gateway> {
        let registry = Arc::new(SessionRegistry::new());
        let index = Arc::new(SubscriptionIndex::new());
        let feeds = Arc::new(Mutex::new(FeedManager::new(Vec::new())));
        Arc::new(Gateway::new(
            registry,
            index,
            feeds,
            Duration::from_secs(30),
        ))
    }

    fn connect(gateway: &Gateway) -> (Arc<ClientSession>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let session = Arc::new(ClientSession::new(
            gateway.registry().next_session_id(),
            addr,
            tx,
        ));
        gateway.registry().insert(session.clone());
        (session, rx)
    }

    fn logon_frame(username: &str, protocol_version: u32) -> Vec<u8> {
        Message::LogonRequest(LogonRequest {
            protocol_version,
            username: username.to_string(),
            password: "secret".to_string(),
            general_text: String::new(),
        })
        .encode()
    }

    fn subscribe_frame(symbol: &str, symbol_id: u32) -> Vec<u8> {
        Message::MarketDataRequest(MarketDataRequest {
            action: SubscriptionAction::Subscribe,
            symbol_id,
            symbol: symbol.to_string(),
        })
        .encode()
    }

    fn unsubscribe_frame(symbol: &str, symbol_id: u32) -> Vec<u8> {
        Message::MarketDataRequest(MarketDataRequest {
            action: SubscriptionAction::Unsubscribe,
            symbol_id,
            symbol: symbol.to_string(),
        })
        .encode()
    }

    async fn logon(gateway: &Gateway, session: &Arc<ClientSession>, rx: &mut mpsc::Receiver<Vec<u8>>) {
        gateway
            .handle_frame(session, &logon_frame("alice", PROTOCOL_VERSION))
            .await
            .unwrap();
        match Message::decode(&rx.try_recv().unwrap()).unwrap() {
            Message::LogonResponse(response) => {
                assert_eq!(response.result, LogonStatus::Success)
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_successful_logon() {
        let gateway = test_gateway();
        let (session, mut rx) = connect(&gateway);
        logon(&gateway, &session, &mut rx).await;
        assert_eq!(session.state(), ClientState::Authenticated);
        assert_eq!(session.username(), "alice");
        assert_eq!(
            gateway.registry().find_by_username("alice").unwrap().id(),
            session.id()
        );
    }

    #[tokio::test]
    async fn test_logon_rejects_wrong_protocol_version() {
        let gateway = test_gateway();
        let (session, mut rx) = connect(&gateway);
        gateway
            .handle_frame(&session, &logon_frame("alice", PROTOCOL_VERSION + 1))
            .await
            .unwrap();
        match Message::decode(&rx.try_recv().unwrap()).unwrap() {
            Message::LogonResponse(response) => {
                assert_eq!(response.result, LogonStatus::Failure);
                assert!(response.result_text.contains("protocol version"));
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(session.state(), ClientState::Disconnecting);
    }

    #[tokio::test]
    async fn test_logon_rejects_duplicate_username() {
        let gateway = test_gateway();
        let (first, mut rx_first) = connect(&gateway);
        logon(&gateway, &first, &mut rx_first).await;

        let (second, mut rx_second) = connect(&gateway);
        gateway
            .handle_frame(&second, &logon_frame("alice", PROTOCOL_VERSION))
            .await
            .unwrap();
        match Message::decode(&rx_second.try_recv().unwrap()).unwrap() {
            Message::LogonResponse(response) => {
                assert_eq!(response.result, LogonStatus::Failure)
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(second.state(), ClientState::Disconnecting);
        assert_eq!(first.state(), ClientState::Authenticated);
    }

    #[tokio::test]
    async fn test_subscribe_before_logon_closes_connection() {
        let gateway = test_gateway();
        let (session, mut rx) = connect(&gateway);
        gateway
            .handle_frame(&session, &subscribe_frame("BTC-USD", 1))
            .await
            .unwrap();
        assert_eq!(session.state(), ClientState::Disconnecting);
        assert!(rx.try_recv().is_err());
        assert!(gateway.index().resolve("BTC-USD").is_none());
    }

    #[tokio::test]
    async fn test_subscribe_is_applied_before_any_response() {
        let gateway = test_gateway();
        let (session, mut rx) = connect(&gateway);
        logon(&gateway, &session, &mut rx).await;

        gateway
            .handle_frame(&session, &subscribe_frame("BTC-USD", 1))
            .await
            .unwrap();
        let symbol_id = gateway.index().resolve("BTC-USD").unwrap();
        assert_eq!(symbol_id, 1);
        assert!(session.is_subscribed(symbol_id));
        assert_eq!(gateway.index().subscribers_of(symbol_id), vec![session.id()]);
        assert_eq!(session.state(), ClientState::Subscribed);
    }

    #[tokio::test]
    async fn test_subscribed_session_receives_dispatched_trade() {
        let gateway = test_gateway();
        let (session, mut rx) = connect(&gateway);
        logon(&gateway, &session, &mut rx).await;
        gateway
            .handle_frame(&session, &subscribe_frame("BTC-USD", 1))
            .await
            .unwrap();

        let dispatcher = BroadcastDispatcher::new(
            Arc::clone(gateway.registry()),
            Arc::clone(gateway.index()),
        );
        dispatcher.on_trade(&MarketTrade {
            symbol: "BTC-USD".to_string(),
            price: 65000.50,
            volume: 0.01,
            side: Side::Buy,
            timestamp: 11,
        });

        match Message::decode(&rx.try_recv().unwrap()).unwrap() {
            Message::MarketDataUpdateTrade(MarketDataUpdateTrade {
                symbol_id,
                price,
                volume,
                ..
            }) => {
                assert_eq!(symbol_id, 1);
                assert_eq!(price, 65000.50);
                assert_eq!(volume, 0.01);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let gateway = test_gateway();
        let (session, mut rx) = connect(&gateway);
        logon(&gateway, &session, &mut rx).await;
        gateway
            .handle_frame(&session, &subscribe_frame("BTC-USD", 1))
            .await
            .unwrap();
        gateway
            .handle_frame(&session, &unsubscribe_frame("BTC-USD", 1))
            .await
            .unwrap();

        assert!(!session.is_subscribed(1));
        assert!(gateway.index().subscribers_of(1).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_purges_all_subscriptions() {
        let gateway = test_gateway();
        let (session, mut rx) = connect(&gateway);
        logon(&gateway, &session, &mut rx).await;
        gateway
            .handle_frame(&session, &subscribe_frame("BTC-USD", 1))
            .await
            .unwrap();
        gateway
            .handle_frame(&session, &subscribe_frame("ETH-USD", 2))
            .await
            .unwrap();
        assert_eq!(gateway.registry().count(), 1);

        gateway.on_disconnect(&session).await;

        assert_eq!(gateway.registry().count(), 0);
        assert!(gateway.index().subscribers_of(1).is_empty());
        assert!(gateway.index().subscribers_of(2).is_empty());
        assert_eq!(session.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_index_and_sessions_stay_consistent() {
        let gateway = test_gateway();
        let (a, mut rx_a) = connect(&gateway);
        let (b, mut rx_b) = connect(&gateway);
        logon(&gateway, &a, &mut rx_a).await;
        gateway
            .handle_frame(&b, &logon_frame("bob", PROTOCOL_VERSION))
            .await
            .unwrap();
        rx_b.try_recv().unwrap();

        for symbol in ["BTC-USD", "ETH-USD", "SOL-USD"] {
            gateway
                .handle_frame(&a, &subscribe_frame(symbol, 0))
                .await
                .unwrap();
            gateway
                .handle_frame(&b, &subscribe_frame(symbol, 0))
                .await
                .unwrap();
        }
        gateway
            .handle_frame(&a, &unsubscribe_frame("ETH-USD", 0))
            .await
            .unwrap();
        gateway.on_disconnect(&b).await;

        // Both sides of the mapping agree for every symbol and session.
        for session in [&a, &b] {
            for symbol in ["BTC-USD", "ETH-USD", "SOL-USD"] {
                let symbol_id = gateway.index().resolve(symbol).unwrap();
                let indexed = gateway
                    .index()
                    .subscribers_of(symbol_id)
                    .contains(&session.id());
                assert_eq!(indexed, session.is_subscribed(symbol_id));
            }
        }
    }

    #[tokio::test]
    async fn test_inbound_server_opcode_closes_connection() {
        let gateway = test_gateway();
        let (session, mut rx) = connect(&gateway);
        logon(&gateway, &session, &mut rx).await;
        let frame = Message::MarketDataUpdateTrade(MarketDataUpdateTrade {
            symbol_id: 1,
            price: 1.0,
            volume: 1.0,
            timestamp: 1,
        })
        .encode();
        gateway.handle_frame(&session, &frame).await.unwrap();
        assert_eq!(session.state(), ClientState::Disconnecting);
    }

    #[tokio::test]
    async fn test_decode_error_propagates_to_caller() {
        let gateway = test_gateway();
        let (session, _rx) = connect(&gateway);
        let result = gateway.handle_frame(&session, &[0x02, 0x00]).await;
        assert!(matches!(result, Err(DecodeError::TruncatedHeader { .. })));
    }

    #[tokio::test]
    async fn test_heartbeat_monitor_sends_heartbeats() {
        let registry = Arc::new(SessionRegistry::new());
        let index = Arc::new(SubscriptionIndex::new());
        let feeds = Arc::new(Mutex::new(FeedManager::new(Vec::new())));
        let gateway = Arc::new(Gateway::new(
            registry,
            index,
            feeds,
            Duration::from_millis(20),
        ));
        let (session, mut rx) = connect(&gateway);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = gateway.spawn_heartbeat_monitor(shutdown_rx);

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::Heartbeat);

        shutdown_tx.send(true).unwrap();
        monitor.await.unwrap();
        // Keep the connection alive until the monitor has stopped.
        drop(session);
    }
}
