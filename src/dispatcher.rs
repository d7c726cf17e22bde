//! Fan-out of normalized feed events to subscribed client sessions.
//!
//! Each event is encoded exactly once and the subscriber set is taken as a
//! snapshot, so no index or registry lock is held while frames are queued.
//! A failing subscriber is marked for disconnection and skipped; it never
//! aborts delivery to the rest.

use std::sync::Arc;

use log::{debug, warn};

use crate::codec::{MarketDataUpdateBidAsk, MarketDataUpdateTrade, Message};
use crate::core::{MarketLevel2, MarketTrade, SessionId};
use crate::session::{ClientState, SessionRegistry};
use crate::subscription::SubscriptionIndex;


pub struct BroadcastDispatcher {
    registry: Arc<SessionRegistry>,
    index: Arc<SubscriptionIndex>,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, index: Arc<SubscriptionIndex>) -> Self {
        Self { registry, index }
    }

    /// Deliver a trade event to every session subscribed to its symbol.
    /// Safe to call concurrently from independent feed tasks.
    pub fn on_trade(&self, trade: &MarketTrade) {
        let Some(symbol_id) = self.index.resolve(&trade.symbol) else {
            debug!("trade for unregistered symbol {}, dropped", trade.symbol);
            return;
        };
        let subscribers = self.index.subscribers_of(symbol_id);
        if subscribers.is_empty() {
            return;
        }
        let frame = Message::MarketDataUpdateTrade(MarketDataUpdateTrade {
            symbol_id,
            price: trade.price,
            volume: trade.volume,
            timestamp: trade.timestamp,
        })
        .encode();
        self.fan_out(&subscribers, frame);
    }

    /// Deliver a top-of-book event to every session subscribed to its symbol.
    pub fn on_level2(&self, level2: &MarketLevel2) {
        let Some(symbol_id) = self.index.resolve(&level2.symbol) else {
            debug!("level2 for unregistered symbol {}, dropped", level2.symbol);
            return;
        };
        let subscribers = self.index.subscribers_of(symbol_id);
        if subscribers.is_empty() {
            return;
        }
        let frame = Message::MarketDataUpdateBidAsk(MarketDataUpdateBidAsk {
            symbol_id,
            bid_price: level2.bid_price,
            bid_quantity: level2.bid_size,
            ask_price: level2.ask_price,
            ask_quantity: level2.ask_size,
            timestamp: level2.timestamp,
        })
        .encode();
        self.fan_out(&subscribers, frame);
    }

    fn fan_out(&self, subscribers: &[SessionId], frame: Vec<u8>) {
        for &session_id in subscribers {
            // The session may have disconnected between the snapshot and now.
            let Some(session) = self.registry.get(session_id) else {
                continue;
            };
            if session.send(frame.clone()).is_err() {
                warn!(
                    "dropping client {} ({}): outbound queue unavailable",
                    session_id,
                    session.remote_addr()
                );
                let _ = session.transition(ClientState::Disconnecting);
                session.request_close();
            }
        }
    }
}
