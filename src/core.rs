use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use thiserror::Error;


/// Server-global identifier for an instrument symbol.
pub type SymbolId = u32;

/// Stable identifier for a client connection, never reused within a process.
pub type SessionId = u64;


#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side {
    Buy,
    Sell,
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Normalized trade event emitted by an exchange feed adapter.
#[derive(Clone, PartialEq, Debug)]
pub struct MarketTrade {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub side: Side,
    pub timestamp: u64,
}

/// Normalized top-of-book event emitted by an exchange feed adapter.
#[derive(Clone, PartialEq, Debug)]
pub struct MarketLevel2 {
    pub symbol: String,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
    pub timestamp: u64,
}

/// Configuration entry for one exchange feed. An empty `endpoint` means the
/// adapter connects to its built-in default URL.
#[derive(Clone, Deserialize, Debug)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub requires_auth: bool,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("unsupported exchange: {0} (supported exchanges: coinbase, binance)")]
    UnsupportedExchange(String),
    #[error("connection to {exchange} failed: {reason}")]
    Connection {
        exchange: &'static str,
        reason: String,
    },
    #[error("{exchange} feed is not connected")]
    NotConnected { exchange: &'static str },
    #[error("subscription to {symbol} on {exchange} failed")]
    Subscription {
        exchange: &'static str,
        symbol: String,
    },
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}
