//! Binance WebSocket exchange feed adapter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use rust_decimal::prelude::*;
use serde::Deserialize;

use crate::core::{now_micros, ExchangeConfig, FeedError, MarketLevel2, MarketTrade, Side};
use crate::exchange::{
    endpoint_or, CallbackSlots, ExchangeFeedAdapter, FeedConnection, FeedMessageHandler,
    Level2Callback, TradeCallback,
};


const BINANCE_CODE: &'static str = "binance";
const BINANCE_WS_URL: &str = "wss://stream.binance.com:443/ws";


/// Binance stream code for a gateway symbol: dash stripped, lowercased, and
/// USD quoted pairs mapped onto the USDT market.
fn normalize_symbol(symbol: &str) -> String {
    let compact = symbol.replace('-', "").to_lowercase();
    if compact.ends_with("usd") {
        format!("{}t", compact)
    } else {
        compact
    }
}

#[derive(Deserialize, Debug)]
struct BinanceTrade {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

/// Book ticker events carry no `"e"` tag, only the quote fields.
#[derive(Deserialize, Debug)]
struct BinanceBookTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid_price: String,
    #[serde(rename = "B")]
    bid_quantity: String,
    #[serde(rename = "a")]
    ask_price: String,
    #[serde(rename = "A")]
    ask_quantity: String,
}

fn parse_amount(value: &str) -> Option<f64> {
    Decimal::from_str(value).ok()?.to_f64()
}

impl BinanceTrade {
    fn into_trade(self, symbol: String) -> Option<MarketTrade> {
        Some(MarketTrade {
            symbol,
            price: parse_amount(&self.price)?,
            volume: parse_amount(&self.quantity)?,
            // The maker side is the resting order: a maker buyer means the
            // aggressor sold.
            side: if self.buyer_is_maker {
                Side::Sell
            } else {
                Side::Buy
            },
            timestamp: now_micros(),
        })
    }
}

impl BinanceBookTicker {
    fn into_level2(self, symbol: String) -> Option<MarketLevel2> {
        Some(MarketLevel2 {
            symbol,
            bid_price: parse_amount(&self.bid_price)?,
            bid_size: parse_amount(&self.bid_quantity)?,
            ask_price: parse_amount(&self.ask_price)?,
            ask_size: parse_amount(&self.ask_quantity)?,
            timestamp: now_micros(),
        })
    }
}

pub struct BinanceAdapter {
    config: ExchangeConfig,
    connection: Option<FeedConnection>,
    replay: Arc<Mutex<Vec<String>>>,
    callbacks: Arc<CallbackSlots>,
    /// Binance market code (upper case) back to the gateway symbol name.
    symbol_names: Arc<Mutex<HashMap<String, String>>>,
    subscribed: Vec<String>,
    next_request_id: u64,
}

impl BinanceAdapter {
    pub fn new(config: ExchangeConfig) -> Self {
        Self {
            config,
            connection: None,
            replay: Arc::new(Mutex::new(Vec::new())),
            callbacks: Arc::new(CallbackSlots::default()),
            symbol_names: Arc::new(Mutex::new(HashMap::new())),
            subscribed: Vec::new(),
            next_request_id: 1,
        }
    }

    fn message_handler(&self) -> FeedMessageHandler {
        let callbacks = Arc::clone(&self.callbacks);
        let symbol_names = Arc::clone(&self.symbol_names);
        Arc::new(move |text: &str| {
            if let Ok(event) = serde_json::from_str::<BinanceTrade>(text) {
                if event.event_type == "trade" {
                    let symbol = resolve_name(&symbol_names, &event.symbol);
                    match event.into_trade(symbol) {
                        Some(trade) => callbacks.emit_trade(trade),
                        None => debug!("discarding malformed binance trade"),
                    }
                }
                return;
            }
            if let Ok(event) = serde_json::from_str::<BinanceBookTicker>(text) {
                let symbol = resolve_name(&symbol_names, &event.symbol);
                match event.into_level2(symbol) {
                    Some(level2) => callbacks.emit_level2(level2),
                    None => debug!("discarding malformed binance book ticker"),
                }
                return;
            }
            debug!("could not parse binance message {}", text);
        })
    }

    fn stream_request(&mut self, method: &str, stream: &str) -> String {
        let id = self.next_request_id;
        self.next_request_id += 1;
        format!(
            r#"{{"method":"{}","params":["{}"],"id":{}}}"#,
            method, stream, id
        )
    }

    fn record_symbol(&mut self, symbol: &str) {
        self.symbol_names
            .lock()
            .insert(normalize_symbol(symbol).to_uppercase(), symbol.to_string());
        if !self.subscribed.iter().any(|s| s == symbol) {
            self.subscribed.push(symbol.to_string());
        }
    }

    async fn subscribe_stream(&mut self, symbol: &str, suffix: &str) -> Result<(), FeedError> {
        if self.connection.is_none() {
            return Err(FeedError::NotConnected {
                exchange: BINANCE_CODE,
            });
        }
        let stream = format!("{}@{}", normalize_symbol(symbol), suffix);
        let message = self.stream_request("SUBSCRIBE", &stream);
        self.replay.lock().push(message.clone());
        if let Some(connection) = self.connection.as_ref() {
            connection.send(message).await?;
        }
        self.record_symbol(symbol);
        Ok(())
    }
}

fn resolve_name(symbol_names: &Mutex<HashMap<String, String>>, market_code: &str) -> String {
    symbol_names
        .lock()
        .get(market_code)
        .cloned()
        .unwrap_or_else(|| market_code.to_string())
}

#[async_trait]
impl ExchangeFeedAdapter for BinanceAdapter {
    fn exchange_code(&self) -> &'static str {
        BINANCE_CODE
    }

    async fn connect(&mut self) -> Result<(), FeedError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let handler = self.message_handler();
        let connection = FeedConnection::open(
            BINANCE_CODE,
            endpoint_or(&self.config, BINANCE_WS_URL),
            Arc::clone(&self.replay),
            handler,
        )
        .await?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.replay.lock().clear();
        self.subscribed.clear();
    }

    async fn subscribe_trades(&mut self, symbol: &str) -> Result<(), FeedError> {
        self.subscribe_stream(symbol, "trade").await
    }

    async fn subscribe_level2(&mut self, symbol: &str) -> Result<(), FeedError> {
        self.subscribe_stream(symbol, "bookTicker").await
    }

    async fn unsubscribe(&mut self, symbol: &str) -> Result<(), FeedError> {
        if self.connection.is_none() {
            return Err(FeedError::NotConnected {
                exchange: BINANCE_CODE,
            });
        }
        let market_code = normalize_symbol(symbol);
        let quoted = format!("\"{}@", market_code);
        self.replay.lock().retain(|message| !message.contains(&quoted));
        for suffix in ["trade", "bookTicker"] {
            let stream = format!("{}@{}", market_code, suffix);
            let message = self.stream_request("UNSUBSCRIBE", &stream);
            if let Some(connection) = self.connection.as_ref() {
                connection.send(message).await?;
            }
        }
        self.subscribed.retain(|s| s != symbol);
        Ok(())
    }

    fn set_trade_callback(&mut self, callback: TradeCallback) {
        self.callbacks.set_trade(callback);
    }

    fn set_level2_callback(&mut self, callback: Level2Callback) {
        self.callbacks.set_level2(callback);
    }

    fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|connection| connection.is_connected())
            .unwrap_or(false)
    }

    fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribed.clone()
    }
}
