//! Coinbase WebSocket exchange feed adapter.

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


const COINBASE_CODE: &'static str = "coinbase";
const COINBASE_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";


#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CoinbaseEvent {
    Match(CoinbaseMatch),
    LastMatch(CoinbaseMatch),
    Ticker(CoinbaseTicker),
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct CoinbaseMatch {
    product_id: String,
    price: String,
    size: String,
    side: String,
}

#[derive(Deserialize, Debug)]
struct CoinbaseTicker {
    product_id: String,
    best_bid: String,
    best_ask: String,
    #[serde(default)]
    best_bid_size: String,
    #[serde(default)]
    best_ask_size: String,
}

fn parse_amount(value: &str) -> Option<f64> {
    Decimal::from_str(value).ok()?.to_f64()
}

impl CoinbaseMatch {
    fn into_trade(self) -> Option<MarketTrade> {
        let side = match self.side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            _ => return None,
        };
        Some(MarketTrade {
            symbol: self.product_id,
            price: parse_amount(&self.price)?,
            volume: parse_amount(&self.size)?,
            side,
            timestamp: now_micros(),
        })
    }
}

impl CoinbaseTicker {
    fn into_level2(self) -> Option<MarketLevel2> {
        Some(MarketLevel2 {
            symbol: self.product_id,
            bid_price: parse_amount(&self.best_bid)?,
            bid_size: parse_amount(&self.best_bid_size).unwrap_or(0.0),
            ask_price: parse_amount(&self.best_ask)?,
            ask_size: parse_amount(&self.best_ask_size).unwrap_or(0.0),
            timestamp: now_micros(),
        })
    }
}

fn subscribe_message(channel: &str, symbol: &str) -> String {
    format!(
        r#"{{"type":"subscribe","product_ids":["{}"],"channels":["{}"]}}"#,
        symbol, channel
    )
}

fn unsubscribe_message(symbol: &str) -> String {
    format!(
        r#"{{"type":"unsubscribe","product_ids":["{}"],"channels":["matches","ticker"]}}"#,
        symbol
    )
}

pub struct CoinbaseAdapter {
    config: ExchangeConfig,
    connection: Option<FeedConnection>,
    replay: Arc<Mutex<Vec<String>>>,
    callbacks: Arc<CallbackSlots>,
    subscribed: Vec<String>,
}

impl CoinbaseAdapter {
    pub fn new(config: ExchangeConfig) -> Self {
        Self {
            config,
            connection: None,
            replay: Arc::new(Mutex::new(Vec::new())),
            callbacks: Arc::new(CallbackSlots::default()),
            subscribed: Vec::new(),
        }
    }

    fn message_handler(&self) -> FeedMessageHandler {
        let callbacks = Arc::clone(&self.callbacks);
        Arc::new(move |text: &str| match serde_json::from_str::<CoinbaseEvent>(text) {
            Ok(CoinbaseEvent::Match(event)) | Ok(CoinbaseEvent::LastMatch(event)) => {
                match event.into_trade() {
                    Some(trade) => callbacks.emit_trade(trade),
                    None => debug!("discarding malformed coinbase match"),
                }
            }
            Ok(CoinbaseEvent::Ticker(event)) => match event.into_level2() {
                Some(level2) => callbacks.emit_level2(level2),
                None => debug!("discarding malformed coinbase ticker"),
            },
            Ok(CoinbaseEvent::Other) => (),
            Err(_) => debug!("could not parse coinbase message {}", text),
        })
    }

    fn record_symbol(&mut self, symbol: &str) {
        if !self.subscribed.iter().any(|s| s == symbol) {
            self.subscribed.push(symbol.to_string());
        }
    }
}

#[async_trait]
impl ExchangeFeedAdapter for CoinbaseAdapter {
    fn exchange_code(&self) -> &'static str {
        COINBASE_CODE
    }

    async fn connect(&mut self) -> Result<(), FeedError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let handler = self.message_handler();
        let connection = FeedConnection::open(
            COINBASE_CODE,
            endpoint_or(&self.config, COINBASE_WS_URL),
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
        let connection = self.connection.as_ref().ok_or(FeedError::NotConnected {
            exchange: COINBASE_CODE,
        })?;
        let message = subscribe_message("matches", symbol);
        self.replay.lock().push(message.clone());
        connection.send(message).await?;
        self.record_symbol(symbol);
        Ok(())
    }

    async fn subscribe_level2(&mut self, symbol: &str) -> Result<(), FeedError> {
        let connection = self.connection.as_ref().ok_or(FeedError::NotConnected {
            exchange: COINBASE_CODE,
        })?;
        let message = subscribe_message("ticker", symbol);
        self.replay.lock().push(message.clone());
        connection.send(message).await?;
        self.record_symbol(symbol);
        Ok(())
    }

    async fn unsubscribe(&mut self, symbol: &str) -> Result<(), FeedError> {
        let connection = self.connection.as_ref().ok_or(FeedError::NotConnected {
            exchange: COINBASE_CODE,
        })?;
        let quoted = format!("\"{}\"", symbol);
        self.replay.lock().retain(|message| !message.contains(&quoted));
        connection.send(unsubscribe_message(symbol)).await?;
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
