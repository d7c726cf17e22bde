//! Common machinery for WebSocket exchange feed adapters.
//!
//! Each adapter owns one [FeedConnection]: a spawned task that drives the
//! WebSocket, answers pings, forwards text frames to the adapter's parser
//! and reconnects after a short delay when the connection drops, replaying
//! the adapter's subscribe messages. Adapters talk to the task through a
//! command channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

use crate::core::{ExchangeConfig, FeedError, MarketLevel2, MarketTrade};


/// Delay before trying reconnection.
const SLEEP_BEFORE_RECONNECT_MS: u64 = 200;

pub type TradeCallback = Arc<dyn Fn(MarketTrade) + Send + Sync>;
pub type Level2Callback = Arc<dyn Fn(MarketLevel2) + Send + Sync>;

/// Receives every text frame the exchange delivers.
pub type FeedMessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// One external exchange feed, polymorphic over the supported exchanges.
/// Subscribing requires a successful [`connect`](Self::connect) first.
#[async_trait]
pub trait ExchangeFeedAdapter: Send {
    fn exchange_code(&self) -> &'static str;

    async fn connect(&mut self) -> Result<(), FeedError>;
    async fn disconnect(&mut self);

    async fn subscribe_trades(&mut self, symbol: &str) -> Result<(), FeedError>;
    async fn subscribe_level2(&mut self, symbol: &str) -> Result<(), FeedError>;
    async fn unsubscribe(&mut self, symbol: &str) -> Result<(), FeedError>;

    fn set_trade_callback(&mut self, callback: TradeCallback);
    fn set_level2_callback(&mut self, callback: Level2Callback);

    fn is_connected(&self) -> bool;
    fn subscribed_symbols(&self) -> Vec<String>;
}

/// Callback targets shared between an adapter and its connection task.
/// Slots may be (re)assigned before or after connecting.
#[derive(Default)]
pub struct CallbackSlots {
    trade: Mutex<Option<TradeCallback>>,
    level2: Mutex<Option<Level2Callback>>,
}

impl CallbackSlots {
    pub fn set_trade(&self, callback: TradeCallback) {
        *self.trade.lock() = Some(callback);
    }

    pub fn set_level2(&self, callback: Level2Callback) {
        *self.level2.lock() = Some(callback);
    }

    pub fn emit_trade(&self, trade: MarketTrade) {
        let callback = self.trade.lock().clone();
        if let Some(callback) = callback {
            callback(trade);
        }
    }

    pub fn emit_level2(&self, level2: MarketLevel2) {
        let callback = self.level2.lock().clone();
        if let Some(callback) = callback {
            callback(level2);
        }
    }
}

/// Commands from an adapter to its connection task.
enum FeedCommand {
    /// Send a text frame to the exchange.
    Send(String),
    /// Close the connection and exit the task.
    Close,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live WebSocket connection to one exchange, owned by a spawned task.
pub struct FeedConnection {
    exchange_code: &'static str,
    command_sender: mpsc::Sender<FeedCommand>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FeedConnection {
    /// Connect to `ws_url` and spawn the processing task.
    ///
    /// `replay` holds the subscribe messages to re-issue after a reconnect;
    /// the adapter keeps it up to date as symbols come and go. `handler`
    /// receives every text frame.
    pub async fn open(
        exchange_code: &'static str,
        ws_url: String,
        replay: Arc<Mutex<Vec<String>>>,
        handler: FeedMessageHandler,
    ) -> Result<FeedConnection, FeedError> {
        info!("connecting to {} at {}", exchange_code, ws_url);
        let (ws, _response) = connect_async(ws_url.as_str())
            .await
            .map_err(|error| FeedError::Connection {
                exchange: exchange_code,
                reason: error.to_string(),
            })?;
        info!("connected to {}", exchange_code);

        let (command_sender, command_receiver) = mpsc::channel::<FeedCommand>(16);
        let connected = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(Self::process_stream(
            exchange_code,
            ws_url,
            ws,
            replay,
            handler,
            command_receiver,
            Arc::clone(&connected),
        ));
        Ok(FeedConnection {
            exchange_code,
            command_sender,
            connected,
            task,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue a text frame for the exchange.
    pub async fn send(&self, text: String) -> Result<(), FeedError> {
        self.command_sender
            .send(FeedCommand::Send(text))
            .await
            .map_err(|_| FeedError::NotConnected {
                exchange: self.exchange_code,
            })
    }

    /// Close the connection and wait for the task to finish.
    pub async fn close(self) {
        if self.command_sender.send(FeedCommand::Close).await.is_err() {
            debug!("{} connection task already gone", self.exchange_code);
        }
        let _ = self.task.await;
    }

    /// Internal loop reading from the exchange WebSocket. Handles pings,
    /// forwards text frames to `handler` and reconnects on connection loss,
    /// replaying the recorded subscribe messages.
    async fn process_stream(
        exchange_code: &'static str,
        ws_url: String,
        initial_ws: WsStream,
        replay: Arc<Mutex<Vec<String>>>,
        handler: FeedMessageHandler,
        mut command_receiver: mpsc::Receiver<FeedCommand>,
        connected: Arc<AtomicBool>,
    ) {
        let mut ws = Some(initial_ws);
        'connection: loop {
            let mut stream = match ws.take() {
                Some(stream) => stream,
                None => {
                    match connect_async(ws_url.as_str()).await {
                        Ok((stream, _response)) => {
                            info!("reconnected to {}", exchange_code);
                            stream
                        }
                        Err(error) => {
                            error!("reconnection to {} failed: {}", exchange_code, error);
                            sleep(Duration::from_millis(SLEEP_BEFORE_RECONNECT_MS)).await;
                            // Drain a pending close so shutdown is not lost
                            // while the exchange is unreachable.
                            if let Ok(FeedCommand::Close) = command_receiver.try_recv() {
                                break 'connection;
                            }
                            continue;
                        }
                    }
                }
            };
            connected.store(true, Ordering::Release);

            let pending = { replay.lock().clone() };
            for message in pending {
                if stream.send(Message::Text(message)).await.is_err() {
                    error!("resubscription on {} failed", exchange_code);
                    connected.store(false, Ordering::Release);
                    sleep(Duration::from_millis(SLEEP_BEFORE_RECONNECT_MS)).await;
                    continue 'connection;
                }
            }

            loop {
                tokio::select! {
                    command = command_receiver.recv() => match command {
                        Some(FeedCommand::Send(text)) => {
                            if stream.send(Message::Text(text)).await.is_err() {
                                error!("send to {} failed", exchange_code);
                                break;
                            }
                        }
                        Some(FeedCommand::Close) | None => {
                            info!("disconnecting exchange {}", exchange_code);
                            let _ = stream.close(None).await;
                            break 'connection;
                        }
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => handler(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            if stream.send(Message::Pong(payload)).await.is_err() {
                                warn!("pong to {} failed", exchange_code);
                                break;
                            }
                        }
                        Some(Ok(other)) => {
                            debug!("ignoring {} frame from {}", other_kind(&other), exchange_code)
                        }
                        Some(Err(error)) => {
                            error!("connection to {} lost: {}", exchange_code, error);
                            break;
                        }
                        None => {
                            error!("connection to {} closed", exchange_code);
                            break;
                        }
                    },
                }
            }

            connected.store(false, Ordering::Release);
            info!(
                "retrying {} in {}ms",
                exchange_code, SLEEP_BEFORE_RECONNECT_MS
            );
            sleep(Duration::from_millis(SLEEP_BEFORE_RECONNECT_MS)).await;
        }
        connected.store(false, Ordering::Release);
    }
}

fn other_kind(message: &Message) -> &'static str {
    match message {
        Message::Binary(_) => "binary",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        _ => "other",
    }
}

/// Owns every configured exchange adapter and the dynamic symbol
/// subscriptions driven by client interest. A feed that fails to connect is
/// logged and left inactive; the rest keep serving.
pub struct FeedManager {
    adapters: Vec<Box<dyn ExchangeFeedAdapter>>,
}

impl FeedManager {
    pub fn new(adapters: Vec<Box<dyn ExchangeFeedAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn set_callbacks(&mut self, on_trade: TradeCallback, on_level2: Level2Callback) {
        for adapter in &mut self.adapters {
            adapter.set_trade_callback(Arc::clone(&on_trade));
            adapter.set_level2_callback(Arc::clone(&on_level2));
        }
    }

    /// Connect every adapter, returning how many came up.
    pub async fn connect_all(&mut self) -> usize {
        let mut connected = 0;
        for adapter in &mut self.adapters {
            match adapter.connect().await {
                Ok(()) => connected += 1,
                Err(error) => {
                    error!("exchange {} marked inactive: {}", adapter.exchange_code(), error)
                }
            }
        }
        connected
    }

    /// Make sure every connected feed is delivering `symbol`.
    pub async fn ensure_symbol(&mut self, symbol: &str) {
        for adapter in &mut self.adapters {
            if !adapter.is_connected() {
                continue;
            }
            if adapter.subscribed_symbols().iter().any(|s| s == symbol) {
                continue;
            }
            if let Err(error) = adapter.subscribe_trades(symbol).await {
                warn!("{}", error);
                continue;
            }
            if let Err(error) = adapter.subscribe_level2(symbol).await {
                warn!("{}", error);
            }
        }
    }

    /// Stop delivery of `symbol` on every feed; called when its last
    /// subscriber is gone.
    pub async fn release_symbol(&mut self, symbol: &str) {
        for adapter in &mut self.adapters {
            if adapter.subscribed_symbols().iter().any(|s| s == symbol) {
                if let Err(error) = adapter.unsubscribe(symbol).await {
                    warn!("{}", error);
                }
            }
        }
    }

    pub fn active_exchanges(&self) -> Vec<&'static str> {
        self.adapters
            .iter()
            .filter(|adapter| adapter.is_connected())
            .map(|adapter| adapter.exchange_code())
            .collect()
    }

    pub async fn shutdown(&mut self) {
        for adapter in &mut self.adapters {
            adapter.disconnect().await;
        }
    }
}

/// Default endpoint for an exchange, honoring a configured override.
pub fn endpoint_or(config: &ExchangeConfig, default_url: &str) -> String {
    if config.endpoint.is_empty() {
        default_url.to_string()
    } else {
        config.endpoint.clone()
    }
}
