//! TCP listener lifecycle and per-connection read/write loops.
//!
//! The transport delivers an unstructured byte stream, so each connection
//! accumulates bytes until a full header is buffered, then until the header's
//! declared size is buffered, and only then hands the exact frame to the
//! codec. Any framing or decode error terminates that connection alone.
//!
//! Shutdown is a watch signal: `stop()` flips it, which unblocks the accept
//! wait and every connection's read and write loops, then waits for all
//! connection tasks to finish before returning.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::codec::{peek_frame_len, HEADER_LEN, MAX_FRAME_LEN};
use crate::gateway::Gateway;
use crate::session::{ClientSession, ClientState, SessionRegistry, OUTBOUND_QUEUE_LEN};


const READ_CHUNK_LEN: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AcceptorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error("acceptor is already running")]
    AlreadyRunning,
}

pub struct ConnectionAcceptor {
    gateway: Arc<Gateway>,
    listen_port: u16,
    max_clients: usize,
    state: Mutex<AcceptorState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionAcceptor {
    pub fn new(gateway: Arc<Gateway>, listen_port: u16, max_clients: usize) -> Self {
        Self {
            gateway,
            listen_port,
            max_clients,
            state: Mutex::new(AcceptorState::Stopped),
            shutdown: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting. Returns the bound port, which
    /// differs from the configured one when that was 0.
    pub async fn start(&self) -> Result<u16, AcceptorError> {
        {
            let mut state = self.state.lock();
            if *state != AcceptorState::Stopped {
                return Err(AcceptorError::AlreadyRunning);
            }
            *state = AcceptorState::Starting;
        }

        let listener = match TcpListener::bind(("0.0.0.0", self.listen_port)).await {
            Ok(listener) => listener,
            Err(source) => {
                *self.state.lock() = AcceptorState::Stopped;
                return Err(AcceptorError::Bind {
                    port: self.listen_port,
                    source,
                });
            }
        };
        let bound_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.listen_port);
        info!("listening on port {}", bound_port);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.gateway),
            self.max_clients,
            shutdown_rx,
        ));
        *self.accept_task.lock() = Some(task);
        *self.state.lock() = AcceptorState::Running;
        Ok(bound_port)
    }

    /// A receiver on the shutdown signal, for tasks that should stop with
    /// the acceptor. Only available while running.
    pub fn shutdown_signal(&self) -> Option<watch::Receiver<bool>> {
        self.shutdown.lock().as_ref().map(|sender| sender.subscribe())
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == AcceptorState::Running
    }

    /// Stop accepting, close every connection and wait for their tasks.
    /// Idempotent: calling on a stopped acceptor is a no-op.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != AcceptorState::Running {
                return;
            }
            *state = AcceptorState::Stopping;
        }
        info!("stopping acceptor");
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                error!("accept loop panicked: {}", error);
            }
        }
        *self.state.lock() = AcceptorState::Stopped;
        info!("acceptor stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    max_clients: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    if gateway.registry().count() >= max_clients {
                        warn!(
                            "refusing connection from {}: client limit {} reached",
                            remote_addr, max_clients
                        );
                        continue;
                    }
                    connections.spawn(handle_connection(
                        stream,
                        remote_addr,
                        Arc::clone(&gateway),
                        shutdown.clone(),
                    ));
                }
                Err(error) => error!("accept failed: {}", error),
            },
        }
    }
    // Closing the listener here unblocks nothing further; connections see
    // the same shutdown signal and drain on their own.
    drop(listener);
    if !connections.is_empty() {
        info!("waiting for {} connection task(s)", connections.len());
    }
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
) {
    let registry: &Arc<SessionRegistry> = gateway.registry();
    let (mut reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_LEN);
    let session = Arc::new(ClientSession::new(
        registry.next_session_id(),
        remote_addr,
        outbound_tx,
    ));
    registry.insert(Arc::clone(&session));
    info!("client {} connected from {}", session.id(), remote_addr);

    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, shutdown.clone()));

    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK_LEN);
    let mut chunk = [0u8; READ_CHUNK_LEN];
    'read: loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = session.wait_close() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(count) => {
                    buffer.extend_from_slice(&chunk[..count]);
                    while let Some(frame_len) = peek_frame_len(&buffer) {
                        if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&frame_len) {
                            error!(
                                "client {}: invalid frame length {}, closing",
                                session.id(),
                                frame_len
                            );
                            break 'read;
                        }
                        if buffer.len() < frame_len {
                            break;
                        }
                        let frame: Vec<u8> = buffer.drain(..frame_len).collect();
                        if let Err(error) = gateway.handle_frame(&session, &frame).await {
                            error!("client {}: {}, closing", session.id(), error);
                            break 'read;
                        }
                        if session.state() >= ClientState::Disconnecting {
                            break 'read;
                        }
                    }
                }
                Err(error) => {
                    error!("client {}: read failed: {}", session.id(), error);
                    break;
                }
            },
        }
    }

    gateway.on_disconnect(&session).await;
    if let Err(error) = writer_task.await {
        error!("client {}: writer task panicked: {}", session.id(), error);
    }
    info!("client {} disconnected", session.id());
}

/// Drain the outbound queue onto the socket. Ends when the session's queue
/// is closed, a write fails, or the server shuts down.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.shutdown().await;
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpStream;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::codec::{
        LogonRequest, LogonResponse, LogonStatus, MarketDataRequest, Message, SubscriptionAction,
        PROTOCOL_VERSION,
    };
    use crate::exchange::FeedManager;
    use crate::subscription::SubscriptionIndex;

    fn test_acceptor(max_clients: usize) -> (Arc<Gateway>, Arc<ConnectionAcceptor>) {
        let registry = Arc::new(SessionRegistry::new());
        let index = Arc::new(SubscriptionIndex::new());
        let feeds = Arc::new(AsyncMutex::new(FeedManager::new(Vec::new())));
        let gateway = Arc::new(Gateway::new(
            registry,
            index,
            feeds,
            Duration::from_secs(30),
        ));
        let acceptor = Arc::new(ConnectionAcceptor::new(Arc::clone(&gateway), 0, max_clients));
        (gateway, acceptor)
    }

    async fn read_message(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> Message {
        loop {
            if let Some(frame_len) = peek_frame_len(buffer) {
                if buffer.len() >= frame_len {
                    let frame: Vec<u8> = buffer.drain(..frame_len).collect();
                    return Message::decode(&frame).unwrap();
                }
            }
            let mut chunk = [0u8; 256];
            let count = timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .unwrap()
                .unwrap();
            assert!(count > 0, "connection closed while awaiting a frame");
            buffer.extend_from_slice(&chunk[..count]);
        }
    }

    async fn logon(stream: &mut TcpStream, buffer: &mut Vec<u8>, username: &str) {
        let frame = Message::LogonRequest(LogonRequest {
            protocol_version: PROTOCOL_VERSION,
            username: username.to_string(),
            password: "secret".to_string(),
            general_text: String::new(),
        })
        .encode();
        stream.write_all(&frame).await.unwrap();
        match read_message(stream, buffer).await {
            Message::LogonResponse(LogonResponse { result, .. }) => {
                assert_eq!(result, LogonStatus::Success)
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    async fn wait_for_count(gateway: &Gateway, expected: usize) {
        for _ in 0..100 {
            if gateway.registry().count() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "registry count never reached {} (is {})",
            expected,
            gateway.registry().count()
        );
    }

    #[tokio::test]
    async fn test_logon_and_subscribe_over_a_real_socket() {
        let (gateway, acceptor) = test_acceptor(8);
        let port = acceptor.start().await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buffer = Vec::new();
        logon(&mut stream, &mut buffer, "alice").await;

        // Split the subscribe frame across two writes to exercise the
        // incremental framing buffer.
        let frame = Message::MarketDataRequest(MarketDataRequest {
            action: SubscriptionAction::Subscribe,
            symbol_id: 1,
            symbol: "BTC-USD".to_string(),
        })
        .encode();
        stream.write_all(&frame[..5]).await.unwrap();
        stream.flush().await.unwrap();
        sleep(Duration::from_millis(20)).await;
        stream.write_all(&frame[5..]).await.unwrap();

        for _ in 0..100 {
            if gateway.index().resolve("BTC-USD").is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let symbol_id = gateway.index().resolve("BTC-USD").unwrap();
        assert_eq!(gateway.index().subscribers_of(symbol_id).len(), 1);

        acceptor.stop().await;
        wait_for_count(&gateway, 0).await;
    }

    #[tokio::test]
    async fn test_bad_frame_kills_only_its_own_connection() {
        let (gateway, acceptor) = test_acceptor(8);
        let port = acceptor.start().await.unwrap();

        let mut healthy = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut healthy_buffer = Vec::new();
        logon(&mut healthy, &mut healthy_buffer, "alice").await;

        let mut broken = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_count(&gateway, 2).await;
        // Header declares 2 bytes: below the minimum frame length.
        broken.write_all(&[0x02, 0x00, 0x01, 0x00]).await.unwrap();

        wait_for_count(&gateway, 1).await;
        let mut closed = [0u8; 16];
        let count = timeout(Duration::from_secs(5), broken.read(&mut closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 0);

        // The healthy connection still works.
        let frame = Message::Heartbeat.encode();
        healthy.write_all(&frame).await.unwrap();
        assert_eq!(gateway.registry().count(), 1);

        acceptor.stop().await;
    }

    #[tokio::test]
    async fn test_client_limit_is_enforced_at_accept() {
        let (gateway, acceptor) = test_acceptor(1);
        let port = acceptor.start().await.unwrap();

        let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut first_buffer = Vec::new();
        logon(&mut first, &mut first_buffer, "alice").await;

        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut closed = [0u8; 16];
        let count = timeout(Duration::from_secs(5), second.read(&mut closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(gateway.registry().count(), 1);

        acceptor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_unblocks_connections() {
        let (gateway, acceptor) = test_acceptor(8);
        let port = acceptor.start().await.unwrap();
        assert!(acceptor.is_running());
        assert!(matches!(
            acceptor.start().await,
            Err(AcceptorError::AlreadyRunning)
        ));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buffer = Vec::new();
        logon(&mut stream, &mut buffer, "alice").await;

        acceptor.stop().await;
        assert!(!acceptor.is_running());
        acceptor.stop().await;
        assert_eq!(gateway.registry().count(), 0);

        // The listener is gone after stop.
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
