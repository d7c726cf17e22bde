//! Demo trading client: logs on, subscribes to a symbol and prints a number
//! of market data updates.

use std::env;

use log::{info, LevelFilter};
use simple_logger::SimpleLogger;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use market_gateway::cli::ArgParser;
use market_gateway::codec::{
    peek_frame_len, LogonRequest, LogonStatus, MarketDataRequest, Message, SubscriptionAction,
    PROTOCOL_VERSION,
};


const USAGE_MESSAGE: &str = "Usage: client <symbol> [#updates] [port]";
const DEFAULT_SERVER_PORT: u16 = 11099;


async fn read_message(
    stream: &mut TcpStream,
    buffer: &mut Vec<u8>,
) -> Result<Message, Box<dyn std::error::Error>> {
    loop {
        if let Some(frame_len) = peek_frame_len(buffer) {
            if buffer.len() >= frame_len {
                let frame: Vec<u8> = buffer.drain(..frame_len).collect();
                return Ok(Message::decode(&frame)?);
            }
        }
        let mut chunk = [0u8; 1024];
        let count = stream.read(&mut chunk).await?;
        if count == 0 {
            return Err("server closed the connection".into());
        }
        buffer.extend_from_slice(&chunk[..count]);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init().unwrap();
    let mut arg_parser = ArgParser::new(env::args(), USAGE_MESSAGE);
    let symbol = arg_parser.extract_required("symbol");
    let update_num = arg_parser.extract_update_num();
    let port = arg_parser.extract_port(DEFAULT_SERVER_PORT);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let mut buffer = Vec::new();

    let logon = Message::LogonRequest(LogonRequest {
        protocol_version: PROTOCOL_VERSION,
        username: format!("client-{}", std::process::id()),
        password: "demo".to_string(),
        general_text: "market-gateway demo client".to_string(),
    });
    stream.write_all(&logon.encode()).await?;
    match read_message(&mut stream, &mut buffer).await? {
        Message::LogonResponse(response) => {
            if response.result != LogonStatus::Success {
                return Err(format!("logon rejected: {}", response.result_text).into());
            }
            info!("logged on: {}", response.result_text);
        }
        other => return Err(format!("unexpected message {:?}", other).into()),
    }

    let subscribe = Message::MarketDataRequest(MarketDataRequest {
        action: SubscriptionAction::Subscribe,
        symbol_id: 1,
        symbol: symbol.clone(),
    });
    stream.write_all(&subscribe.encode()).await?;
    info!("subscribed to {}, waiting for {} updates", symbol, update_num);

    let mut received = 0usize;
    while received < update_num {
        match read_message(&mut stream, &mut buffer).await? {
            Message::MarketDataUpdateTrade(update) => {
                received += 1;
                info!(
                    "trade  symbol {} price {} volume {} ts {}",
                    update.symbol_id, update.price, update.volume, update.timestamp
                );
            }
            Message::MarketDataUpdateBidAsk(update) => {
                received += 1;
                info!(
                    "quote  symbol {} bid {} x {} | ask {} x {}",
                    update.symbol_id,
                    update.bid_price,
                    update.bid_quantity,
                    update.ask_price,
                    update.ask_quantity
                );
            }
            Message::Heartbeat => {
                // Answer heartbeats so the server's idle monitor keeps the
                // session alive.
                stream.write_all(&Message::Heartbeat.encode()).await?;
            }
            other => info!("received {:?}", other),
        }
    }

    let unsubscribe = Message::MarketDataRequest(MarketDataRequest {
        action: SubscriptionAction::Unsubscribe,
        symbol_id: 1,
        symbol,
    });
    stream.write_all(&unsubscribe.encode()).await?;
    info!("done");
    Ok(())
}
