//! Market-data gateway server: bridges exchange WebSocket feeds onto the
//! binary TCP protocol spoken by trading clients.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;
use tokio::sync::Mutex;

use market_gateway::acceptor::ConnectionAcceptor;
use market_gateway::cli::ArgParser;
use market_gateway::config::GatewayConfig;
use market_gateway::dispatcher::BroadcastDispatcher;
use market_gateway::exchange::FeedManager;
use market_gateway::factory::ExchangeFeedFactory;
use market_gateway::gateway::Gateway;
use market_gateway::session::SessionRegistry;
use market_gateway::subscription::SubscriptionIndex;


const USAGE_MESSAGE: &str = "Usage: server [config.json] [port]";


#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init().unwrap();
    let mut arg_parser = ArgParser::new(env::args(), USAGE_MESSAGE);
    let mut config = match arg_parser.extract_optional() {
        Some(path) => GatewayConfig::load(&path)?,
        None => GatewayConfig::default(),
    };
    config.listen_port = arg_parser.extract_port(config.listen_port);

    let registry = Arc::new(SessionRegistry::new());
    let index = Arc::new(SubscriptionIndex::new());
    let dispatcher = Arc::new(BroadcastDispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&index),
    ));

    let mut adapters = Vec::new();
    for exchange_config in &config.exchanges {
        match ExchangeFeedFactory::create(exchange_config) {
            Ok(adapter) => adapters.push(adapter),
            Err(error) => error!("{}", error),
        }
    }
    let mut feeds = FeedManager::new(adapters);
    let trade_dispatcher = Arc::clone(&dispatcher);
    let level2_dispatcher = Arc::clone(&dispatcher);
    feeds.set_callbacks(
        Arc::new(move |trade| trade_dispatcher.on_trade(&trade)),
        Arc::new(move |level2| level2_dispatcher.on_level2(&level2)),
    );
    let connected = feeds.connect_all().await;
    info!(
        "{} exchange feed(s) connected: {:?}",
        connected,
        feeds.active_exchanges()
    );
    let feeds = Arc::new(Mutex::new(feeds));

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&registry),
        Arc::clone(&index),
        Arc::clone(&feeds),
        Duration::from_secs(config.heartbeat_interval_secs),
    ));
    let acceptor =
        ConnectionAcceptor::new(Arc::clone(&gateway), config.listen_port, config.max_clients);
    acceptor.start().await?;
    let heartbeat = gateway
        .spawn_heartbeat_monitor(acceptor.shutdown_signal().expect("acceptor just started"));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    acceptor.stop().await;
    let _ = heartbeat.await;
    feeds.lock().await.shutdown().await;
    info!("gateway shutdown complete");
    Ok(())
}
