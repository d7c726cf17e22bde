//! Construction of exchange feed adapters from configuration entries.

use log::info;

use crate::binance::BinanceAdapter;
use crate::coinbase::CoinbaseAdapter;
use crate::core::{ExchangeConfig, FeedError};
use crate::exchange::ExchangeFeedAdapter;


pub struct ExchangeFeedFactory;

impl ExchangeFeedFactory {
    /// Build the adapter for a configured exchange. Names are matched
    /// case-insensitively; an unrecognized name is an explicit error, never
    /// a silent fallback.
    pub fn create(config: &ExchangeConfig) -> Result<Box<dyn ExchangeFeedAdapter>, FeedError> {
        info!("creating feed adapter for exchange {}", config.name);
        match config.name.to_lowercase().as_str() {
            "coinbase" => Ok(Box::new(CoinbaseAdapter::new(config.clone()))),
            "binance" => Ok(Box::new(BinanceAdapter::new(config.clone()))),
            _ => Err(FeedError::UnsupportedExchange(config.name.clone())),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ExchangeConfig {
        ExchangeConfig {
            name: name.to_string(),
            endpoint: String::new(),
            requires_auth: false,
        }
    }

    #[test]
    fn test_unknown_exchange_is_rejected() {
        match ExchangeFeedFactory::create(&config("unknown-exchange")) {
            Err(FeedError::UnsupportedExchange(name)) => {
                assert_eq!(name, "unknown-exchange");
            }
            other => panic!("expected UnsupportedExchange, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_names_match_case_insensitively() {
        let adapter = ExchangeFeedFactory::create(&config("Coinbase")).unwrap();
        assert_eq!(adapter.exchange_code(), "coinbase");
        let adapter = ExchangeFeedFactory::create(&config("BINANCE")).unwrap();
        assert_eq!(adapter.exchange_code(), "binance");
    }

    #[tokio::test]
    async fn test_subscribing_before_connect_fails() {
        let mut adapter = ExchangeFeedFactory::create(&config("coinbase")).unwrap();
        assert!(!adapter.is_connected());
        match adapter.subscribe_trades("BTC-USD").await {
            Err(FeedError::NotConnected { exchange }) => assert_eq!(exchange, "coinbase"),
            other => panic!("expected NotConnected, got {:?}", other),
        }
        assert!(adapter.subscribed_symbols().is_empty());
    }
}
