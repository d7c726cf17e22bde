//! Gateway configuration, loaded from a JSON file.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::core::ExchangeConfig;


const DEFAULT_LISTEN_PORT: u16 = 11099;
const DEFAULT_MAX_CLIENTS: usize = 100;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_port: u16,
    pub max_clients: usize,
    pub heartbeat_interval_secs: u64,
    pub exchanges: Vec<ExchangeConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            exchanges: vec![ExchangeConfig {
                name: "coinbase".to_string(),
                endpoint: String::new(),
                requires_auth: false,
            }],
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(config.heartbeat_interval_secs, DEFAULT_HEARTBEAT_INTERVAL_SECS);
        assert_eq!(config.exchanges.len(), 1);
    }

    #[test]
    fn test_parse_with_partial_fields() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "listen_port": 12000,
                "exchanges": [
                    {"name": "coinbase"},
                    {"name": "binance", "endpoint": "wss://example.test/ws", "requires_auth": true}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.listen_port, 12000);
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(config.exchanges.len(), 2);
        assert_eq!(config.exchanges[0].name, "coinbase");
        assert!(config.exchanges[0].endpoint.is_empty());
        assert_eq!(config.exchanges[1].endpoint, "wss://example.test/ws");
        assert!(config.exchanges[1].requires_auth);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(matches!(
            GatewayConfig::load("/nonexistent/gateway.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
