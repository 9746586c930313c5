//! Environment-driven configuration.
//!
//! All settings come from the environment (with optional `.env` loading);
//! the CLI can override the output directory and series ticker.

use anyhow::{bail, Result};

const REST_PROD: &str = "https://api.elections.kalshi.com/trade-api/v2";
const REST_DEMO: &str = "https://demo-api.kalshi.co/trade-api/v2";
const WS_PROD: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";
const WS_DEMO: &str = "wss://demo-api.kalshi.co/trade-api/ws/v2";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key_id: String,
    pub priv_key_path: String,
    /// "prod" or "demo"
    pub env: String,
    pub output_dir: String,
    pub series_ticker: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = Self {
            api_key_id: std::env::var("API_KEY_ID").unwrap_or_default(),
            priv_key_path: env_or("PRIV_KEY_PATH", "./private_key.pem"),
            env: env_or("ENV", "prod"),
            output_dir: env_or("OUTPUT_DIR", "./data"),
            series_ticker: env_or("SERIES_TICKER", "KXBTC15M"),
        };

        if cfg.api_key_id.is_empty() {
            bail!("API_KEY_ID is required");
        }
        if cfg.env != "prod" && cfg.env != "demo" {
            bail!("ENV must be 'prod' or 'demo', got {:?}", cfg.env);
        }

        Ok(cfg)
    }

    pub fn rest_base_url(&self) -> &'static str {
        if self.env == "prod" {
            REST_PROD
        } else {
            REST_DEMO
        }
    }

    pub fn ws_url(&self) -> &'static str {
        if self.env == "prod" {
            WS_PROD
        } else {
            WS_DEMO
        }
    }

    /// Output file prefix, e.g. `kxbtc15m` for the default series.
    pub fn file_prefix(&self) -> String {
        self.series_ticker.to_lowercase()
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}
