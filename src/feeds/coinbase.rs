//! Coinbase Exchange BTC-USD ticker feed.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{FeedState, SpotFeed, HANDSHAKE_TIMEOUT, RECONNECT_DELAY};

const WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

/// Coinbase pushes ticker updates on every trade; a quiet read window this
/// long means the connection is dead.
const READ_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct CoinbaseFeed {
    state: FeedState,
}

impl CoinbaseFeed {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize)]
struct Ticker {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    best_bid: String,
    #[serde(default)]
    best_ask: String,
}

/// Extract the mid-price from one ticker message, if it is one.
fn parse_ticker(text: &str) -> Option<f64> {
    let t: Ticker = serde_json::from_str(text).ok()?;
    if t.kind != "ticker" {
        return None;
    }
    let bid: f64 = t.best_bid.parse().ok()?;
    let ask: f64 = t.best_ask.parse().ok()?;
    Some((bid + ask) / 2.0)
}

#[async_trait]
impl SpotFeed for CoinbaseFeed {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            if let Err(e) = self.connect_and_stream(&shutdown).await {
                warn!(err = %e, "coinbase ws disconnected");
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep(RECONNECT_DELAY) => info!("coinbase reconnecting..."),
            }
        }
    }

    fn mid_price(&self) -> f64 {
        self.state.mid_price()
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.last_update()
    }

    fn is_stale(&self) -> bool {
        self.state.is_stale()
    }
}

impl CoinbaseFeed {
    async fn connect_and_stream(&self, shutdown: &CancellationToken) -> Result<()> {
        let (ws, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(WS_URL))
            .await
            .context("handshake timed out")?
            .context("dial failed")?;
        let (mut write, mut read) = ws.split();

        let sub = serde_json::json!({
            "type": "subscribe",
            "product_ids": ["BTC-USD"],
            "channels": ["ticker"],
        });
        write.send(Message::Text(sub.to_string())).await?;

        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = timeout(READ_DEADLINE, read.next()) => {
                    match msg.context("read deadline exceeded")? {
                        Some(m) => m.context("read failed")?,
                        None => bail!("stream ended"),
                    }
                }
            };

            match msg {
                Message::Text(text) => {
                    if let Some(mid) = parse_ticker(&text) {
                        self.state.set_price(mid);
                    }
                }
                Message::Ping(payload) => {
                    write.send(Message::Pong(payload)).await?;
                }
                Message::Close(_) => bail!("closed by server"),
                _ => {}
            }
        }
    }
}
