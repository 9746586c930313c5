//! Kraken BTC/USD ticker feed (WebSocket API v2).

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

const WS_URL: &str = "wss://ws.kraken.com/v2";

/// Kraken sends heartbeats, so the read window can be generous.
const READ_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct KrakenFeed {
    state: FeedState,
}

impl KrakenFeed {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: Vec<TickerData>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(default)]
    bid: f64,
    #[serde(default)]
    ask: f64,
}

fn parse_ticker(text: &str) -> Option<f64> {
    let env: Envelope = serde_json::from_str(text).ok()?;
    if env.channel != "ticker" {
        return None;
    }
    let t = env.data.first()?;
    if t.bid <= 0.0 || t.ask <= 0.0 {
        return None;
    }
    Some((t.bid + t.ask) / 2.0)
}

#[async_trait]
impl SpotFeed for KrakenFeed {
    fn name(&self) -> &'static str {
        "kraken"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            if let Err(e) = self.connect_and_stream(&shutdown).await {
                warn!(err = %e, "kraken ws disconnected");
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep(RECONNECT_DELAY) => info!("kraken reconnecting..."),
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

impl KrakenFeed {
    async fn connect_and_stream(&self, shutdown: &CancellationToken) -> Result<()> {
        let (ws, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(WS_URL))
            .await
            .context("handshake timed out")?
            .context("dial failed")?;
        let (mut write, mut read) = ws.split();

        let sub = serde_json::json!({
            "method": "subscribe",
            "params": { "channel": "ticker", "symbol": ["BTC/USD"] },
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
