//! Bitstamp BTC/USD order-book feed.
//!
//! Bitstamp has no top-of-book ticker channel, so the mid is taken from the
//! first level of each side of the live order book.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FeedState, SpotFeed, HANDSHAKE_TIMEOUT, RECONNECT_DELAY};

const WS_URL: &str = "wss://ws.bitstamp.net";

const READ_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct BitstampFeed {
    state: FeedState,
}

impl BitstampFeed {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BookData {
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default)]
    asks: Vec<Vec<String>>,
}

enum Parsed {
    Mid(f64),
    Event(String),
    Skip,
}

fn parse_message(text: &str) -> Parsed {
    let Ok(env) = serde_json::from_str::<Envelope>(text) else {
        return Parsed::Skip;
    };

    if env.event == "bts:subscription_succeeded" || env.event == "bts:request_reconnect" {
        return Parsed::Event(env.event);
    }

    let Ok(book) = serde_json::from_value::<BookData>(env.data) else {
        return Parsed::Skip;
    };
    let (Some(best_bid), Some(best_ask)) = (book.bids.first(), book.asks.first()) else {
        return Parsed::Skip;
    };
    let (Some(bid), Some(ask)) = (
        best_bid.first().and_then(|s| s.parse::<f64>().ok()),
        best_ask.first().and_then(|s| s.parse::<f64>().ok()),
    ) else {
        return Parsed::Skip;
    };

    Parsed::Mid((bid + ask) / 2.0)
}

#[async_trait]
impl SpotFeed for BitstampFeed {
    fn name(&self) -> &'static str {
        "bitstamp"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            if let Err(e) = self.connect_and_stream(&shutdown).await {
                warn!(err = %e, "bitstamp ws disconnected");
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep(RECONNECT_DELAY) => info!("bitstamp reconnecting..."),
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

impl BitstampFeed {
    async fn connect_and_stream(&self, shutdown: &CancellationToken) -> Result<()> {
        let (ws, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(WS_URL))
            .await
            .context("handshake timed out")?
            .context("dial failed")?;
        let (mut write, mut read) = ws.split();

        let sub = serde_json::json!({
            "event": "bts:subscribe",
            "data": { "channel": "order_book_btcusd" },
        });
        write.send(Message::Text(sub.to_string())).await?;
        info!("bitstamp subscribed");

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
                Message::Text(text) => match parse_message(&text) {
                    Parsed::Mid(mid) => self.state.set_price(mid),
                    Parsed::Event(event) => debug!(event, "bitstamp event"),
                    Parsed::Skip => {}
                },
                Message::Ping(payload) => {
                    write.send(Message::Pong(payload)).await?;
                }
                Message::Close(_) => bail!("closed by server"),
                _ => {}
            }
        }
    }
}
