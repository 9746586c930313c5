//! Once-per-second snapshot assembly.

pub mod watchdog;
pub mod writer;

pub use watchdog::{CollectorHealth, Watchdog};
pub use writer::{compress_stale_files, Writer};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::exchange::{ExchangeClient, ExchangeStream};
use crate::feeds::{ReferenceIndex, SpotFeed};
use crate::models::{Market, MarketSnap, TickRecord};

/// Samples the reference index, merges stream state and writes one record
/// per second. Holds no state of its own beyond the shared health counters.
pub struct Collector {
    client: Arc<ExchangeClient>,
    stream: Arc<ExchangeStream>,
    reference: Arc<ReferenceIndex>,
    feeds: Vec<Arc<dyn SpotFeed>>,
    writer: Arc<Writer>,
    series: String,
    health: Arc<CollectorHealth>,
}

impl Collector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ExchangeClient>,
        stream: Arc<ExchangeStream>,
        reference: Arc<ReferenceIndex>,
        feeds: Vec<Arc<dyn SpotFeed>>,
        writer: Arc<Writer>,
        series: &str,
        health: Arc<CollectorHealth>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            stream,
            reference,
            feeds,
            writer,
            series: series.to_string(),
            health,
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    // Each tick runs in its own task so a panic surfaces as
                    // a join error and costs only that tick.
                    let collector = self.clone();
                    if let Err(e) = tokio::spawn(async move { collector.tick().await }).await {
                        error!(panic = %e, "tick panic recovered");
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let now = Utc::now();
        let brti = self.reference.snapshot();
        self.reference.record_sample();

        let (mut coinbase, mut kraken, mut bitstamp) = (0.0, 0.0, 0.0);
        for f in &self.feeds {
            match f.name() {
                "coinbase" => coinbase = f.mid_price(),
                "kraken" => kraken = f.mid_price(),
                "bitstamp" => bitstamp = f.mid_price(),
                _ => {}
            }
        }

        // Stream snapshot when live, REST fallback otherwise.
        let markets = if self.stream.is_connected() {
            self.stream.snapshot()
        } else {
            self.rest_fallback().await
        };

        let record = TickRecord {
            kind: "tick".to_string(),
            ts: format_ts(now),
            brti,
            coinbase,
            kraken,
            bitstamp,
            markets,
        };

        match self.writer.write(&record) {
            Ok(()) => self.health.record_write(),
            Err(e) => warn!(err = %e, "tick: write failed"),
        }
    }

    /// Direct REST snapshot, used while the stream is down. No book depth.
    async fn rest_fallback(&self) -> Vec<MarketSnap> {
        let mut all: Vec<Market> = Vec::new();

        match self.client.markets(&self.series, "open").await {
            Ok(markets) => all.extend(markets),
            Err(e) => debug!(err = %e, "tick: open market fetch failed"),
        }
        match self.client.markets(&self.series, "closed").await {
            Ok(markets) => all.extend(markets),
            Err(e) => debug!(err = %e, "tick: closed market fetch failed"),
        }

        fallback_snaps(&all, Utc::now())
    }
}

fn format_ts(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn fallback_snaps(markets: &[Market], now: DateTime<Utc>) -> Vec<MarketSnap> {
    markets
        .iter()
        .map(|m| MarketSnap {
            ticker: m.ticker.clone(),
            yes_bid: m.yes_bid,
            yes_ask: m.yes_ask,
            last_price: m.last_price,
            volume: m.volume,
            open_interest: m.open_interest,
            strike: m.strike_price(),
            secs_left: m
                .expiration_parsed()
                .map(|e| (e - now).num_seconds().max(0))
                .unwrap_or(0),
            status: m.status.clone(),
            result: m.result.clone(),
            yes_book: None,
            no_book: None,
        })
        .collect()
}
