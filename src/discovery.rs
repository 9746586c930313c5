//! Market discovery: periodic REST enumeration of live contracts feeding
//! metadata and the desired subscription set into the stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Timelike, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exchange::{ExchangeClient, ExchangeStream};
use crate::models::Market;

/// 15-minute contracts roll at :00/:15/:30/:45; discovery tightens up around
/// those boundaries so new contracts are picked up within seconds.
fn discovery_period(utc_minute: u32) -> Duration {
    let m = utc_minute % 15;
    if m <= 1 || m >= 13 {
        Duration::from_secs(5)
    } else {
        Duration::from_secs(30)
    }
}

pub struct Discovery {
    client: Arc<ExchangeClient>,
    stream: Arc<ExchangeStream>,
    series: String,
}

impl Discovery {
    pub fn new(client: Arc<ExchangeClient>, stream: Arc<ExchangeStream>, series: &str) -> Self {
        Self {
            client,
            stream,
            series: series.to_string(),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.pass().await;

        loop {
            let period = discovery_period(Utc::now().minute());
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep(period) => self.pass().await,
            }
        }
    }

    /// One discovery pass. Fetch errors are logged and skipped; a pass that
    /// finds nothing leaves the current subscriptions alone.
    async fn pass(&self) {
        let mut all: Vec<Market> = Vec::new();

        match self.client.markets(&self.series, "open").await {
            Ok(markets) => all.extend(markets),
            Err(e) => debug!(err = %e, "discover: open market fetch failed"),
        }
        match self.client.markets(&self.series, "closed").await {
            Ok(markets) => all.extend(markets),
            Err(e) => debug!(err = %e, "discover: closed market fetch failed"),
        }

        if all.is_empty() {
            return;
        }

        self.stream.update_metadata(&all);

        let tickers: Vec<String> = all.iter().map(|m| m.ticker.clone()).collect();
        self.stream.reconcile(&tickers).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_tightens_near_rotation() {
        // Minutes 0, 1, 13, 14 of each quarter-hour are boundary-adjacent.
        for minute in [0, 1, 13, 14, 15, 16, 28, 29, 30, 44, 59] {
            assert_eq!(discovery_period(minute), Duration::from_secs(5), "minute {minute}");
        }
    }

    #[test]
    fn test_period_relaxed_mid_window() {
        for minute in [2, 5, 7, 10, 12, 17, 37, 52] {
            assert_eq!(
                discovery_period(minute),
                Duration::from_secs(30),
                "minute {minute}"
            );
        }
    }
}
