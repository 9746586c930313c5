//! Spot-exchange price feeds and the BRTI reference index.
//!
//! Each feed keeps one streaming connection to one exchange and exposes a
//! freshness-tracked mid-price. The reference index aggregates non-stale
//! feeds into a median, standing in for the index the contracts settle
//! against.

pub mod bitstamp;
pub mod coinbase;
pub mod kraken;

pub use bitstamp::BitstampFeed;
pub use coinbase::CoinbaseFeed;
pub use kraken::KrakenFeed;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// A feed is stale once its latest update is older than this.
pub const STALE_AFTER_SECS: i64 = 5;

/// Pause between reconnect attempts.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Bound on DNS + TCP + TLS + upgrade for a single connection attempt.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Uniform capability over one spot exchange connection.
#[async_trait]
pub trait SpotFeed: Send + Sync {
    fn name(&self) -> &'static str;

    /// Maintain the connection until the token is cancelled.
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;

    fn mid_price(&self) -> f64;
    fn last_update(&self) -> Option<DateTime<Utc>>;
    fn is_stale(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
struct Quote {
    mid: f64,
    last_update: Option<DateTime<Utc>>,
}

/// Shared `(mid, last_update)` pair behind a read/write lock. Only the
/// owning feed's reader task writes; anyone may read.
#[derive(Debug, Default)]
pub struct FeedState {
    inner: RwLock<Quote>,
}

impl FeedState {
    /// Publish a new mid-price. NaN and non-positive values are rejected
    /// without touching state.
    pub fn set_price(&self, mid: f64) {
        if !mid.is_finite() || mid <= 0.0 {
            return;
        }
        let mut q = self.inner.write();
        q.mid = mid;
        q.last_update = Some(Utc::now());
    }

    pub fn mid_price(&self) -> f64 {
        self.inner.read().mid
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_update
    }

    pub fn is_stale(&self) -> bool {
        match self.inner.read().last_update {
            None => true,
            Some(t) => (Utc::now() - t).num_seconds() > STALE_AFTER_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimedPrice {
    pub time: DateTime<Utc>,
    pub price: f64,
}

#[derive(Debug, Clone)]
pub struct FeedHealth {
    pub name: &'static str,
    pub price: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub stale: bool,
}

const HISTORY_LEN: usize = 900;

#[derive(Debug)]
struct IndexState {
    price: f64,
    history: Vec<Option<TimedPrice>>,
    history_idx: usize,
    history_full: bool,
    settlement_ticks: Vec<f64>,
    sampling: bool,
}

/// Median-of-feeds reference value ("BRTI proxy").
///
/// When no feed is fresh the last computed value is returned, so short
/// outages do not zero the output column.
pub struct ReferenceIndex {
    feeds: Vec<Arc<dyn SpotFeed>>,
    inner: Mutex<IndexState>,
}

impl ReferenceIndex {
    pub fn new(feeds: Vec<Arc<dyn SpotFeed>>) -> Self {
        Self {
            feeds,
            inner: Mutex::new(IndexState {
                price: 0.0,
                history: vec![None; HISTORY_LEN],
                history_idx: 0,
                history_full: false,
                settlement_ticks: Vec::new(),
                sampling: false,
            }),
        }
    }

    /// Median of currently non-stale, positive mid-prices.
    pub fn snapshot(&self) -> f64 {
        let mut prices: Vec<f64> = self
            .feeds
            .iter()
            .filter(|f| !f.is_stale())
            .map(|f| f.mid_price())
            .filter(|p| *p > 0.0)
            .collect();

        if prices.is_empty() {
            return self.inner.lock().price;
        }

        prices.sort_by(|a, b| a.total_cmp(b));
        let m = median(&prices);
        self.inner.lock().price = m;
        m
    }

    /// Append the current snapshot to the ring buffer of timed prices.
    pub fn record_sample(&self) {
        let p = self.snapshot();
        if p <= 0.0 {
            return;
        }

        let mut s = self.inner.lock();
        let idx = s.history_idx;
        s.history[idx] = Some(TimedPrice {
            time: Utc::now(),
            price: p,
        });
        s.history_idx += 1;
        if s.history_idx >= HISTORY_LEN {
            s.history_idx = 0;
            s.history_full = true;
        }
    }

    /// The most recent `n` recorded prices, oldest first.
    pub fn price_history(&self, n: usize) -> Vec<f64> {
        let s = self.inner.lock();
        let total = if s.history_full {
            HISTORY_LEN
        } else {
            s.history_idx
        };
        let n = n.min(total);

        (0..n)
            .filter_map(|i| {
                let idx = (s.history_idx + HISTORY_LEN - n + i) % HISTORY_LEN;
                s.history[idx].map(|tp| tp.price)
            })
            .collect()
    }

    /// Begin recording per-second ticks for a contract's final minute.
    pub fn start_settlement_window(&self) {
        let mut s = self.inner.lock();
        s.settlement_ticks = Vec::with_capacity(60);
        s.sampling = true;
        tracing::info!("settlement window started");
    }

    pub fn record_settlement_tick(&self) {
        let p = self.snapshot();
        if p <= 0.0 {
            return;
        }
        let mut s = self.inner.lock();
        if s.sampling {
            s.settlement_ticks.push(p);
            tracing::debug!(k = s.settlement_ticks.len(), price = p, "settlement tick");
        }
    }

    pub fn settlement_ticks(&self) -> Vec<f64> {
        self.inner.lock().settlement_ticks.clone()
    }

    pub fn settlement_average(&self) -> f64 {
        let s = self.inner.lock();
        if s.settlement_ticks.is_empty() {
            return 0.0;
        }
        s.settlement_ticks.iter().sum::<f64>() / s.settlement_ticks.len() as f64
    }

    pub fn is_sampling(&self) -> bool {
        self.inner.lock().sampling
    }

    pub fn stop_settlement_window(&self) {
        self.inner.lock().sampling = false;
    }

    /// Last computed value without recomputing.
    pub fn price(&self) -> f64 {
        self.inner.lock().price
    }

    pub fn feed_status(&self) -> Vec<FeedHealth> {
        self.feeds
            .iter()
            .map(|f| FeedHealth {
                name: f.name(),
                price: f.mid_price(),
                last_update: f.last_update(),
                stale: f.is_stale(),
            })
            .collect()
    }
}

/// Median of a sorted, non-empty slice: middle value for odd counts, mean of
/// the two centre values for even counts.
fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubFeed {
        name: &'static str,
        state: FeedState,
        stale: std::sync::atomic::AtomicBool,
    }

    impl StubFeed {
        fn fresh(name: &'static str, price: f64) -> Arc<Self> {
            let feed = Arc::new(Self {
                name,
                state: FeedState::default(),
                stale: std::sync::atomic::AtomicBool::new(false),
            });
            feed.state.set_price(price);
            feed
        }

        fn set_stale(&self, stale: bool) {
            self.stale.store(stale, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SpotFeed for StubFeed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _shutdown: CancellationToken) -> Result<()> {
            Ok(())
        }

        fn mid_price(&self) -> f64 {
            self.state.mid_price()
        }

        fn last_update(&self) -> Option<DateTime<Utc>> {
            self.state.last_update()
        }

        fn is_stale(&self) -> bool {
            self.stale.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[test]
    fn test_median_odd() {
        assert_eq!(median(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median(&[5.0]), 5.0);
    }

    #[test]
    fn test_median_even() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(median(&[1.0, 2.0]), 1.5);
    }

    #[test]
    fn test_median_empty() {
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_snapshot_three_fresh_feeds() {
        let coinbase = StubFeed::fresh("coinbase", 70000.0);
        let kraken = StubFeed::fresh("kraken", 70010.0);
        let bitstamp = StubFeed::fresh("bitstamp", 70020.0);

        let feeds: Vec<Arc<dyn SpotFeed>> =
            vec![coinbase, kraken, bitstamp.clone()];
        let index = ReferenceIndex::new(feeds);
        assert_eq!(index.snapshot(), 70010.0);

        // One feed going stale drops the count to two: mean of the centre pair.
        bitstamp.set_stale(true);
        assert_eq!(index.snapshot(), 70005.0);
    }

    #[test]
    fn test_snapshot_falls_back_to_last_value() {
        let a = StubFeed::fresh("coinbase", 70000.0);
        let feeds: Vec<Arc<dyn SpotFeed>> = vec![a.clone()];
        let index = ReferenceIndex::new(feeds);

        assert_eq!(index.snapshot(), 70000.0);

        a.set_stale(true);
        assert_eq!(index.snapshot(), 70000.0);
        assert_eq!(index.price(), 70000.0);
    }

    #[test]
    fn test_snapshot_zero_before_first_computation() {
        let a = StubFeed::fresh("coinbase", 70000.0);
        a.set_stale(true);
        let feeds: Vec<Arc<dyn SpotFeed>> = vec![a];
        let index = ReferenceIndex::new(feeds);
        assert_eq!(index.snapshot(), 0.0);
    }

    #[test]
    fn test_feed_state_rejects_bad_prices() {
        let state = FeedState::default();
        state.set_price(f64::NAN);
        state.set_price(-1.0);
        state.set_price(0.0);
        assert_eq!(state.mid_price(), 0.0);
        assert!(state.is_stale());
        assert!(state.last_update().is_none());

        state.set_price(70000.0);
        assert_eq!(state.mid_price(), 70000.0);
        assert!(!state.is_stale());
    }

    #[test]
    fn test_price_history_ring() {
        let a = StubFeed::fresh("coinbase", 70000.0);
        let feeds: Vec<Arc<dyn SpotFeed>> = vec![a.clone()];
        let index = ReferenceIndex::new(feeds);

        for i in 0..5 {
            a.state.set_price(70000.0 + i as f64);
            index.record_sample();
        }

        let hist = index.price_history(3);
        assert_eq!(hist, vec![70002.0, 70003.0, 70004.0]);
        assert_eq!(index.price_history(100).len(), 5);
    }

    #[test]
    fn test_settlement_window() {
        let a = StubFeed::fresh("coinbase", 70000.0);
        let feeds: Vec<Arc<dyn SpotFeed>> = vec![a.clone()];
        let index = ReferenceIndex::new(feeds);

        assert!(!index.is_sampling());
        index.record_settlement_tick();
        assert!(index.settlement_ticks().is_empty());

        index.start_settlement_window();
        assert!(index.is_sampling());
        index.record_settlement_tick();
        a.state.set_price(70010.0);
        index.record_settlement_tick();

        assert_eq!(index.settlement_ticks(), vec![70000.0, 70010.0]);
        assert_eq!(index.settlement_average(), 70005.0);

        index.stop_settlement_window();
        assert!(!index.is_sampling());
    }
}
