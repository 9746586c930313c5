//! Stall detection and heartbeat for the collector.
//!
//! The watchdog never kills the process. On a stall it cancels the shared
//! token and lets the components unwind; the OS-level supervisor restarts
//! the binary.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::exchange::ExchangeStream;
use crate::feeds::SpotFeed;

/// No successful write for this long means the pipeline is wedged.
pub const STALL_THRESHOLD: Duration = Duration::from_secs(90);

const STALL_CHECK_PERIOD: Duration = Duration::from_secs(30);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

/// Write progress shared between the collector and the watchdog.
#[derive(Debug, Default)]
pub struct CollectorHealth {
    last_write: Mutex<Option<Instant>>,
    ticks: AtomicI64,
}

impl CollectorHealth {
    pub fn record_write(&self) {
        *self.last_write.lock() = Some(Instant::now());
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_write(&self) -> Option<Instant> {
        *self.last_write.lock()
    }

    pub fn ticks(&self) -> i64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// Stall predicate. Before the first successful write there is nothing to
/// compare against, so the check passes.
fn is_stalled(last_write: Option<Instant>, now: Instant) -> bool {
    match last_write {
        None => false,
        Some(t) => now.duration_since(t) > STALL_THRESHOLD,
    }
}

pub struct Watchdog {
    health: Arc<CollectorHealth>,
    feeds: Vec<Arc<dyn SpotFeed>>,
    stream: Arc<ExchangeStream>,
}

impl Watchdog {
    pub fn new(
        health: Arc<CollectorHealth>,
        feeds: Vec<Arc<dyn SpotFeed>>,
        stream: Arc<ExchangeStream>,
    ) -> Self {
        Self {
            health,
            feeds,
            stream,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let now = tokio::time::Instant::now();
        let mut stall_ticker = interval_at(now + STALL_CHECK_PERIOD, STALL_CHECK_PERIOD);
        let mut heartbeat_ticker = interval_at(now + HEARTBEAT_PERIOD, HEARTBEAT_PERIOD);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,

                _ = heartbeat_ticker.tick() => {
                    let last_write_ago_secs = self
                        .health
                        .last_write()
                        .map(|t| t.elapsed().as_secs() as i64)
                        .unwrap_or(-1);

                    let feeds: Vec<String> = self
                        .feeds
                        .iter()
                        .map(|f| {
                            let status = if f.is_stale() { "stale" } else { "ok" };
                            format!("{}:{}", f.name(), status)
                        })
                        .collect();

                    info!(
                        ticks = self.health.ticks(),
                        last_write_ago_secs,
                        feeds = feeds.join(" "),
                        exchange_ws = self.stream.is_connected(),
                        "heartbeat"
                    );
                }

                _ = stall_ticker.tick() => {
                    let last_write = self.health.last_write();
                    if is_stalled(last_write, Instant::now()) {
                        error!(
                            stalled_secs = last_write
                                .map(|t| t.elapsed().as_secs())
                                .unwrap_or(0),
                            "watchdog: no successful write for 90s, triggering restart"
                        );
                        shutdown.cancel();
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_writes_yet_is_not_a_stall() {
        assert!(!is_stalled(None, Instant::now()));
    }

    #[test]
    fn test_recent_write_is_not_a_stall() {
        let now = Instant::now();
        assert!(!is_stalled(Some(now - Duration::from_secs(89)), now));
        assert!(!is_stalled(Some(now - STALL_THRESHOLD), now));
    }

    #[test]
    fn test_old_write_is_a_stall() {
        let now = Instant::now();
        assert!(is_stalled(Some(now - Duration::from_secs(91)), now));
        assert!(is_stalled(Some(now - Duration::from_secs(300)), now));
    }

    #[test]
    fn test_health_counters() {
        let health = CollectorHealth::default();
        assert_eq!(health.ticks(), 0);
        assert!(health.last_write().is_none());

        health.record_write();
        health.record_write();
        assert_eq!(health.ticks(), 2);
        assert!(health.last_write().is_some());
    }
}
