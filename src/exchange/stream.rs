//! Streaming market-data connection to the contract exchange.
//!
//! One authenticated WebSocket carries `ticker` and `orderbook_delta`
//! channels for a dynamic set of contracts, plus command/ack envelopes for
//! subscription management. The discovery loop drives the desired set; the
//! reader merges updates into per-contract state; the collector reads a
//! merged snapshot once a second.
//!
//! Two locks guard the stream. The read-state lock covers ingest state
//! (prices, books, metadata, desired set); the write-side lock covers the
//! connection sink, channel SIDs, the subscribed set and the command
//! sequence. Lock order: read-state before write-side, never the reverse.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::RequestSigner;
use crate::models::{Market, MarketSnap};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const WS_SIGN_PATH: &str = "/trade-api/ws/v2";
const CHANNELS: [&str; 2] = ["ticker", "orderbook_delta"];

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const READ_DEADLINE: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(10);
const PING_WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Real-time ticker state for one contract, integer cents.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractPrice {
    pub yes_bid: i64,
    pub yes_ask: i64,
    pub last_price: i64,
    pub volume: i64,
    pub open_interest: i64,
}

/// REST-sourced metadata for one contract.
#[derive(Debug, Clone)]
pub struct ContractMeta {
    pub status: String,
    pub result: String,
    pub strike: f64,
    pub expiry: Option<DateTime<Utc>>,
}

/// Depth for one contract's YES and NO sides, price-cents level → quantity.
///
/// `ready` enforces the snapshot-before-delta invariant: deltas that arrive
/// before a snapshot (or after a reconnect cleared the book) are dropped.
#[derive(Debug, Default)]
pub struct Orderbook {
    pub yes: BTreeMap<i64, i64>,
    pub no: BTreeMap<i64, i64>,
    pub ready: bool,
}

/// Ingest state behind the read-state lock.
#[derive(Default)]
struct StreamState {
    prices: HashMap<String, ContractPrice>,
    books: HashMap<String, Orderbook>,
    metadata: HashMap<String, ContractMeta>,
    desired: HashSet<String>,
}

impl StreamState {
    fn apply_ticker(&mut self, t: &TickerPayload) {
        let p = self.prices.entry(t.market_ticker.clone()).or_default();
        p.yes_bid = t.yes_bid;
        p.yes_ask = t.yes_ask;
        p.last_price = t.price;
        p.volume = t.volume;
        p.open_interest = t.open_interest;
    }

    fn apply_book_snapshot(&mut self, s: BookSnapshotPayload) {
        self.books.insert(
            s.market_ticker,
            Orderbook {
                yes: s.yes.into_iter().collect(),
                no: s.no.into_iter().collect(),
                ready: true,
            },
        );
    }

    fn apply_book_delta(&mut self, d: &BookDeltaPayload) {
        let Some(book) = self.books.get_mut(&d.market_ticker) else {
            return;
        };
        if !book.ready {
            return;
        }

        let side = if d.side == "yes" {
            &mut book.yes
        } else {
            &mut book.no
        };

        let qty = side.entry(d.price).or_insert(0);
        *qty += d.delta;
        if *qty <= 0 {
            side.remove(&d.price);
        }
    }

    fn remove(&mut self, ticker: &str) {
        self.prices.remove(ticker);
        self.books.remove(ticker);
        self.metadata.remove(ticker);
    }

    /// Merged view of every tracked contract at `now`.
    fn snapshot_views(&self, now: DateTime<Utc>) -> Vec<MarketSnap> {
        let mut result = Vec::with_capacity(self.metadata.len());
        for (ticker, meta) in &self.metadata {
            let secs_left = meta
                .expiry
                .map(|e| (e - now).num_seconds().max(0))
                .unwrap_or(0);

            let mut snap = MarketSnap {
                ticker: ticker.clone(),
                strike: meta.strike,
                status: meta.status.clone(),
                result: meta.result.clone(),
                secs_left,
                ..Default::default()
            };

            if let Some(p) = self.prices.get(ticker) {
                snap.yes_bid = p.yes_bid;
                snap.yes_ask = p.yes_ask;
                snap.last_price = p.last_price;
                snap.volume = p.volume;
                snap.open_interest = p.open_interest;
            }

            if let Some(book) = self.books.get(ticker) {
                if book.ready {
                    snap.yes_book = sorted_levels(&book.yes);
                    snap.no_book = sorted_levels(&book.no);
                }
            }

            result.push(snap);
        }
        result
    }
}

/// BTreeMap iterates in key order, so levels come out sorted by price
/// ascending. Empty sides are omitted from the output.
fn sorted_levels(side: &BTreeMap<i64, i64>) -> Option<Vec<(i64, i64)>> {
    if side.is_empty() {
        return None;
    }
    Some(side.iter().map(|(&p, &q)| (p, q)).collect())
}

/// `to_add = desired − subscribed`, `to_remove = subscribed − desired`.
fn diff_subscriptions(
    desired: &HashSet<String>,
    subscribed: &HashSet<String>,
) -> (Vec<String>, Vec<String>) {
    let to_add = desired
        .iter()
        .filter(|t| !subscribed.contains(*t))
        .cloned()
        .collect();
    let to_remove = subscribed
        .iter()
        .filter(|t| !desired.contains(*t))
        .cloned()
        .collect();
    (to_add, to_remove)
}

/// Write-side state, reset from zero on every reconnect.
#[derive(Default)]
struct WriteSide {
    sink: Option<WsSink>,
    ticker_sid: i64,
    orderbook_sid: i64,
    subscribed: HashSet<String>,
    cmd_seq: i64,
}

// --- WS message types ---

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(default)]
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    msg: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WsCommand<P: Serialize> {
    id: i64,
    cmd: &'static str,
    params: P,
}

#[derive(Debug, Serialize)]
struct SubscribeParams {
    channels: Vec<&'static str>,
    market_tickers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UpdateSubParams {
    sids: Vec<i64>,
    market_tickers: Vec<String>,
    action: &'static str,
}

#[derive(Debug, Deserialize)]
struct SubOkEntry {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    sid: i64,
}

#[derive(Debug, Deserialize)]
struct TickerPayload {
    market_ticker: String,
    #[serde(default)]
    price: i64,
    #[serde(default)]
    yes_bid: i64,
    #[serde(default)]
    yes_ask: i64,
    #[serde(default)]
    volume: i64,
    #[serde(default)]
    open_interest: i64,
}

#[derive(Debug, Deserialize)]
struct BookSnapshotPayload {
    market_ticker: String,
    #[serde(default)]
    yes: Vec<(i64, i64)>,
    #[serde(default)]
    no: Vec<(i64, i64)>,
}

#[derive(Debug, Deserialize)]
struct BookDeltaPayload {
    market_ticker: String,
    price: i64,
    delta: i64,
    side: String,
}

/// The streaming connection. Shared across the reader task, the discovery
/// loop (reconcile/metadata) and the collector (snapshot).
pub struct ExchangeStream {
    ws_url: String,
    signer: Arc<RequestSigner>,
    state: RwLock<StreamState>,
    write: tokio::sync::Mutex<WriteSide>,
    connected: AtomicBool,
}

impl ExchangeStream {
    pub fn new(ws_url: &str, signer: Arc<RequestSigner>) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            signer,
            state: RwLock::new(StreamState::default()),
            write: tokio::sync::Mutex::new(WriteSide::default()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Maintain the connection with automatic reconnection until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            if let Err(e) = self.connect(&shutdown).await {
                warn!(err = %e, "exchange ws disconnected");
            }
            self.connected.store(false, Ordering::Release);

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep(RECONNECT_DELAY) => info!("exchange ws reconnecting..."),
            }
        }
    }

    async fn connect(&self, shutdown: &CancellationToken) -> Result<()> {
        let (sink, source) = self.dial().await.context("dial")?;

        // Reset write-side state from zero.
        {
            let mut w = self.write.lock().await;
            w.sink = Some(sink);
            w.ticker_sid = 0;
            w.orderbook_sid = 0;
            w.subscribed.clear();
            w.cmd_seq = 0;
        }

        // Clear orderbooks; fresh snapshots arrive after subscribe. Prices
        // and metadata survive as last-known state.
        self.state.write().books.clear();

        // Subscribe to the desired set before marking connected.
        let tickers: Vec<String> = self.state.read().desired.iter().cloned().collect();
        if !tickers.is_empty() {
            let mut w = self.write.lock().await;
            if let Err(e) = subscribe_cmd(&mut w, tickers.clone()).await {
                w.sink = None;
                return Err(e).context("subscribe");
            }
        }

        self.connected.store(true, Ordering::Release);
        info!(subscriptions = tickers.len(), "exchange ws connected");

        let result = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            r = self.read_loop(source) => r,
            r = self.ping_loop() => r,
        };

        self.write.lock().await.sink = None;
        result
    }

    async fn dial(&self) -> Result<(WsSink, WsSource)> {
        let mut request = self.ws_url.as_str().into_client_request()?;
        for (k, v) in self.signer.headers("GET", WS_SIGN_PATH)? {
            request.headers_mut().insert(
                HeaderName::from_bytes(k.as_bytes())?,
                HeaderValue::from_str(&v)?,
            );
        }

        let (ws, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .context("handshake timed out")?
            .context("dial failed")?;
        Ok(ws.split())
    }

    /// Keepalive pings every 10 s; a failed write ends the attempt and the
    /// reconnect loop takes over.
    async fn ping_loop(&self) -> Result<()> {
        let start = tokio::time::Instant::now() + PING_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, PING_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let mut w = self.write.lock().await;
            let Some(sink) = w.sink.as_mut() else {
                bail!("connection gone");
            };
            timeout(PING_WRITE_DEADLINE, sink.send(Message::Ping(Vec::new())))
                .await
                .context("ping write deadline")?
                .context("ping failed")?;
        }
    }

    async fn read_loop(&self, mut source: WsSource) -> Result<()> {
        loop {
            let msg = match timeout(READ_DEADLINE, source.next())
                .await
                .context("read deadline exceeded")?
            {
                Some(m) => m.context("read failed")?,
                None => bail!("stream ended"),
            };

            match msg {
                Message::Text(text) => self.dispatch(&text).await,
                Message::Ping(payload) => {
                    // Pong echo keeps the exchange's keepalive happy.
                    let mut w = self.write.lock().await;
                    if let Some(sink) = w.sink.as_mut() {
                        let _ = timeout(PING_WRITE_DEADLINE, sink.send(Message::Pong(payload)))
                            .await;
                    }
                }
                Message::Close(_) => bail!("closed by server"),
                _ => {}
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let env: WsEnvelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                debug!(err = %e, "exchange ws: envelope decode error");
                return;
            }
        };

        match env.kind.as_str() {
            "ticker" => match serde_json::from_value::<TickerPayload>(env.msg) {
                Ok(t) => {
                    debug!(ticker = %t.market_ticker, bid = t.yes_bid, ask = t.yes_ask, "ws ticker");
                    self.state.write().apply_ticker(&t);
                }
                Err(e) => debug!(err = %e, "exchange ws: ticker decode error"),
            },
            "orderbook_snapshot" => match serde_json::from_value::<BookSnapshotPayload>(env.msg) {
                Ok(s) => {
                    debug!(
                        ticker = %s.market_ticker,
                        yes_levels = s.yes.len(),
                        no_levels = s.no.len(),
                        "ws ob snapshot"
                    );
                    self.state.write().apply_book_snapshot(s);
                }
                Err(e) => debug!(err = %e, "exchange ws: ob snapshot decode error"),
            },
            "orderbook_delta" => match serde_json::from_value::<BookDeltaPayload>(env.msg) {
                Ok(d) => self.state.write().apply_book_delta(&d),
                Err(e) => debug!(err = %e, "exchange ws: ob delta decode error"),
            },
            "ok" => self.handle_ok(env.msg).await,
            "error" => warn!(id = env.id, msg = %env.msg, "exchange ws error"),
            other => debug!(kind = other, "exchange ws: unknown message type"),
        }
    }

    /// Subscribe acks carry `[{channel, sid}]`. Acks for
    /// `update_subscription` can have other shapes and are ignored.
    async fn handle_ok(&self, msg: serde_json::Value) {
        let Ok(entries) = serde_json::from_value::<Vec<SubOkEntry>>(msg) else {
            return;
        };

        let mut w = self.write.lock().await;
        for e in entries {
            match e.channel.as_str() {
                "ticker" => w.ticker_sid = e.sid,
                "orderbook_delta" => w.orderbook_sid = e.sid,
                _ => {}
            }
            debug!(channel = %e.channel, sid = e.sid, "ws subscribed");
        }
    }

    /// Push REST-sourced metadata into the stream cache, upserting by ticker.
    pub fn update_metadata(&self, markets: &[Market]) {
        let mut s = self.state.write();
        for m in markets {
            s.metadata.insert(
                m.ticker.clone(),
                ContractMeta {
                    status: m.status.clone(),
                    result: m.result.clone(),
                    strike: m.strike_price(),
                    expiry: m.expiration_parsed(),
                },
            );
        }
    }

    /// Adjust the subscription set to `tickers`.
    ///
    /// The desired set is the single source of truth: it is replaced first,
    /// and if the stream is down the next connect's subscribe picks it up.
    /// On a live connection the diff against the subscribed set is sent as
    /// commands; write errors are logged but never fatal here, because the
    /// reader will notice the broken connection and the reconnect path
    /// resubscribes from the desired set.
    pub async fn reconcile(&self, tickers: &[String]) {
        let desired: HashSet<String> = tickers.iter().cloned().collect();
        self.state.write().desired = desired.clone();

        if !self.is_connected() {
            return;
        }

        let removed: Vec<String> = {
            let mut w = self.write.lock().await;
            if w.sink.is_none() {
                return;
            }

            let (to_add, to_remove) = diff_subscriptions(&desired, &w.subscribed);

            if !to_add.is_empty() {
                let result = if w.ticker_sid == 0 {
                    // No acked subscription on this connection yet.
                    send_command(
                        &mut w,
                        "subscribe",
                        SubscribeParams {
                            channels: CHANNELS.to_vec(),
                            market_tickers: to_add.clone(),
                        },
                    )
                    .await
                } else {
                    let sids = vec![w.ticker_sid, w.orderbook_sid];
                    send_command(
                        &mut w,
                        "update_subscription",
                        UpdateSubParams {
                            sids,
                            market_tickers: to_add.clone(),
                            action: "add_markets",
                        },
                    )
                    .await
                };
                if let Err(e) = result {
                    warn!(err = %e, "ws subscribe add failed");
                }
                for t in &to_add {
                    w.subscribed.insert(t.clone());
                }
                debug!(count = to_add.len(), "ws added markets");
            }

            if !to_remove.is_empty() && w.ticker_sid != 0 {
                let sids = vec![w.ticker_sid, w.orderbook_sid];
                if let Err(e) = send_command(
                    &mut w,
                    "update_subscription",
                    UpdateSubParams {
                        sids,
                        market_tickers: to_remove.clone(),
                        action: "remove_markets",
                    },
                )
                .await
                {
                    warn!(err = %e, "ws subscribe remove failed");
                }
                for t in &to_remove {
                    w.subscribed.remove(t);
                }
                debug!(count = to_remove.len(), "ws removed markets");
            }

            to_remove
        };

        // Drop caches for contracts we no longer track.
        if !removed.is_empty() {
            let mut s = self.state.write();
            for t in &removed {
                s.remove(t);
            }
        }
    }

    /// Merged view of all tracked contracts: metadata plus last ticker state
    /// plus book depth where a fresh snapshot has arrived.
    pub fn snapshot(&self) -> Vec<MarketSnap> {
        self.state.read().snapshot_views(Utc::now())
    }
}

async fn send_command<P: Serialize>(w: &mut WriteSide, cmd: &'static str, params: P) -> Result<()> {
    w.cmd_seq += 1;
    let text = serde_json::to_string(&WsCommand {
        id: w.cmd_seq,
        cmd,
        params,
    })?;

    let sink = w.sink.as_mut().context("not connected")?;
    timeout(WRITE_DEADLINE, sink.send(Message::Text(text)))
        .await
        .context("write deadline exceeded")?
        .context("write failed")?;
    Ok(())
}

/// Fresh `subscribe` for both channels; marks the tickers subscribed.
async fn subscribe_cmd(w: &mut WriteSide, tickers: Vec<String>) -> Result<()> {
    send_command(
        w,
        "subscribe",
        SubscribeParams {
            channels: CHANNELS.to_vec(),
            market_tickers: tickers.clone(),
        },
    )
    .await?;

    for t in tickers {
        w.subscribed.insert(t);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn delta(ticker: &str, side: &str, price: i64, delta: i64) -> BookDeltaPayload {
        BookDeltaPayload {
            market_ticker: ticker.to_string(),
            price,
            delta,
            side: side.to_string(),
        }
    }

    fn snapshot_payload(ticker: &str, yes: &[(i64, i64)], no: &[(i64, i64)]) -> BookSnapshotPayload {
        BookSnapshotPayload {
            market_ticker: ticker.to_string(),
            yes: yes.to_vec(),
            no: no.to_vec(),
        }
    }

    #[test]
    fn test_delta_before_snapshot_is_dropped() {
        let mut state = StreamState::default();
        state.apply_book_delta(&delta("T", "no", 48, -1));
        assert!(state.books.is_empty());
    }

    #[test]
    fn test_snapshot_then_deltas() {
        let mut state = StreamState::default();
        state.apply_book_snapshot(snapshot_payload("T", &[(50, 10), (51, 5)], &[(49, 8)]));

        state.apply_book_delta(&delta("T", "yes", 51, 3));
        state.apply_book_delta(&delta("T", "no", 49, -8));

        let book = &state.books["T"];
        assert!(book.ready);
        assert_eq!(book.yes.get(&50), Some(&10));
        assert_eq!(book.yes.get(&51), Some(&8));
        assert!(book.no.is_empty());
    }

    #[test]
    fn test_delta_never_leaves_nonpositive_level() {
        let mut state = StreamState::default();
        state.apply_book_snapshot(snapshot_payload("T", &[(50, 2)], &[]));

        state.apply_book_delta(&delta("T", "yes", 50, -5));
        assert!(state.books["T"].yes.get(&50).is_none());

        // A negative delta at an unseen level must not create one.
        state.apply_book_delta(&delta("T", "yes", 60, -1));
        assert!(state.books["T"].yes.get(&60).is_none());
    }

    #[test]
    fn test_reconnect_clears_ready_until_fresh_snapshot() {
        let mut state = StreamState::default();
        state.apply_book_snapshot(snapshot_payload("T", &[(50, 10)], &[]));
        assert!(state.books["T"].ready);

        // Reconnect path discards all books.
        state.books.clear();

        state.apply_book_delta(&delta("T", "yes", 50, 5));
        assert!(state.books.is_empty());

        state.apply_book_snapshot(snapshot_payload("T", &[(50, 7)], &[]));
        assert_eq!(state.books["T"].yes.get(&50), Some(&7));
    }

    #[test]
    fn test_ticker_upserts_price() {
        let mut state = StreamState::default();
        state.apply_ticker(&TickerPayload {
            market_ticker: "T".to_string(),
            price: 46,
            yes_bid: 45,
            yes_ask: 47,
            volume: 100,
            open_interest: 30,
        });

        let p = &state.prices["T"];
        assert_eq!(p.last_price, 46);
        assert_eq!(p.yes_bid, 45);

        state.apply_ticker(&TickerPayload {
            market_ticker: "T".to_string(),
            price: 48,
            yes_bid: 47,
            yes_ask: 49,
            volume: 120,
            open_interest: 31,
        });
        assert_eq!(state.prices["T"].last_price, 48);
    }

    #[test]
    fn test_diff_subscriptions() {
        let subscribed: HashSet<String> =
            ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        let desired: HashSet<String> = ["B", "C", "D"].iter().map(|s| s.to_string()).collect();

        let (to_add, to_remove) = diff_subscriptions(&desired, &subscribed);
        assert_eq!(to_add, vec!["D".to_string()]);
        assert_eq!(to_remove, vec!["A".to_string()]);
    }

    #[test]
    fn test_remove_drops_all_caches() {
        let mut state = StreamState::default();
        state.apply_ticker(&TickerPayload {
            market_ticker: "A".to_string(),
            price: 1,
            yes_bid: 1,
            yes_ask: 2,
            volume: 0,
            open_interest: 0,
        });
        state.apply_book_snapshot(snapshot_payload("A", &[(50, 1)], &[]));
        state.metadata.insert(
            "A".to_string(),
            ContractMeta {
                status: "open".to_string(),
                result: String::new(),
                strike: 0.0,
                expiry: None,
            },
        );

        state.remove("A");
        assert!(state.prices.is_empty());
        assert!(state.books.is_empty());
        assert!(state.metadata.is_empty());
    }

    #[test]
    fn test_snapshot_views_merging_and_clamp() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 20, 30, 5).unwrap();
        let mut state = StreamState::default();

        // Expired 5 s ago: secs_left clamps to 0.
        state.metadata.insert(
            "EXPIRED".to_string(),
            ContractMeta {
                status: "closed".to_string(),
                result: "yes".to_string(),
                strike: 70000.0,
                expiry: Some(Utc.with_ymd_and_hms(2024, 5, 10, 20, 30, 0).unwrap()),
            },
        );

        // Live contract with prices and a ready book.
        state.metadata.insert(
            "LIVE".to_string(),
            ContractMeta {
                status: "open".to_string(),
                result: String::new(),
                strike: 70250.0,
                expiry: Some(Utc.with_ymd_and_hms(2024, 5, 10, 20, 45, 0).unwrap()),
            },
        );
        state.apply_ticker(&TickerPayload {
            market_ticker: "LIVE".to_string(),
            price: 46,
            yes_bid: 45,
            yes_ask: 47,
            volume: 1200,
            open_interest: 300,
        });
        state.apply_book_snapshot(snapshot_payload("LIVE", &[(51, 5), (45, 10)], &[(49, 8)]));

        let mut views = state.snapshot_views(now);
        views.sort_by(|a, b| a.ticker.cmp(&b.ticker));

        let expired = &views[0];
        assert_eq!(expired.ticker, "EXPIRED");
        assert_eq!(expired.secs_left, 0);
        assert_eq!(expired.result, "yes");
        assert!(expired.yes_book.is_none());

        let live = &views[1];
        assert_eq!(live.secs_left, 895);
        assert_eq!(live.yes_bid, 45);
        // Levels sorted by price ascending regardless of arrival order.
        assert_eq!(live.yes_book, Some(vec![(45, 10), (51, 5)]));
        assert_eq!(live.no_book, Some(vec![(49, 8)]));
    }

    #[test]
    fn test_snapshot_views_book_hidden_until_ready() {
        let now = Utc::now();
        let mut state = StreamState::default();
        state.metadata.insert(
            "T".to_string(),
            ContractMeta {
                status: "open".to_string(),
                result: String::new(),
                strike: 0.0,
                expiry: Some(now + chrono::Duration::seconds(60)),
            },
        );
        state.books.insert("T".to_string(), Orderbook::default());
        state.apply_ticker(&TickerPayload {
            market_ticker: "T".to_string(),
            price: 50,
            yes_bid: 49,
            yes_ask: 51,
            volume: 10,
            open_interest: 5,
        });

        let views = state.snapshot_views(now);
        // Ticker fields flow through, book levels do not.
        assert_eq!(views[0].yes_bid, 49);
        assert!(views[0].yes_book.is_none());
        assert!(views[0].no_book.is_none());
    }

    #[test]
    fn test_sub_ok_entries_parse() {
        let msg: serde_json::Value = serde_json::from_str(
            r#"[{"channel":"ticker","sid":7},{"channel":"orderbook_delta","sid":8}]"#,
        )
        .unwrap();
        let entries: Vec<SubOkEntry> = serde_json::from_value(msg).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sid, 7);

        // update_subscription acks may be plain objects; they must not parse
        // as the subscribe-ack shape.
        let other: serde_json::Value =
            serde_json::from_str(r#"{"market_tickers":["A","B"]}"#).unwrap();
        assert!(serde_json::from_value::<Vec<SubOkEntry>>(other).is_err());
    }

    #[test]
    fn test_envelope_parse() {
        let env: WsEnvelope = serde_json::from_str(
            r#"{"type":"ticker","sid":7,"seq":42,
                "msg":{"market_ticker":"T","price":46,"yes_bid":45,"yes_ask":47,
                       "volume":1,"open_interest":2}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, "ticker");
        let t: TickerPayload = serde_json::from_value(env.msg).unwrap();
        assert_eq!(t.market_ticker, "T");
        assert_eq!(t.price, 46);
    }

    #[tokio::test]
    async fn test_reconcile_offline_only_updates_desired() {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let signer = Arc::new(RequestSigner::new("k", key));
        let stream = ExchangeStream::new("wss://example.invalid/ws", signer);

        let tickers = vec!["A".to_string(), "B".to_string()];
        stream.reconcile(&tickers).await;

        assert!(!stream.is_connected());
        let state = stream.state.read();
        assert_eq!(state.desired.len(), 2);
        assert!(state.desired.contains("A"));
        // Nothing was marked subscribed without a connection.
        drop(state);
        assert!(stream.write.lock().await.subscribed.is_empty());
    }

    #[tokio::test]
    async fn test_update_metadata_upserts() {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let signer = Arc::new(RequestSigner::new("k", key));
        let stream = ExchangeStream::new("wss://example.invalid/ws", signer);

        let market = Market {
            ticker: "T".to_string(),
            status: "open".to_string(),
            cap_strike: 70250.0,
            expected_expiration_time: "2024-05-10T20:45:00Z".to_string(),
            ..Default::default()
        };
        stream.update_metadata(std::slice::from_ref(&market));

        {
            let state = stream.state.read();
            let meta = &state.metadata["T"];
            assert_eq!(meta.status, "open");
            assert_eq!(meta.strike, 70250.0);
        }

        // A later pass with changed status replaces the entry.
        let market = Market {
            status: "settled".to_string(),
            result: "yes".to_string(),
            ..market
        };
        stream.update_metadata(&[market]);
        let state = stream.state.read();
        assert_eq!(state.metadata["T"].status, "settled");
        assert_eq!(state.metadata["T"].result, "yes");
    }
}
