//! Recorder entrypoint: wires the spot feeds, reference index, exchange
//! stream, discovery, collector and watchdog under one cancellation scope.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use btc15m_recorder::auth::RequestSigner;
use btc15m_recorder::collector::{
    compress_stale_files, Collector, CollectorHealth, Watchdog, Writer,
};
use btc15m_recorder::config::Config;
use btc15m_recorder::discovery::Discovery;
use btc15m_recorder::exchange::{ExchangeClient, ExchangeStream};
use btc15m_recorder::feeds::{
    BitstampFeed, CoinbaseFeed, KrakenFeed, ReferenceIndex, SpotFeed,
};

const READINESS_ATTEMPTS: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "btc15m-recorder")]
#[command(about = "Per-second market data recorder for 15-minute BTC contracts")]
struct Args {
    /// Output directory for JSONL files
    #[arg(long)]
    output: Option<String>,

    /// Series ticker to collect (default KXBTC15M)
    #[arg(long)]
    series: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut cfg = Config::from_env().context("config error")?;
    if let Some(output) = args.output {
        cfg.output_dir = output;
    }
    if let Some(series) = args.series {
        cfg.series_ticker = series;
    }

    info!(
        env = %cfg.env,
        series = %cfg.series_ticker,
        output = %cfg.output_dir,
        "data collector starting"
    );

    let signer = Arc::new(
        RequestSigner::from_key_file(&cfg.api_key_id, &cfg.priv_key_path)
            .context("signer init failed")?,
    );
    let client = Arc::new(
        ExchangeClient::new(cfg.rest_base_url(), signer.clone())
            .context("exchange client init failed")?,
    );

    // One cancellation scope for everything; signals cancel it once.
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    // Verify auth with a balance check. Retries ride out maintenance windows.
    let balance = readiness_probe(&client, &shutdown).await?;
    info!(
        balance = format!("${:.2}", balance as f64 / 100.0),
        "authenticated"
    );

    // Spot feeds and the reference index over them.
    let feeds: Vec<Arc<dyn SpotFeed>> = vec![
        Arc::new(CoinbaseFeed::new()),
        Arc::new(KrakenFeed::new()),
        Arc::new(BitstampFeed::new()),
    ];
    let reference = Arc::new(ReferenceIndex::new(feeds.clone()));

    for feed in &feeds {
        let feed = feed.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = feed.run(token.clone()).await {
                if !token.is_cancelled() {
                    error!(feed = feed.name(), err = %e, "feed error");
                }
            }
        });
    }

    info!("waiting for price feeds...");
    wait_for_feeds(&feeds, &shutdown).await;

    let price = reference.snapshot();
    if price > 0.0 {
        info!(price = format!("${:.2}", price), "initial reference index");
    } else {
        warn!("no price feeds connected yet — collector will wait for data");
    }
    for h in reference.feed_status() {
        let status = if h.stale { "stale/disconnected" } else { "connected" };
        info!(
            name = h.name,
            price = format!("${:.2}", h.price),
            status,
            "feed status"
        );
    }

    // Writer, preceded by the crash-recovery sweep of the output directory.
    let prefix = cfg.file_prefix();
    compress_stale_files(&cfg.output_dir, &prefix);
    let writer =
        Arc::new(Writer::new(&cfg.output_dir, &prefix).context("writer init failed")?);

    // Exchange stream reader and the discovery loop driving it.
    let stream = Arc::new(ExchangeStream::new(cfg.ws_url(), signer));
    {
        let stream = stream.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = stream.run(token).await;
        });
    }
    {
        let discovery = Discovery::new(client.clone(), stream.clone(), &cfg.series_ticker);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = discovery.run(token).await;
        });
    }

    let health = Arc::new(CollectorHealth::default());
    {
        let watchdog = Watchdog::new(health.clone(), feeds.clone(), stream.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            watchdog.run(token).await;
        });
    }

    let collector = Collector::new(
        client,
        stream,
        reference,
        feeds,
        writer,
        &cfg.series_ticker,
        health,
    );
    collector.run(shutdown).await?;

    info!("collector stopped");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "btc15m_recorder=debug"
    } else {
        "btc15m_recorder=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(err = %e, "sigterm handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }

        info!("received signal, shutting down");
        shutdown.cancel();
    });
}

/// Balance probe with quadratic backoff (15s, 60s, 135s, 240s between
/// attempts). Five failures is fatal.
async fn readiness_probe(
    client: &ExchangeClient,
    shutdown: &CancellationToken,
) -> Result<i64> {
    for attempt in 1..=READINESS_ATTEMPTS {
        match client.balance().await {
            Ok(balance) => return Ok(balance),
            Err(e) => {
                if attempt == READINESS_ATTEMPTS {
                    bail!("auth check failed after {attempt} attempts: {e}");
                }
                let backoff = Duration::from_secs(u64::from(attempt * attempt) * 15);
                warn!(
                    err = %e,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    "auth check failed, retrying"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => bail!("shutdown during auth retry"),
                    _ = sleep(backoff) => {}
                }
            }
        }
    }
    unreachable!("readiness loop returns or bails")
}

/// Wait up to 5s for any feed to become non-stale so the first records
/// carry real prices.
async fn wait_for_feeds(feeds: &[Arc<dyn SpotFeed>], shutdown: &CancellationToken) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut poll = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                warn!("timed out waiting for feeds");
                return;
            }
            _ = poll.tick() => {
                if let Some(f) = feeds.iter().find(|f| !f.is_stale()) {
                    info!(feed = f.name(), "feed connected");
                    return;
                }
            }
        }
    }
}
