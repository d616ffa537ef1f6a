//! polyquote engine binary.
//!
//! Wiring order: config → secrets → transport → cache/dispatcher →
//! gateway → market selection → strategies → feeds. Shutdown on
//! SIGTERM/SIGINT: stop intake, flash-cancel every open order, flush,
//! close sockets. No state is persisted; everything is rehydratable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use polyquote::arb::{discovery, ArbScanner, BasketExecutor};
use polyquote::blacklist::Blacklist;
use polyquote::config::{Config, ConfigWatch, Credentials, EnvSecrets};
use polyquote::coordinator::inventory_channel;
use polyquote::gateway::ExecutionGateway;
use polyquote::inventory::Inventory;
use polyquote::market_data::book::BookSnapshot;
use polyquote::market_data::cache::{Dispatcher, FeedEvent, StateCache};
use polyquote::market_data::feed::{MarketFeed, UserFeed};
use polyquote::market_data::rest::VenueRest;
use polyquote::mm::{eligibility, BookTick, MarketMaker};
use polyquote::rate_limit::{EndpointClass, RateLimiter};
use polyquote::types::{Market, UserOrderEvent};
use polyquote::Strategy;

#[derive(Parser, Debug)]
#[command(name = "polyquote", about = "Prediction-market MM + arbitrage engine")]
struct Cli {
    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// No POST/DELETE ever reaches the venue; intents are logged.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Non-blocking writer so a slow terminal never stalls the hot path.
    let (writer, _log_guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let mut cfg = Config::load().context("configuration failed validation")?;
    if cli.dry_run {
        cfg.dry_run = true;
    }

    info!("═══════════════════════════════════════════════");
    info!("  polyquote — MM + ask-sum arbitrage engine");
    info!(
        "  dry_run={} capital_cap={} daily_loss_limit={}",
        cfg.dry_run, cfg.risk.capital_cap, cfg.risk.daily_loss_limit,
    );
    info!("═══════════════════════════════════════════════");

    // ── Secrets ──
    let credentials = match Credentials::from_provider(&EnvSecrets) {
        Ok(c) => Some(c),
        Err(e) if cfg.dry_run => {
            info!("📝 no API credentials ({e}) — dry-run continues without user channel");
            None
        }
        Err(e) => anyhow::bail!("live mode requires API credentials: {e}"),
    };

    // ── Core components ──
    let rest = Arc::new(VenueRest::new(&cfg.data, credentials.clone(), cfg.dry_run));
    let limiter = Arc::new(RateLimiter::new(&cfg.limits));
    let inventory = Arc::new(Inventory::new(&cfg.mm));
    let blacklist = Arc::new(Blacklist::new(&cfg.blacklist));
    let cache = Arc::new(StateCache::new(cfg.data.stale_after()));
    let gateway = Arc::new(ExecutionGateway::new(
        &cfg,
        rest.clone(),
        limiter.clone(),
        inventory.clone(),
        blacklist.clone(),
        cache.clone(),
    ));

    let (config_watch, tunables_rx) = ConfigWatch::new(cfg.tunables());

    // ── Shutdown signal, observed by every task ──
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Dispatcher ──
    let (feed_tx, feed_rx) = mpsc::channel::<FeedEvent>(1024);
    let mut dispatcher = Dispatcher::new(cache.clone(), feed_rx);
    {
        let rest = rest.clone();
        let limiter = limiter.clone();
        dispatcher.set_rehydrator(Box::new(move |asset: String| {
            let rest = rest.clone();
            let limiter = limiter.clone();
            Box::pin(async move {
                limiter.acquire(EndpointClass::Read).await;
                rest.get_book(&asset).await.ok()
            })
        }));
    }
    {
        let gateway = gateway.clone();
        dispatcher.register_disconnect_handler(Box::new(move || {
            let gateway = gateway.clone();
            Box::pin(async move { gateway.flash_cancel_all().await })
        }));
    }
    {
        let gateway = gateway.clone();
        dispatcher.register_reconnect_handler(Box::new(move || {
            let gateway = gateway.clone();
            Box::pin(async move { gateway.mark_rehydrated() })
        }));
    }

    // ── MM market selection ──
    let mm_markets = select_mm_markets(&cfg, &rest, &limiter, &blacklist).await?;
    let mm_assets: HashSet<String> = mm_markets
        .iter()
        .filter_map(|m| m.outcomes.first())
        .map(|o| o.asset_id.clone())
        .collect();

    let (publisher, view) = inventory_channel();
    let (book_tx, book_rx) = mpsc::channel::<BookTick>(512);
    let (fill_tx, fill_rx) = mpsc::channel(256);
    gateway.set_fill_listener(fill_tx);

    let mut mm = MarketMaker::new(
        cfg.mm.clone(),
        cfg.risk.clone(),
        tunables_rx.clone(),
        gateway.clone(),
        inventory.clone(),
        cache.clone(),
        publisher,
        book_rx,
        fill_rx,
    );
    for market in &mm_markets {
        mm.add_market(market);
    }
    cache.subscribe(&mm.quoted_assets());

    dispatcher.register_update_handler(
        "mm-quoting",
        Box::new(move |snap: &BookSnapshot| {
            let _ = book_tx.try_send(BookTick::from_snapshot(snap));
        }),
        Some(mm_assets),
    );

    // ── Arbitrage universe ──
    let universe = discovery::discover(&rest, &limiter, &cfg.arb).await?;
    let arb_assets: HashSet<String> = universe.all_assets().into_iter().collect();
    cache.subscribe(&universe.all_assets());

    let (touched_tx, touched_rx) = mpsc::channel::<String>(1024);
    dispatcher.register_update_handler(
        "arb-rescan",
        Box::new(move |snap: &BookSnapshot| {
            let _ = touched_tx.try_send(snap.asset_id.clone());
        }),
        Some(arb_assets),
    );

    let executor = BasketExecutor::new(cfg.arb.clone(), gateway.clone(), cache.clone());
    let scanner = ArbScanner::new(
        cfg.arb.clone(),
        tunables_rx.clone(),
        universe,
        cache.clone(),
        view,
        executor,
        touched_rx,
    );

    // ── User-channel pump into the gateway ──
    let (user_tx, mut user_rx) = mpsc::channel::<UserOrderEvent>(512);
    let pump_gateway = gateway.clone();
    let mut pump_shutdown = shutdown_rx.clone();
    let user_pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = pump_shutdown.changed() => break,
                ev = user_rx.recv() => match ev {
                    Some(ev) => pump_gateway.handle_user_event(ev).await,
                    None => break,
                },
            }
        }
    });

    // ── Spawn tasks ──
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    let market_feed = MarketFeed::new(cfg.data.clone(), cache.clone(), feed_tx.clone());
    let market_feed_task = tokio::spawn(market_feed.run(shutdown_rx.clone()));

    let user_feed_task = credentials.map(|creds| {
        let feed = UserFeed::new(cfg.data.clone(), creds, user_tx, feed_tx.clone());
        tokio::spawn(feed.run(shutdown_rx.clone()))
    });

    let strategies: Vec<Box<dyn Strategy>> = vec![Box::new(mm), Box::new(scanner)];
    let mut strategy_tasks = Vec::new();
    for strategy in strategies {
        info!("🚀 starting strategy '{}'", strategy.name());
        strategy_tasks.push(tokio::spawn(strategy.run(shutdown_rx.clone())));
    }

    // ── Hot reload on SIGHUP ──
    let reload_task = spawn_reload_listener(config_watch, shutdown_rx.clone());

    // ── Wait for SIGTERM / SIGINT ──
    wait_for_signal().await;
    info!("🛑 shutdown signal received");

    // (a) stop accepting new work.
    let _ = shutdown_tx.send(true);
    // Strategies pull their own quotes on the way out.
    for task in strategy_tasks {
        if let Err(e) = task.await {
            if e.is_panic() {
                tracing::error!("strategy task panicked: {e}");
            }
        }
    }
    // (b)+(c) flash-cancel whatever is still open and flush the cancels.
    gateway.flash_cancel_all().await;
    // (d) feeds observe the signal and close their sockets.
    let _ = user_pump.await;
    let _ = dispatcher_task.await;
    let _ = market_feed_task.await;
    if let Some(task) = user_feed_task {
        let _ = task.await;
    }
    if let Some(task) = reload_task {
        let _ = task.await;
    }

    info!("👋 shutdown complete (no state persisted)");
    Ok(())
}

/// Page the market catalogue (server-side tag filter when configured),
/// apply the blacklist, then the tier-1 funnel against a fresh book.
async fn select_mm_markets(
    cfg: &Config,
    rest: &Arc<VenueRest>,
    limiter: &Arc<RateLimiter>,
    blacklist: &Arc<Blacklist>,
) -> anyhow::Result<Vec<Market>> {
    let tags: Vec<Option<u64>> = if cfg.mm.eligibility.target_tag_ids.is_empty() {
        vec![None]
    } else {
        cfg.mm
            .eligibility
            .target_tag_ids
            .iter()
            .map(|t| Some(*t))
            .collect()
    };

    let mut selected = Vec::new();
    'outer: for tag in tags {
        let mut offset = 0u64;
        loop {
            limiter.acquire(EndpointClass::Read).await;
            let page = match rest.get_markets(tag, 100, offset).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("market page fetch failed (tag={tag:?} offset={offset}): {e}");
                    break;
                }
            };
            let page_len = page.len();

            for market in page {
                if blacklist.is_blacklisted(&market) {
                    continue;
                }
                let Some(primary) = market.outcomes.first() else {
                    continue;
                };
                limiter.acquire(EndpointClass::Read).await;
                let book = match rest.get_book(&primary.asset_id).await {
                    Ok(data) => {
                        let mut snap =
                            BookSnapshot::new(&primary.asset_id, &market.id, Instant::now());
                        snap.replace(
                            data.bids,
                            data.asks,
                            data.server_ts,
                            data.hash,
                            Instant::now(),
                        );
                        Some(snap)
                    }
                    Err(e) => {
                        warn!("book fetch failed for {}: {e}", primary.asset_id);
                        None
                    }
                };
                if eligibility::evaluate(
                    &cfg.mm.eligibility,
                    &market,
                    book.as_ref(),
                    cfg.risk.capital_cap,
                    chrono::Utc::now(),
                )
                .is_ok()
                {
                    selected.push(market);
                    if selected.len() >= cfg.mm.max_markets {
                        break 'outer;
                    }
                }
            }

            if page_len < 100 {
                break;
            }
            offset += 100;
        }
    }

    info!("🎯 {} markets selected for quoting", selected.len());
    Ok(selected)
}

/// SIGHUP refreshes the hot-reloadable tunables without a restart.
fn spawn_reload_listener(
    config_watch: ConfigWatch,
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("SIGHUP listener unavailable: {e}");
                return None;
            }
        };
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = hup.recv() => match config_watch.refresh_from_env() {
                        Ok(t) => info!("♻️ tunables reloaded: {t:?}"),
                        Err(e) => warn!("♻️ tunables reload rejected: {e}"),
                    },
                }
            }
        }))
    }
    #[cfg(not(unix))]
    {
        let _ = (config_watch, shutdown);
        None
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
