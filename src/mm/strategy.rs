//! Market-making strategy actor.
//!
//! One task services every subscribed asset round-robin off the dispatch
//! handler's queue. Per asset it keeps quote slots, the toxic-flow guards,
//! and the markout tracker; quotes flow only through the execution
//! gateway.
//!
//! Ordering on a fill (the user-channel path): the gateway has already
//! cancelled the opposite quote and updated inventory before the notice
//! lands here; this actor then re-quotes with the new inventory skew.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::guards::{micro_divergence_toxic, DriftClamp, MarkoutTracker, ReactiveGuard};
use super::quoting::{compute_quotes, skew_moved_enough, BoundaryPolicy, QuoteInputs, QuotePair};
use crate::config::{MmConfig, RiskConfig, Tunables};
use crate::coordinator::{InventoryExport, InventoryPublisher};
use crate::gateway::{ExecutionGateway, FillNotice, MarketMeta};
use crate::inventory::Inventory;
use crate::market_data::book::BookSnapshot;
use crate::market_data::cache::StateCache;
use crate::types::{Market, OrderRequest, Origin, Side, Tif};

/// Book update forwarded from the dispatch handler. Kept minimal: the
/// handler must not block, so it clones only what quoting needs.
#[derive(Debug, Clone)]
pub struct BookTick {
    pub asset_id: String,
    pub market_id: String,
    pub mid: Option<Decimal>,
    pub micro: Option<Decimal>,
    pub obi: Option<Decimal>,
}

impl BookTick {
    pub fn from_snapshot(snap: &BookSnapshot) -> Self {
        Self {
            asset_id: snap.asset_id.clone(),
            market_id: snap.market_id.clone(),
            mid: snap.mid(),
            micro: snap.micro_price(),
            obi: snap.obi(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Per-asset state
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct QuoteSlot {
    order_id: String,
    price: Decimal,
    placed_at: Instant,
}

struct AssetQuoter {
    market_id: String,
    tick: Decimal,
    bid: Option<QuoteSlot>,
    ask: Option<QuoteSlot>,
    placed_skew: Option<Decimal>,
    last_quote_at: Option<Instant>,
    reactive: ReactiveGuard,
    markout: MarkoutTracker,
    drift: DriftClamp,
    /// Quotes pulled by the predictive guard; re-enter once divergence
    /// normalises.
    pulled: bool,
}

impl AssetQuoter {
    fn new(market_id: &str, tick: Decimal, cfg: &MmConfig) -> Self {
        Self {
            market_id: market_id.to_string(),
            tick,
            bid: None,
            ask: None,
            placed_skew: None,
            last_quote_at: None,
            reactive: ReactiveGuard::new(cfg),
            markout: MarkoutTracker::new(cfg),
            drift: DriftClamp::new(cfg),
            pulled: false,
        }
    }

    fn resting_ids(&self) -> Vec<String> {
        self.bid
            .iter()
            .chain(self.ask.iter())
            .map(|s| s.order_id.clone())
            .collect()
    }

    fn clear_slots(&mut self) {
        self.bid = None;
        self.ask = None;
        self.placed_skew = None;
    }
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

pub struct MarketMaker {
    cfg: MmConfig,
    risk: RiskConfig,
    tunables: watch::Receiver<Tunables>,
    gateway: Arc<ExecutionGateway>,
    inventory: Arc<Inventory>,
    cache: Arc<StateCache>,
    publisher: InventoryPublisher,
    quoters: HashMap<String, AssetQuoter>,
    book_rx: mpsc::Receiver<BookTick>,
    fill_rx: mpsc::Receiver<FillNotice>,
}

impl MarketMaker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: MmConfig,
        risk: RiskConfig,
        tunables: watch::Receiver<Tunables>,
        gateway: Arc<ExecutionGateway>,
        inventory: Arc<Inventory>,
        cache: Arc<StateCache>,
        publisher: InventoryPublisher,
        book_rx: mpsc::Receiver<BookTick>,
        fill_rx: mpsc::Receiver<FillNotice>,
    ) -> Self {
        Self {
            cfg,
            risk,
            tunables,
            gateway,
            inventory,
            cache,
            publisher,
            quoters: HashMap::new(),
            book_rx,
            fill_rx,
        }
    }

    /// Admit a market that passed the blacklist and tier-1 funnel. The MM
    /// quotes the primary outcome token two-sided.
    pub fn add_market(&mut self, market: &Market) {
        let asset = match market.outcomes.first() {
            Some(o) => o.asset_id.clone(),
            None => return,
        };
        self.gateway.register_market(
            &market.id,
            MarketMeta {
                tick_size: market.tick_size,
                min_order_notional: market.min_order_notional,
            },
        );
        self.quoters.insert(
            asset.clone(),
            AssetQuoter::new(&market.id, market.tick_size, &self.cfg),
        );
        info!("🎯 MM quoting {} (asset {})", market.id, asset);
    }

    pub fn quoted_assets(&self) -> Vec<String> {
        self.quoters.keys().cloned().collect()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "🎯 MM started | markets={} size={} ttl={}s interval={}ms",
            self.quoters.len(),
            self.cfg.quote_size,
            self.cfg.order_ttl_secs,
            self.cfg.quote_update_interval_ms,
        );

        let mut janitor = tokio::time::interval(Duration::from_millis(
            self.cfg.quote_update_interval_ms.max(100),
        ));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(tick) = self.book_rx.recv() => {
                    self.on_book(tick).await;
                }
                Some(fill) = self.fill_rx.recv() => {
                    self.on_fill(fill).await;
                }
                _ = janitor.tick() => {
                    self.on_janitor_tick().await;
                }
            }
        }

        // Shutdown: stop quoting and pull everything we own.
        let ids: Vec<String> = self
            .quoters
            .values()
            .flat_map(|q| q.resting_ids())
            .collect();
        for id in ids {
            let _ = self.gateway.cancel_order(&id).await;
        }
        info!("🎯 MM shutting down");
    }

    // ─────────────────────────────────────────────────
    // Book updates
    // ─────────────────────────────────────────────────

    async fn on_book(&mut self, tick: BookTick) {
        let now = Instant::now();
        let mid = match tick.mid {
            Some(m) => m,
            None => return,
        };
        if let Some(q) = self.quoters.get_mut(&tick.asset_id) {
            q.drift.push(mid);
        } else {
            return;
        }
        self.inventory.record_mid(&tick.asset_id, mid, now);

        // Throttle: at most one recompute per interval per asset.
        let throttled = {
            let q = self.quoters.get(&tick.asset_id).expect("checked above");
            q.last_quote_at
                .map(|t| now.duration_since(t) < Duration::from_millis(self.cfg.quote_update_interval_ms))
                .unwrap_or(false)
        };
        if !throttled {
            self.requote(&tick.asset_id, &tick, now).await;
        }
    }

    async fn requote(&mut self, asset_id: &str, tick: &BookTick, now: Instant) {
        let tunables = *self.tunables.borrow();

        // Silent observation window after a reactive trip.
        if let Some(q) = self.quoters.get(asset_id) {
            if q.reactive.is_silent(now) {
                debug!("🧊 {} cooling — no quotes", asset_id);
                return;
            }
        }

        let (mid, micro) = match (tick.mid, tick.micro) {
            (Some(m), Some(u)) => (m, u),
            _ => return,
        };

        // Predictive toxic-flow guard: pull and wait for normalisation.
        // Edge-triggered logging so the 500ms loop does not spam.
        let was_pulled = self.quoters.get(asset_id).map(|q| q.pulled).unwrap_or(false);
        if micro_divergence_toxic(micro, mid, tunables.mm_predictive_deviation) {
            if !was_pulled {
                warn!(
                    "☠️ {} micro/mid divergence (micro={} mid={}) — pulling quotes",
                    asset_id, micro, mid,
                );
            }
            self.pull_quotes(asset_id, "micro-price divergence").await;
            if let Some(q) = self.quoters.get_mut(asset_id) {
                q.pulled = true;
            }
            return;
        }
        if was_pulled {
            info!("✅ {} micro-price divergence normalised", asset_id);
        }

        let q_shares = self.inventory.position_shares(asset_id);
        let gamma = self.inventory.dynamic_gamma(asset_id, now);
        let sigma2_raw = self.inventory.short_sigma2(asset_id, now);

        let quoter = match self.quoters.get_mut(asset_id) {
            Some(q) => q,
            None => return,
        };
        quoter.pulled = false;
        let sigma2 = quoter.drift.clamp_sigma2(sigma2_raw);
        let multiplier = quoter.markout.multiplier();

        let inputs = QuoteInputs {
            reference: micro,
            inventory: q_shares,
            gamma,
            sigma2,
            kappa: self.cfg.kappa,
            min_spread: tunables.mm_min_spread,
            // Markout multiplier scales both the spread and, through the
            // gamma term below, the skew sensitivity.
            spread_multiplier: multiplier,
            tick: quoter.tick,
        };
        let boundary = BoundaryPolicy {
            low: self.cfg.boundary_low,
            high: self.cfg.boundary_high,
            band: self.cfg.boundary_band,
            widen: self.cfg.boundary_widen,
        };

        let pair = match compute_quotes(&inputs, &boundary) {
            Some(p) => p,
            None => {
                self.pull_quotes(asset_id, "no viable pair").await;
                return;
            }
        };

        // Hysteresis: skip the replace when the skew barely moved and the
        // standing prices are still within tolerance.
        let quoter = self.quoters.get(asset_id).expect("still present");
        if let (Some(bid), Some(ask), Some(placed_skew)) =
            (&quoter.bid, &quoter.ask, quoter.placed_skew)
        {
            let skew_ok = !skew_moved_enough(
                placed_skew,
                pair.skew,
                gamma,
                sigma2,
                self.risk.max_position_per_market,
                self.cfg.hysteresis_frac,
                quoter.tick,
            );
            let prices_ok = (bid.price - pair.bid).abs() <= self.cfg.requote_tolerance
                && (ask.price - pair.ask).abs() <= self.cfg.requote_tolerance;
            if skew_ok && prices_ok {
                return;
            }
        }

        self.replace_quotes(asset_id, pair, now).await;
    }

    /// Cancel-then-place: the brief naked window beats doubled inventory.
    async fn replace_quotes(&mut self, asset_id: &str, pair: QuotePair, now: Instant) {
        let (market_id, old_ids) = match self.quoters.get(asset_id) {
            Some(q) => (q.market_id.clone(), q.resting_ids()),
            None => return,
        };

        for id in old_ids {
            let _ = self.gateway.cancel_order(&id).await;
        }
        if let Some(q) = self.quoters.get_mut(asset_id) {
            q.clear_slots();
        }

        let size = self.cfg.quote_size;
        let bid_req = OrderRequest {
            asset_id: asset_id.to_string(),
            market_id: market_id.clone(),
            side: Side::Buy,
            price: pair.bid,
            size,
            tif: Tif::Gtc,
            post_only: true,
            origin: Origin::Mm,
            basket_id: None,
        };
        let ask_req = OrderRequest {
            side: Side::Sell,
            price: pair.ask,
            ..bid_req.clone()
        };

        let bid_order = match self.gateway.place_order(bid_req).await {
            Ok(o) => Some(o),
            Err(e) if e.is_rejection() => {
                debug!("bid rejected for {}: {}", asset_id, e);
                None
            }
            Err(e) => {
                warn!("bid placement failed for {}: {}", asset_id, e);
                None
            }
        };
        let ask_order = match self.gateway.place_order(ask_req).await {
            Ok(o) => Some(o),
            Err(e) if e.is_rejection() => {
                debug!("ask rejected for {}: {}", asset_id, e);
                None
            }
            Err(e) => {
                warn!("ask placement failed for {}: {}", asset_id, e);
                None
            }
        };

        if let (Some(b), Some(a)) = (&bid_order, &ask_order) {
            self.gateway.pair_quotes(&b.id, &a.id);
        }

        if let Some(q) = self.quoters.get_mut(asset_id) {
            q.bid = bid_order.map(|o| QuoteSlot {
                order_id: o.id,
                price: o.price,
                placed_at: now,
            });
            q.ask = ask_order.map(|o| QuoteSlot {
                order_id: o.id,
                price: o.price,
                placed_at: now,
            });
            q.placed_skew = Some(pair.skew);
            q.last_quote_at = Some(now);
        }
    }

    async fn pull_quotes(&mut self, asset_id: &str, reason: &str) {
        let ids = match self.quoters.get(asset_id) {
            Some(q) if !q.resting_ids().is_empty() => q.resting_ids(),
            _ => return,
        };
        info!("🪓 pulling {} quotes on {} ({})", ids.len(), asset_id, reason);
        for id in ids {
            let _ = self.gateway.cancel_order(&id).await;
        }
        if let Some(q) = self.quoters.get_mut(asset_id) {
            q.clear_slots();
        }
    }

    // ─────────────────────────────────────────────────
    // Fills
    // ─────────────────────────────────────────────────

    async fn on_fill(&mut self, fill: FillNotice) {
        if fill.origin != Origin::Mm {
            return;
        }
        let now = Instant::now();
        let obi = self
            .cache
            .get(&fill.asset_id, now)
            .and_then(|b| b.obi());

        let tripped = {
            let quoter = match self.quoters.get_mut(&fill.asset_id) {
                Some(q) => q,
                None => return,
            };
            quoter.markout.record_fill(fill.side, fill.price, now);
            // The gateway already cancelled the opposite quote; drop the
            // slot that just filled from local tracking.
            if quoter
                .bid
                .as_ref()
                .map(|s| s.order_id == fill.order_id)
                .unwrap_or(false)
            {
                quoter.bid = None;
                quoter.ask = None;
            } else if quoter
                .ask
                .as_ref()
                .map(|s| s.order_id == fill.order_id)
                .unwrap_or(false)
            {
                quoter.ask = None;
                quoter.bid = None;
            }
            quoter.reactive.on_fill(now, obi)
        };

        if tripped {
            warn!(
                "🚨 toxic-flow breaker tripped on {} — flash-cancel + {}s silence",
                fill.asset_id, self.cfg.silence_secs,
            );
            // Flash-cancel every resting order on this asset, ours first.
            let ids: Vec<String> = self
                .gateway
                .open_orders()
                .into_iter()
                .filter(|o| o.asset_id == fill.asset_id && o.origin == Origin::Mm)
                .map(|o| o.id)
                .collect();
            for id in ids {
                let _ = self.gateway.cancel_order(&id).await;
            }
            if let Some(q) = self.quoters.get_mut(&fill.asset_id) {
                q.clear_slots();
            }
            self.publish_inventory();
            return;
        }

        // Re-quote with the new inventory skew.
        if let Some(snap) = self.cache.get(&fill.asset_id, now) {
            let tick = BookTick::from_snapshot(&snap);
            self.requote(&fill.asset_id, &tick, now).await;
        }
        self.publish_inventory();
    }

    // ─────────────────────────────────────────────────
    // Janitor
    // ─────────────────────────────────────────────────

    async fn on_janitor_tick(&mut self) {
        let now = Instant::now();
        let ttl = Duration::from_secs(self.cfg.order_ttl_secs);

        let assets: Vec<String> = self.quoters.keys().cloned().collect();
        for asset in assets {
            // Resolve due markouts against the live mid.
            if let Some(mid) = self.cache.get(&asset, now).and_then(|b| b.mid()) {
                if let Some(q) = self.quoters.get_mut(&asset) {
                    q.markout.resolve_due(now, mid);
                }
            }

            // Reconcile slots with the gateway: orders that went terminal
            // elsewhere (defense mode, flash-cancel) leave stale slots.
            let (mut expired, mut vanished) = (Vec::new(), Vec::new());
            if let Some(q) = self.quoters.get(&asset) {
                for slot in q.bid.iter().chain(q.ask.iter()) {
                    match self.gateway.order_state(&slot.order_id) {
                        None => vanished.push(slot.order_id.clone()),
                        Some(s) if s.is_terminal() => vanished.push(slot.order_id.clone()),
                        Some(_) if now.duration_since(slot.placed_at) >= ttl => {
                            expired.push(slot.order_id.clone())
                        }
                        Some(_) => {}
                    }
                }
            }

            // Quote TTL: stale quotes are free money for toxic flow.
            for id in &expired {
                debug!("⏳ quote {} past TTL — cancelling", id);
                let _ = self.gateway.cancel_order(id).await;
            }
            if !expired.is_empty() || !vanished.is_empty() {
                if let Some(q) = self.quoters.get_mut(&asset) {
                    let gone = |slot: &Option<QuoteSlot>| {
                        slot.as_ref()
                            .map(|s| {
                                expired.contains(&s.order_id) || vanished.contains(&s.order_id)
                            })
                            .unwrap_or(false)
                    };
                    if gone(&q.bid) {
                        q.bid = None;
                    }
                    if gone(&q.ask) {
                        q.ask = None;
                    }
                    if q.bid.is_none() && q.ask.is_none() {
                        q.placed_skew = None;
                    }
                }
            }
        }

        self.publish_inventory();
    }

    /// Export per-market signed shares for the arb scorer (read-only).
    fn publish_inventory(&self) {
        let mut export = InventoryExport::new();
        for (asset, quoter) in &self.quoters {
            let shares = self.inventory.position_shares(asset);
            if !shares.is_zero() {
                export
                    .entry(quoter.market_id.clone())
                    .or_default()
                    .insert(asset.clone(), shares);
            }
        }
        self.publisher.publish(export);
    }
}

#[async_trait::async_trait]
impl crate::Strategy for MarketMaker {
    fn name(&self) -> &'static str {
        "market-making"
    }

    async fn run(self: Box<Self>, shutdown: watch::Receiver<bool>) {
        MarketMaker::run(*self, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::Blacklist;
    use crate::config::Config;
    use crate::coordinator::inventory_channel;
    use crate::market_data::book::PriceLevel;
    use crate::market_data::cache::BookData;
    use crate::market_data::rest::VenueRest;
    use crate::rate_limit::RateLimiter;
    use crate::types::{Outcome, UserEventKind, UserOrderEvent};
    use rust_decimal_macros::dec;

    struct Fixture {
        mm: MarketMaker,
        gateway: Arc<ExecutionGateway>,
        inventory: Arc<Inventory>,
        cache: Arc<StateCache>,
        book_tx: mpsc::Sender<BookTick>,
        fill_tx: mpsc::Sender<FillNotice>,
    }

    fn fixture() -> Fixture {
        let mut cfg = Config::default();
        cfg.dry_run = true;
        cfg.risk.max_position_per_market = dec!(500);
        cfg.risk.capital_cap = dec!(10000);
        cfg.risk.daily_volume_limit = dec!(100000);

        let rest = Arc::new(VenueRest::new(&cfg.data, None, true));
        let limiter = Arc::new(RateLimiter::new(&cfg.limits));
        let inventory = Arc::new(Inventory::new(&cfg.mm));
        let blacklist = Arc::new(Blacklist::new(&cfg.blacklist));
        let cache = Arc::new(StateCache::new(Duration::from_secs(60)));
        let gateway = Arc::new(ExecutionGateway::new(
            &cfg,
            rest,
            limiter,
            inventory.clone(),
            blacklist,
            cache.clone(),
        ));

        let (_cw, tunables) = crate::config::ConfigWatch::new(cfg.tunables());
        let (publisher, _view) = inventory_channel();
        let (book_tx, book_rx) = mpsc::channel(64);
        let (fill_tx, fill_rx) = mpsc::channel(64);

        let mut mm = MarketMaker::new(
            cfg.mm.clone(),
            cfg.risk.clone(),
            tunables,
            gateway.clone(),
            inventory.clone(),
            cache.clone(),
            publisher,
            book_rx,
            fill_rx,
        );
        mm.add_market(&test_market());

        Fixture {
            mm,
            gateway,
            inventory,
            cache,
            book_tx,
            fill_tx,
        }
    }

    fn test_market() -> Market {
        Market {
            id: "mkt-x".into(),
            slug: "asset-x".into(),
            question: "X?".into(),
            description: String::new(),
            tick_size: dec!(0.01),
            min_order_notional: dec!(1),
            active: true,
            closed: false,
            enable_order_book: true,
            end_date: None,
            liquidity: dec!(20000),
            volume_24h: dec!(8000),
            tag_ids: vec![],
            outcomes: vec![
                Outcome {
                    asset_id: "x".into(),
                    label: "Yes".into(),
                },
                Outcome {
                    asset_id: "x-no".into(),
                    label: "No".into(),
                },
            ],
        }
    }

    /// Mirror the dispatcher: mutate the cache, hand the snapshot to the MM.
    fn seed_book(cache: &StateCache, asset: &str, bid: Decimal, ask: Decimal) -> BookTick {
        let data = BookData {
            asset_id: asset.to_string(),
            market_id: "mkt-x".to_string(),
            bids: vec![PriceLevel {
                price: bid,
                size: dec!(100),
            }],
            asks: vec![PriceLevel {
                price: ask,
                size: dec!(100),
            }],
            server_ts: None,
            hash: None,
        };
        cache.subscribe(&[asset.to_string()]);
        let snap = cache.test_apply_book(data, Instant::now());
        BookTick::from_snapshot(&snap)
    }

    #[tokio::test]
    async fn test_quotes_placed_on_book_update() {
        let mut f = fixture();
        let tick = seed_book(&f.cache, "x", dec!(0.49), dec!(0.51));
        f.mm.on_book(tick).await;

        let open = f.gateway.open_orders();
        assert_eq!(open.len(), 2);
        let bid = open.iter().find(|o| o.side == Side::Buy).unwrap();
        let ask = open.iter().find(|o| o.side == Side::Sell).unwrap();
        assert!(bid.price < ask.price);
        assert!(bid.post_only && ask.post_only);
    }

    #[tokio::test]
    async fn test_predictive_guard_pulls_quotes() {
        let mut f = fixture();
        let tick = seed_book(&f.cache, "x", dec!(0.49), dec!(0.51));
        f.mm.on_book(tick).await;
        assert_eq!(f.gateway.open_orders().len(), 2);

        // Heavily imbalanced top of book: micro diverges from mid > 1%.
        let data = BookData {
            asset_id: "x".into(),
            market_id: "mkt-x".into(),
            bids: vec![PriceLevel {
                price: dec!(0.40),
                size: dec!(1000),
            }],
            asks: vec![PriceLevel {
                price: dec!(0.60),
                size: dec!(1),
            }],
            server_ts: None,
            hash: None,
        };
        let mut snap = BookSnapshot::new("x", "mkt-x", Instant::now());
        snap.replace(data.bids.clone(), data.asks.clone(), None, None, Instant::now());
        let tick = BookTick::from_snapshot(&snap);

        // Get past the per-asset throttle.
        if let Some(q) = f.mm.quoters.get_mut("x") {
            q.last_quote_at = Some(Instant::now() - Duration::from_secs(5));
        }
        f.mm.on_book(tick).await;
        assert_eq!(f.gateway.open_orders().len(), 0);
    }

    #[tokio::test]
    async fn test_reactive_breaker_silences_quoting() {
        // Scenario S4: rapid fills + one-sided book → flash-cancel, then a
        // cooling window during which quote attempts do nothing.
        let mut f = fixture();
        // One-sided book: OBI = (900-100)/1000 = 0.8… make it > 0.8.
        let data = BookData {
            asset_id: "x".into(),
            market_id: "mkt-x".into(),
            bids: vec![PriceLevel {
                price: dec!(0.49),
                size: dec!(950),
            }],
            asks: vec![PriceLevel {
                price: dec!(0.51),
                size: dec!(50),
            }],
            server_ts: None,
            hash: None,
        };
        f.cache.test_apply_book(data, Instant::now());

        let mut tripped = false;
        for i in 0..6 {
            let fill = FillNotice {
                order_id: format!("f{i}"),
                asset_id: "x".into(),
                market_id: "mkt-x".into(),
                side: Side::Buy,
                price: dec!(0.49),
                size: dec!(10),
                origin: Origin::Mm,
            };
            f.mm.on_fill(fill).await;
            if f.mm.quoters.get("x").unwrap().reactive.is_silent(Instant::now()) {
                tripped = true;
                break;
            }
        }
        assert!(tripped, "breaker should trip on the 6th fill");

        // During silence a book update places nothing.
        let tick = seed_book(&f.cache, "x", dec!(0.49), dec!(0.51));
        if let Some(q) = f.mm.quoters.get_mut("x") {
            q.last_quote_at = None;
        }
        f.mm.on_book(tick).await;
        assert_eq!(f.gateway.open_orders().len(), 0);
    }

    #[tokio::test]
    async fn test_fill_requotes_with_inventory_skew() {
        // Scenario S3 tail: after a bid fill the quotes recompute with the
        // new inventory skew.
        let mut f = fixture();
        // Give σ² something to work with.
        let t0 = Instant::now();
        for i in 0..30u64 {
            let v = if i % 2 == 0 { dec!(0.49) } else { dec!(0.52) };
            f.inventory.record_mid("x", v, t0 + Duration::from_millis(i * 100));
        }

        let tick = seed_book(&f.cache, "x", dec!(0.49), dec!(0.51));
        f.mm.on_book(tick).await;
        let before = f.gateway.open_orders();
        let before_bid = before.iter().find(|o| o.side == Side::Buy).unwrap().price;

        // Fill the resting bid through the gateway path (updates inventory,
        // cancels the opposite), then notify the MM.
        let bid_id = before
            .iter()
            .find(|o| o.side == Side::Buy)
            .unwrap()
            .id
            .clone();
        f.gateway
            .handle_user_event(UserOrderEvent {
                kind: UserEventKind::Update,
                order_id: bid_id.clone(),
                asset_id: "x".into(),
                market_id: "mkt-x".into(),
                side: Side::Buy,
                price: dec!(0.49),
                size_matched: dec!(50),
                ts: Instant::now(),
            })
            .await;
        assert_eq!(f.inventory.position_shares("x"), dec!(50));

        if let Some(q) = f.mm.quoters.get_mut("x") {
            q.last_quote_at = None;
        }
        f.mm.on_fill(FillNotice {
            order_id: bid_id,
            asset_id: "x".into(),
            market_id: "mkt-x".into(),
            side: Side::Buy,
            price: dec!(0.49),
            size: dec!(50),
            origin: Origin::Mm,
        })
        .await;

        let after = f.gateway.open_orders();
        assert_eq!(after.len(), 2, "a fresh pair is placed");
        let after_bid = after.iter().find(|o| o.side == Side::Buy).unwrap().price;
        // Long 50 shares skews the reservation down.
        assert!(after_bid <= before_bid);
        let _ = f.book_tx;
        let _ = f.fill_tx;
    }

    #[tokio::test]
    async fn test_janitor_cancels_expired_quotes() {
        let mut f = fixture();
        let tick = seed_book(&f.cache, "x", dec!(0.49), dec!(0.51));
        f.mm.on_book(tick).await;
        assert_eq!(f.gateway.open_orders().len(), 2);

        // Age the slots past the TTL.
        if let Some(q) = f.mm.quoters.get_mut("x") {
            let old = Instant::now() - Duration::from_secs(30);
            if let Some(b) = &mut q.bid {
                b.placed_at = old;
            }
            if let Some(a) = &mut q.ask {
                a.placed_at = old;
            }
        }
        f.mm.on_janitor_tick().await;
        assert_eq!(f.gateway.open_orders().len(), 0);
        let q = f.mm.quoters.get("x").unwrap();
        assert!(q.bid.is_none() && q.ask.is_none());
    }

    #[tokio::test]
    async fn test_hysteresis_keeps_stable_quotes() {
        let mut f = fixture();
        let tick = seed_book(&f.cache, "x", dec!(0.49), dec!(0.51));
        f.mm.on_book(tick.clone()).await;
        let first: Vec<String> = f.gateway.open_orders().iter().map(|o| o.id.clone()).collect();
        assert_eq!(first.len(), 2);

        // Same book again after the throttle window: nothing moved, the
        // standing orders survive.
        if let Some(q) = f.mm.quoters.get_mut("x") {
            q.last_quote_at = Some(Instant::now() - Duration::from_secs(5));
        }
        f.mm.on_book(tick).await;
        let second: Vec<String> = f.gateway.open_orders().iter().map(|o| o.id.clone()).collect();
        assert_eq!(first.len(), second.len());
        for id in &first {
            assert!(second.contains(id), "order {id} was needlessly replaced");
        }
    }
}
