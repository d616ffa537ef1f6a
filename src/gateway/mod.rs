//! Execution gateway: the single choke-point for every placement and
//! cancellation.
//!
//! Every order passes validate → rate-limit → send → record. The halted
//! state is checked at the top of `validate`, so no strategy logic can
//! bypass it. Cancellations are always allowed, halted or not.
//!
//! Fills are applied only from the user-channel path (`handle_user_event`);
//! the gateway never synthesises fills from POST responses. On a fill of a
//! paired MM quote, the opposite resting quote is cancelled *before* the
//! fill touches inventory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::blacklist::Blacklist;
use crate::config::{Config, RiskConfig};
use crate::error::{ApiError, BreakerScope, EngineError, EngineResult, TradingError};
use crate::inventory::Inventory;
use crate::market_data::cache::StateCache;
use crate::market_data::rest::VenueRest;
use crate::rate_limit::{EndpointClass, RateLimiter};
use crate::types::{
    Fill, Order, OrderRequest, OrderState, Origin, PostOrderRequest, Side, Tif, UserEventKind,
    UserOrderEvent,
};

// ─────────────────────────────────────────────────────────
// Notifications to strategies
// ─────────────────────────────────────────────────────────

/// A confirmed fill, forwarded to the MM actor after inventory is updated.
#[derive(Debug, Clone)]
pub struct FillNotice {
    pub order_id: String,
    pub asset_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub origin: Origin,
}

// ─────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────

/// Per-market metadata registered by the strategies at selection time so
/// validation can check tick alignment and venue minimums.
#[derive(Debug, Clone, Copy)]
pub struct MarketMeta {
    pub tick_size: Decimal,
    pub min_order_notional: Decimal,
}

#[derive(Debug, Default)]
struct GatewayState {
    halted: bool,
    flash_in_progress: bool,
    open_orders: HashMap<String, Order>,
    /// MM quote pairing: a fill on one cancels the other first.
    paired: HashMap<String, String>,
    /// Recently-terminal orders kept for pollers and basket unwinding.
    /// Bounded; cleared wholesale when it grows past its cap.
    terminal: HashMap<String, Order>,
    committed_notional: Decimal,
    realized_pnl_today: Decimal,
    volume_today: Decimal,
    day: Option<NaiveDate>,
    loss_warned: bool,
    /// market_id → defense-mode expiry.
    defense: HashMap<String, Instant>,
    market_meta: HashMap<String, MarketMeta>,
}

pub struct ExecutionGateway {
    risk: RiskConfig,
    state: Mutex<GatewayState>,
    rest: Arc<VenueRest>,
    limiter: Arc<RateLimiter>,
    inventory: Arc<Inventory>,
    blacklist: Arc<Blacklist>,
    cache: Arc<StateCache>,
    fill_listener: Mutex<Option<mpsc::Sender<FillNotice>>>,
}

impl ExecutionGateway {
    pub fn new(
        cfg: &Config,
        rest: Arc<VenueRest>,
        limiter: Arc<RateLimiter>,
        inventory: Arc<Inventory>,
        blacklist: Arc<Blacklist>,
        cache: Arc<StateCache>,
    ) -> Self {
        Self {
            risk: cfg.risk.clone(),
            state: Mutex::new(GatewayState::default()),
            rest,
            limiter,
            inventory,
            blacklist,
            cache,
            fill_listener: Mutex::new(None),
        }
    }

    /// MM registers a channel to receive confirmed fills.
    pub fn set_fill_listener(&self, tx: mpsc::Sender<FillNotice>) {
        *self.fill_listener.lock() = Some(tx);
    }

    /// Strategies register market metadata before quoting/executing on it.
    pub fn register_market(&self, market_id: &str, meta: MarketMeta) {
        self.state
            .lock()
            .market_meta
            .insert(market_id.to_string(), meta);
    }

    // ─────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────

    /// Fail-closed validation. On success the order's notional is reserved
    /// against the capital cap; the caller must release it on send failure.
    fn validate_and_reserve(&self, req: &mut OrderRequest, now: Instant) -> EngineResult<()> {
        let mut state = self.state.lock();
        Self::roll_day(&mut state);

        // halted: daily loss breached, or flash-cancel in progress.
        if state.halted {
            return Err(EngineError::CircuitBreakerTripped {
                scope: BreakerScope::Daily,
            });
        }
        if state.flash_in_progress {
            return Err(EngineError::HealthCheckFailed(
                "disconnect recovery in progress".into(),
            ));
        }

        // Inventory defense mode blocks new MM quotes for that market.
        if req.origin == Origin::Mm {
            if let Some(until) = state.defense.get(&req.market_id) {
                if now < *until {
                    return Err(TradingError::InvalidOrder(format!(
                        "inventory defense active for {}",
                        req.market_id
                    ))
                    .into());
                }
                state.defense.remove(&req.market_id);
            }
        }

        if self.blacklist.is_manual(&req.market_id) {
            return Err(
                TradingError::InvalidOrder(format!("market {} blacklisted", req.market_id)).into(),
            );
        }

        // invalid_order: basic shape, venue minimum, tick alignment.
        if req.size <= Decimal::ZERO {
            return Err(TradingError::InvalidOrder("non-positive size".into()).into());
        }
        if let Some(meta) = state.market_meta.get(&req.market_id) {
            if meta.tick_size > Decimal::ZERO && !(req.price % meta.tick_size).is_zero() {
                return Err(TradingError::InvalidOrder(format!(
                    "price {} misaligned to tick {}",
                    req.price, meta.tick_size
                ))
                .into());
            }
            if req.price * req.size < meta.min_order_notional {
                return Err(TradingError::InvalidOrder(format!(
                    "notional below venue minimum {}",
                    meta.min_order_notional
                ))
                .into());
            }
        }

        // price_guard: static bounds plus deviation from the cached mid.
        if req.price < self.risk.min_price || req.price > self.risk.max_price {
            return Err(TradingError::PriceGuard.into());
        }
        let book = self.cache.get(&req.asset_id, now);
        if let Some(mid) = book.as_ref().and_then(|b| b.mid()) {
            if (req.price - mid).abs() > self.risk.entry_price_guard {
                return Err(TradingError::PriceGuard.into());
            }
        }

        // slippage_guard: taker price must not chase past the touch.
        if !req.post_only {
            if let Some(book) = &book {
                let over = match req.side {
                    Side::Buy => book.best_ask().map(|a| req.price - a.price),
                    Side::Sell => book.best_bid().map(|b| b.price - req.price),
                };
                if let Some(over) = over {
                    if over > self.risk.slippage_guard {
                        return Err(TradingError::SlippageExceeded.into());
                    }
                }
            }
        }

        // position_limit: clip or reject past the per-market cap.
        let projected =
            self.inventory.position_shares(&req.asset_id) + req.size * req.side.sign();
        if projected.abs() > self.risk.max_position_per_market {
            if self.risk.clip_oversize_orders {
                let headroom = self.risk.max_position_per_market
                    - (self.inventory.position_shares(&req.asset_id) * req.side.sign());
                if headroom <= Decimal::ZERO {
                    return Err(TradingError::InvalidOrder("position cap reached".into()).into());
                }
                req.size = headroom;
            } else {
                return Err(TradingError::InvalidOrder(format!(
                    "would exceed position cap {}",
                    self.risk.max_position_per_market
                ))
                .into());
            }
        }

        let notional = req.price * req.size;

        // daily_volume_limit.
        if state.volume_today + notional > self.risk.daily_volume_limit {
            return Err(TradingError::InvalidOrder("daily volume limit reached".into()).into());
        }

        // insufficient_balance against the capital cap (open + pending).
        if state.committed_notional + notional > self.risk.capital_cap {
            return Err(TradingError::InsufficientBalance.into());
        }

        state.committed_notional += notional;
        Ok(())
    }

    fn release_notional(&self, amount: Decimal) {
        let mut state = self.state.lock();
        state.committed_notional = (state.committed_notional - amount).max(Decimal::ZERO);
    }

    fn roll_day(state: &mut GatewayState) {
        let today = Utc::now().date_naive();
        if state.day != Some(today) {
            if state.day.is_some() {
                info!(
                    "🌅 UTC day rollover: realized={} volume={} halted={}",
                    state.realized_pnl_today, state.volume_today, state.halted,
                );
            }
            state.day = Some(today);
            state.realized_pnl_today = Decimal::ZERO;
            state.volume_today = Decimal::ZERO;
            state.loss_warned = false;
            state.halted = false;
        }
    }

    // ─────────────────────────────────────────────────
    // Placement
    // ─────────────────────────────────────────────────

    /// Place an order: validate → rate-limit → send → record. Post-only
    /// rejections are retried with a one-tick reprice up to `max_retries`;
    /// exhaustion puts the market into defense mode.
    pub async fn place_order(&self, req: OrderRequest) -> EngineResult<Order> {
        let mut req = req;
        self.validate_and_reserve(&mut req, Instant::now())?;
        let reserved = req.price * req.size;

        let result = self.place_with_retries(&mut req).await;
        if result.is_err() {
            self.release_notional(reserved);
        }
        result
    }

    async fn place_with_retries(&self, req: &mut OrderRequest) -> EngineResult<Order> {
        let tick = self
            .state
            .lock()
            .market_meta
            .get(&req.market_id)
            .map(|m| m.tick_size)
            .unwrap_or_else(|| Decimal::new(1, 2));

        let mut attempt = 0u32;
        let mut throttled = 0u32;
        loop {
            self.limiter.acquire(EndpointClass::OrderPlace).await;

            let client_id = uuid::Uuid::new_v4().to_string();
            let wire = PostOrderRequest {
                client_id: client_id.clone(),
                asset_id: req.asset_id.clone(),
                side: req.side.as_str(),
                price: req.price,
                size: req.size,
                tif: req.tif.as_str(),
                post_only: req.post_only,
            };

            match self.rest.post_order(&wire).await {
                Ok(resp) if req.post_only && resp.is_post_only_reject() => {
                    attempt += 1;
                    if attempt > self.risk.max_retries {
                        self.enter_defense_mode(req).await;
                        return Err(TradingError::OrderRejected(
                            "post-only crossed after retries".into(),
                        )
                        .into());
                    }
                    // Step one tick away from the touch and go again.
                    let delta = tick * Decimal::from(attempt);
                    req.price = match req.side {
                        Side::Buy => req.price - delta,
                        Side::Sell => req.price + delta,
                    };
                    let jitter_ms = 10 + (rand::random::<u64>() % 40);
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                    continue;
                }
                Ok(resp) => {
                    let status = resp.status.to_ascii_lowercase();
                    if status == "rejected" || status == "unmatched" {
                        if req.tif == Tif::Fok {
                            return Err(TradingError::FokNotFilled.into());
                        }
                        return Err(TradingError::OrderRejected(
                            resp.error_msg.unwrap_or(resp.status),
                        )
                        .into());
                    }
                    return Ok(self.record_open(req, resp.order_id));
                }
                Err(EngineError::Api(ApiError::RateLimit)) => {
                    // Venue-side throttle despite the local bucket: requeue
                    // with backoff rather than surfacing to the strategy.
                    throttled += 1;
                    if throttled > 5 {
                        return Err(ApiError::RateLimit.into());
                    }
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(throttled))).await;
                    continue;
                }
                Err(EngineError::Api(ApiError::Timeout)) => {
                    // Ambiguous: probe before assuming absence.
                    warn!("⏱️ POST /order timed out — probing status for {}", client_id);
                    match self.rest.get_order_status(&client_id).await {
                        Ok(Some(status)) => {
                            info!("🔎 probe found order {} — adopting", status.order_id);
                            return Ok(self.record_open(req, status.order_id));
                        }
                        _ => {
                            return Err(TradingError::OrderRejected(
                                "timed out and unknown to venue".into(),
                            )
                            .into());
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_open(&self, req: &OrderRequest, venue_id: String) -> Order {
        let order = Order {
            id: venue_id.clone(),
            asset_id: req.asset_id.clone(),
            market_id: req.market_id.clone(),
            side: req.side,
            price: req.price,
            size: req.size,
            filled: Decimal::ZERO,
            tif: req.tif,
            post_only: req.post_only,
            origin: req.origin,
            basket_id: req.basket_id,
            state: OrderState::Open,
            fills: Vec::new(),
            created_at: Instant::now(),
        };
        self.state.lock().open_orders.insert(venue_id, order.clone());
        info!(
            "📤 open {} {} {}@{} {} {:?}",
            order.id, order.asset_id, order.size, order.price, order.tif.as_str(), order.origin,
        );
        order
    }

    async fn enter_defense_mode(&self, req: &OrderRequest) {
        let until = Instant::now() + Duration::from_secs(self.risk.defense_ttl_secs);
        let quote_ids: Vec<String> = {
            let mut state = self.state.lock();
            state.defense.insert(req.market_id.clone(), until);
            state
                .open_orders
                .values()
                .filter(|o| o.market_id == req.market_id && o.origin == Origin::Mm)
                .map(|o| o.id.clone())
                .collect()
        };
        warn!(
            "🛡️ defense mode for {} ({}s) — cancelling {} resting quotes",
            req.market_id,
            self.risk.defense_ttl_secs,
            quote_ids.len(),
        );
        for id in quote_ids {
            let _ = self.cancel_order(&id).await;
        }
    }

    /// Pair two MM quotes so a fill on one cancels the other first.
    pub fn pair_quotes(&self, bid_id: &str, ask_id: &str) {
        let mut state = self.state.lock();
        state.paired.insert(bid_id.to_string(), ask_id.to_string());
        state.paired.insert(ask_id.to_string(), bid_id.to_string());
    }

    // ─────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────

    /// Cancel is permitted in every gateway state, halted included.
    pub async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        self.limiter.acquire(EndpointClass::OrderCancel).await;
        self.rest.cancel_order(order_id).await?;
        // Remote cancel succeeded: finalize locally.
        self.finalize_order(order_id, OrderState::Cancelled);
        Ok(())
    }

    /// Flash-cancel: cancel every Open order. Placements stay blocked from
    /// the moment this starts until `mark_rehydrated` is called.
    pub async fn flash_cancel_all(&self) {
        let ids: Vec<String> = {
            let mut state = self.state.lock();
            state.flash_in_progress = true;
            state.open_orders.keys().cloned().collect()
        };
        if ids.is_empty() {
            info!("⚡ flash-cancel: no open orders");
            return;
        }
        warn!("⚡ flash-cancel: cancelling {} open orders", ids.len());

        let cancels = ids.iter().map(|id| self.cancel_order(id));
        let results = futures::future::join_all(cancels).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!("⚡ flash-cancel: {} cancels failed (kept tracked)", failed);
        } else {
            info!("⚡ flash-cancel complete");
        }
    }

    /// Called once reconnection + REST rehydration are done; placements
    /// resume.
    pub fn mark_rehydrated(&self) {
        self.state.lock().flash_in_progress = false;
        info!("💧 gateway resumed after rehydration");
    }

    // ─────────────────────────────────────────────────
    // User-channel path
    // ─────────────────────────────────────────────────

    /// Apply one user-channel order event. Fill ordering per asset:
    /// cancel-opposite → inventory → P&L → strategy notification.
    pub async fn handle_user_event(&self, ev: UserOrderEvent) {
        if ev.kind == UserEventKind::Cancellation {
            self.finalize_order(&ev.order_id, OrderState::Cancelled);
            return;
        }

        // Adopt fills for orders we do not know (restart recovery).
        let known = self.state.lock().open_orders.contains_key(&ev.order_id);
        if !known {
            if ev.size_matched > Decimal::ZERO {
                warn!("🫴 adopting unknown order {} from user channel", ev.order_id);
                let adopted = Order {
                    id: ev.order_id.clone(),
                    asset_id: ev.asset_id.clone(),
                    market_id: ev.market_id.clone(),
                    side: ev.side,
                    price: ev.price,
                    size: ev.size_matched,
                    filled: Decimal::ZERO,
                    tif: Tif::Gtc,
                    post_only: false,
                    origin: Origin::Mm,
                    basket_id: None,
                    state: OrderState::Open,
                    fills: Vec::new(),
                    created_at: ev.ts,
                };
                self.state
                    .lock()
                    .open_orders
                    .insert(ev.order_id.clone(), adopted);
            } else {
                return;
            }
        }

        // Diff cumulative size_matched into an incremental fill.
        let (fill_delta, limit_price, opposite, notice) = {
            let mut state = self.state.lock();
            let order = match state.open_orders.get_mut(&ev.order_id) {
                Some(o) => o,
                None => return,
            };
            let delta = ev.size_matched - order.filled;
            if delta <= Decimal::ZERO {
                return;
            }
            order.filled = ev.size_matched;
            let price = if ev.price > Decimal::ZERO {
                ev.price
            } else {
                order.price
            };
            order.fills.push(Fill {
                order_id: order.id.clone(),
                asset_id: order.asset_id.clone(),
                side: order.side,
                size: delta,
                price,
                ts: ev.ts,
            });
            let notice = FillNotice {
                order_id: order.id.clone(),
                asset_id: order.asset_id.clone(),
                market_id: order.market_id.clone(),
                side: order.side,
                price,
                size: delta,
                origin: order.origin,
            };
            order.state = if order.filled >= order.size {
                OrderState::Filled
            } else {
                OrderState::PartiallyFilled
            };
            let limit_price = order.price;
            (delta, limit_price, state.paired.get(&ev.order_id).cloned(), notice)
        };

        // 1. Opposite-side cancel happens before the fill is reflected in
        //    inventory; double-exposure is worse than a naked window.
        if let Some(opposite_id) = opposite {
            info!(
                "✂️ fill on {} — cancelling opposite {} first",
                ev.order_id, opposite_id,
            );
            let _ = self.cancel_order(&opposite_id).await;
        }

        // 2. Inventory, then realised P&L.
        let realized = self.inventory.update_fill(
            &notice.asset_id,
            notice.side,
            fill_delta,
            notice.price,
            ev.ts,
        );
        self.apply_realized(realized, fill_delta * notice.price);

        // 3. Terminal bookkeeping. The filled slice is released at the
        //    limit price it was reserved at; finalize handles the unfilled
        //    remainder on terminal transition.
        self.release_notional(fill_delta * limit_price);
        let done = self
            .state
            .lock()
            .open_orders
            .get(&ev.order_id)
            .map(|o| o.state == OrderState::Filled)
            .unwrap_or(false);
        if done {
            self.finalize_order(&ev.order_id, OrderState::Filled);
        }

        // 4. Strategy notification.
        let listener = self.fill_listener.lock().clone();
        if let Some(tx) = listener {
            let _ = tx.try_send(notice);
        }
    }

    fn apply_realized(&self, realized: Decimal, notional: Decimal) {
        let mut state = self.state.lock();
        Self::roll_day(&mut state);
        state.realized_pnl_today += realized;
        state.volume_today += notional;

        let limit = self.risk.daily_loss_limit;
        let warn_at = -limit * Decimal::new(8, 1);
        if state.realized_pnl_today <= warn_at && !state.loss_warned && !state.halted {
            state.loss_warned = true;
            warn!(
                "⚠️ realized P&L {} approaching daily loss limit -{}",
                state.realized_pnl_today, limit,
            );
        }
        if state.realized_pnl_today <= -limit && !state.halted {
            state.halted = true;
            warn!(
                "🛑 daily loss limit breached ({} ≤ -{}) — gateway halted",
                state.realized_pnl_today, limit,
            );
        }
    }

    fn finalize_order(&self, order_id: &str, terminal: OrderState) {
        let mut state = self.state.lock();
        if let Some(mut order) = state.open_orders.remove(order_id) {
            order.state = terminal;
            let unfilled_notional = order.remaining() * order.price;
            state.committed_notional =
                (state.committed_notional - unfilled_notional).max(Decimal::ZERO);
            if let Some(opposite) = state.paired.remove(order_id) {
                state.paired.remove(&opposite);
            }
            if state.terminal.len() > 4096 {
                state.terminal.clear();
            }
            info!(
                "🏁 {} terminal {:?} filled={}/{}",
                order_id, terminal, order.filled, order.size,
            );
            state.terminal.insert(order_id.to_string(), order);
        }
    }

    // ─────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────

    /// Live state for open orders, retained terminal state afterwards.
    pub fn order_state(&self, order_id: &str) -> Option<OrderState> {
        let state = self.state.lock();
        state
            .open_orders
            .get(order_id)
            .or_else(|| state.terminal.get(order_id))
            .map(|o| o.state)
    }

    /// Open or recently-terminal order by id. Basket resolution uses this
    /// to size and route emergency closes.
    pub fn lookup_order(&self, order_id: &str) -> Option<Order> {
        let state = self.state.lock();
        state
            .open_orders
            .get(order_id)
            .or_else(|| state.terminal.get(order_id))
            .cloned()
    }

    /// Filled quantity, whether the order is still open or already
    /// terminal.
    pub fn filled_quantity(&self, order_id: &str) -> Decimal {
        self.lookup_order(order_id)
            .map(|o| o.filled)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn open_order(&self, order_id: &str) -> Option<Order> {
        self.state.lock().open_orders.get(order_id).cloned()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.state.lock().open_orders.values().cloned().collect()
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().halted
    }

    pub fn realized_pnl_today(&self) -> Decimal {
        self.state.lock().realized_pnl_today
    }

    /// Manual halt clear (operator action).
    pub fn clear_halt(&self) {
        let mut state = self.state.lock();
        state.halted = false;
        state.loss_warned = false;
        info!("🔓 gateway halt cleared manually");
    }

    pub fn defense_active(&self, market_id: &str, now: Instant) -> bool {
        self.state
            .lock()
            .defense
            .get(market_id)
            .map(|until| now < *until)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use rust_decimal_macros::dec;

    fn fixture() -> (Arc<ExecutionGateway>, Arc<Inventory>, Arc<StateCache>) {
        let mut cfg = Config::default();
        cfg.dry_run = true;
        cfg.risk.capital_cap = dec!(500);
        cfg.risk.daily_loss_limit = dec!(50);
        cfg.risk.max_position_per_market = dec!(200);

        let rest = Arc::new(VenueRest::new(&cfg.data, None, true));
        let limiter = Arc::new(RateLimiter::new(&cfg.limits));
        let inventory = Arc::new(Inventory::new(&cfg.mm));
        let blacklist = Arc::new(Blacklist::new(&cfg.blacklist));
        let cache = Arc::new(StateCache::new(cfg.data.stale_after()));
        let gateway = Arc::new(ExecutionGateway::new(
            &cfg,
            rest,
            limiter,
            inventory.clone(),
            blacklist,
            cache.clone(),
        ));
        (gateway, inventory, cache)
    }

    fn request(asset: &str, side: Side, price: Decimal, size: Decimal) -> OrderRequest {
        OrderRequest {
            asset_id: asset.into(),
            market_id: "mkt".into(),
            side,
            price,
            size,
            tif: Tif::Gtc,
            post_only: false,
            origin: Origin::Mm,
            basket_id: None,
        }
    }

    fn fill_event(order_id: &str, asset: &str, side: Side, price: Decimal, matched: Decimal) -> UserOrderEvent {
        UserOrderEvent {
            kind: UserEventKind::Update,
            order_id: order_id.into(),
            asset_id: asset.into(),
            market_id: "mkt".into(),
            side,
            price,
            size_matched: matched,
            ts: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_place_and_track() {
        let (gw, _, _) = fixture();
        let order = gw
            .place_order(request("a", Side::Buy, dec!(0.50), dec!(10)))
            .await
            .unwrap();
        assert_eq!(order.state, OrderState::Open);
        assert_eq!(gw.order_state(&order.id), Some(OrderState::Open));
        assert_eq!(gw.open_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_price_guard_bounds() {
        let (gw, _, _) = fixture();
        let err = gw
            .place_order(request("a", Side::Buy, dec!(0.01), dec!(10)))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Trading(TradingError::PriceGuard));
        let err = gw
            .place_order(request("a", Side::Buy, dec!(0.99), dec!(10)))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Trading(TradingError::PriceGuard));
    }

    #[tokio::test]
    async fn test_capital_cap_enforced() {
        // Invariant I1: open + pending notional stays under the cap.
        let (gw, _, _) = fixture();
        // Five resting orders of 90 notional each commit 450 of the 500 cap.
        for i in 0..5 {
            gw.place_order(request(&format!("a{i}"), Side::Buy, dec!(0.50), dec!(180)))
                .await
                .unwrap();
        }
        // The next 60 notional would push past the cap.
        let err = gw
            .place_order(request("b", Side::Buy, dec!(0.50), dec!(120)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::Trading(TradingError::InsufficientBalance)
        );

        // Cancelling one order releases its reservation.
        let freed = gw.open_orders().into_iter().next().unwrap();
        gw.cancel_order(&freed.id).await.unwrap();
        assert!(gw
            .place_order(request("b", Side::Buy, dec!(0.50), dec!(120)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_position_cap_rejects() {
        // Property P2.
        let (gw, _, _) = fixture();
        let err = gw
            .place_order(request("a", Side::Buy, dec!(0.50), dec!(300)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Trading(TradingError::InvalidOrder(_))
        ));
    }

    #[tokio::test]
    async fn test_daily_loss_halt_blocks_placement_allows_cancel() {
        // Property P1 / scenario S6.
        let (gw, _, _) = fixture();
        let order = gw
            .place_order(request("a", Side::Buy, dec!(0.50), dec!(100)))
            .await
            .unwrap();
        // A resting quote on another asset, to cancel while halted.
        let resting = gw
            .place_order(request("b", Side::Buy, dec!(0.30), dec!(10)))
            .await
            .unwrap();

        // Build a long position, then realise a loss through the limit:
        // buy 100 @ 0.502, sell fills at 0.002 → realised -50.00.
        gw.handle_user_event(fill_event(&order.id, "a", Side::Buy, dec!(0.502), dec!(100)))
            .await;
        let sell = gw
            .place_order(request("a", Side::Sell, dec!(0.05), dec!(100)))
            .await
            .unwrap();
        gw.handle_user_event(fill_event(&sell.id, "a", Side::Sell, dec!(0.002), dec!(100)))
            .await;
        assert!(gw.realized_pnl_today() <= dec!(-50));
        assert!(gw.is_halted());

        // Next placement: CircuitBreakerTripped::Daily, no network call.
        let err = gw
            .place_order(request("a", Side::Buy, dec!(0.50), dec!(10)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::CircuitBreakerTripped {
                scope: BreakerScope::Daily
            }
        );

        // Existing open orders may still be cancelled while halted.
        assert!(gw.cancel_order(&resting.id).await.is_ok());
        assert_eq!(gw.order_state(&resting.id), Some(OrderState::Cancelled));

        gw.clear_halt();
        assert!(!gw.is_halted());
    }

    #[tokio::test]
    async fn test_fill_cancels_opposite_before_inventory() {
        // Property P4 / scenario S3: bid fill cancels the resting ask.
        let (gw, inv, _) = fixture();
        let bid = gw
            .place_order(request("x", Side::Buy, dec!(0.49), dec!(50)))
            .await
            .unwrap();
        let ask = gw
            .place_order(request("x", Side::Sell, dec!(0.51), dec!(50)))
            .await
            .unwrap();
        gw.pair_quotes(&bid.id, &ask.id);

        gw.handle_user_event(fill_event(&bid.id, "x", Side::Buy, dec!(0.49), dec!(50)))
            .await;

        // Ask is gone, position updated.
        assert_eq!(gw.order_state(&ask.id), Some(OrderState::Cancelled));
        assert_eq!(inv.position_shares("x"), dec!(50));
        // Bid reached terminal Filled and left the open set.
        assert_eq!(gw.order_state(&bid.id), Some(OrderState::Filled));
        assert!(gw.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_partial_fill_keeps_order_open() {
        let (gw, inv, _) = fixture();
        let order = gw
            .place_order(request("a", Side::Buy, dec!(0.40), dec!(100)))
            .await
            .unwrap();
        gw.handle_user_event(fill_event(&order.id, "a", Side::Buy, dec!(0.40), dec!(30)))
            .await;
        assert_eq!(gw.order_state(&order.id), Some(OrderState::PartiallyFilled));
        assert_eq!(inv.position_shares("a"), dec!(30));

        // Duplicate frame with the same cumulative match is a no-op.
        gw.handle_user_event(fill_event(&order.id, "a", Side::Buy, dec!(0.40), dec!(30)))
            .await;
        assert_eq!(inv.position_shares("a"), dec!(30));
    }

    #[tokio::test]
    async fn test_unknown_fill_adopted() {
        // §7: fills for unknown orders are adopted to preserve I4.
        let (gw, inv, _) = fixture();
        gw.handle_user_event(fill_event("ghost-1", "a", Side::Buy, dec!(0.30), dec!(20)))
            .await;
        assert_eq!(inv.position_shares("a"), dec!(20));
        // Adopted and fully matched → terminal, no longer open.
        assert_eq!(gw.order_state("ghost-1"), Some(OrderState::Filled));
        assert!(gw.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_flash_cancel_blocks_placements_until_rehydrated() {
        // Property P5 / scenario S5.
        let (gw, _, _) = fixture();
        for i in 0..8 {
            gw.place_order(request(&format!("a{i}"), Side::Buy, dec!(0.50), dec!(10)))
                .await
                .unwrap();
        }
        assert_eq!(gw.open_orders().len(), 8);

        gw.flash_cancel_all().await;
        assert_eq!(gw.open_orders().len(), 0);

        let err = gw
            .place_order(request("a0", Side::Buy, dec!(0.50), dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::HealthCheckFailed(_)));

        gw.mark_rehydrated();
        assert!(gw
            .place_order(request("a0", Side::Buy, dec!(0.50), dec!(10)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_event_finalizes() {
        let (gw, _, _) = fixture();
        let order = gw
            .place_order(request("a", Side::Buy, dec!(0.50), dec!(10)))
            .await
            .unwrap();
        gw.handle_user_event(UserOrderEvent {
            kind: UserEventKind::Cancellation,
            order_id: order.id.clone(),
            asset_id: "a".into(),
            market_id: "mkt".into(),
            side: Side::Buy,
            price: dec!(0.50),
            size_matched: dec!(0),
            ts: Instant::now(),
        })
        .await;
        assert_eq!(gw.order_state(&order.id), Some(OrderState::Cancelled));
        assert!(gw.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_tick_alignment_checked_when_registered() {
        let (gw, _, _) = fixture();
        gw.register_market(
            "mkt",
            MarketMeta {
                tick_size: dec!(0.01),
                min_order_notional: dec!(1),
            },
        );
        let err = gw
            .place_order(request("a", Side::Buy, dec!(0.505), dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Trading(TradingError::InvalidOrder(_))
        ));
        assert!(gw
            .place_order(request("a", Side::Buy, dec!(0.50), dec!(10)))
            .await
            .is_ok());
    }
}
