//! Ask-sum arbitrage scanner.
//!
//! Event-driven: any snapshot update on a subscribed asset schedules a
//! debounced rescan (100 ms) of the event containing it. A scan reads every
//! outcome's best ask from the cache (stale or missing snapshots reject the
//! whole event), computes the ask-sum, and hands viable opportunities to
//! the basket executor ranked by ROI with the cross-strategy netting bonus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::basket::BasketExecutor;
use super::discovery::ArbUniverse;
use crate::config::{ArbConfig, Tunables};
use crate::coordinator::InventoryView;
use crate::market_data::cache::StateCache;
use crate::types::Event;

// ─────────────────────────────────────────────────────────
// Opportunity
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArbLeg {
    pub asset_id: String,
    pub market_id: String,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
}

#[derive(Debug, Clone)]
pub struct ArbOpportunity {
    pub event_id: String,
    pub legs: Vec<ArbLeg>,
    /// Raw ask-sum S = Σ ask_i.
    pub sum_of_asks: Decimal,
    /// Neg-risk normalised sum actually used for profitability.
    pub effective_sum: Decimal,
    pub net_profit_per_share: Decimal,
    /// Displayed-depth bound: min over legs of ask size.
    pub max_shares: Decimal,
    pub required_capital: Decimal,
    /// net profit per unit of capital.
    pub roi: Decimal,
}

/// Per-leg live quote: (ask price, ask size, market id).
pub type LegQuote = (Decimal, Decimal, String);

/// Evaluate one event. `lookup` yields a *fresh* best ask per asset, or
/// `None` for stale/missing books; any gap rejects the event outright.
pub fn evaluate_event(
    event: &Event,
    lookup: impl Fn(&str) -> Option<LegQuote>,
    threshold: Decimal,
    taker_fee: Decimal,
    min_profit: Decimal,
) -> Option<ArbOpportunity> {
    let mut legs = Vec::new();
    for outcome in event.outcomes() {
        if outcome.is_placeholder() {
            return None;
        }
        let (ask_price, ask_size, market_id) = lookup(&outcome.asset_id)?;
        if ask_price <= Decimal::ZERO || ask_size <= Decimal::ZERO {
            return None;
        }
        legs.push(ArbLeg {
            asset_id: outcome.asset_id.clone(),
            market_id,
            ask_price,
            ask_size,
        });
    }
    if legs.len() < 2 {
        return None;
    }

    let sum: Decimal = legs.iter().map(|l| l.ask_price).sum();
    // Neg-risk inverse semantics: the profitable side may be 1 − S.
    let effective = if event.neg_risk {
        sum.min(Decimal::ONE - sum)
    } else {
        sum
    };

    if effective >= threshold {
        return None;
    }

    let n = Decimal::from(legs.len());
    let gross = Decimal::ONE - effective;
    let fees = effective * taker_fee * n;
    let net = gross - fees;
    if net <= min_profit {
        return None;
    }

    let max_shares = legs
        .iter()
        .map(|l| l.ask_size)
        .min()
        .expect("legs checked non-empty");
    let required_capital = effective * max_shares;
    let roi = if effective > Decimal::ZERO {
        net / effective
    } else {
        Decimal::ZERO
    };

    Some(ArbOpportunity {
        event_id: event.id.clone(),
        legs,
        sum_of_asks: sum,
        effective_sum: effective,
        net_profit_per_share: net,
        max_shares,
        required_capital,
        roi,
    })
}

/// Cross-strategy score: ROI plus a bonus proportional to the absolute MM
/// exposure the basket would neutralise (buying outcomes the MM is net
/// short).
pub fn score_opportunity(
    opp: &ArbOpportunity,
    view: &InventoryView,
    netting_bonus: Decimal,
) -> Decimal {
    let mut netted = Decimal::ZERO;
    for leg in &opp.legs {
        let exposure = view.asset_exposure(&leg.market_id, &leg.asset_id);
        if exposure < Decimal::ZERO {
            netted += opp.max_shares.min(-exposure);
        }
    }
    opp.roi * (Decimal::ONE + netting_bonus * netted)
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

pub struct ArbScanner {
    cfg: ArbConfig,
    tunables: watch::Receiver<Tunables>,
    universe: ArbUniverse,
    cache: Arc<StateCache>,
    view: InventoryView,
    executor: BasketExecutor,
    /// Touched asset ids from the dispatch handler.
    touched_rx: mpsc::Receiver<String>,
    /// event_id → scheduled scan time (the debounce).
    pending: HashMap<String, Instant>,
}

impl ArbScanner {
    pub fn new(
        cfg: ArbConfig,
        tunables: watch::Receiver<Tunables>,
        universe: ArbUniverse,
        cache: Arc<StateCache>,
        view: InventoryView,
        executor: BasketExecutor,
        touched_rx: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            cfg,
            tunables,
            universe,
            cache,
            view,
            executor,
            touched_rx,
            pending: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "🔎 arb scanner started | events={} assets={} debounce={}ms",
            self.universe.events.len(),
            self.universe.asset_to_event.len(),
            self.cfg.debounce_ms,
        );

        let mut sweep = tokio::time::interval(Duration::from_millis(25));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(asset_id) = self.touched_rx.recv() => {
                    self.schedule(&asset_id, Instant::now());
                }
                _ = sweep.tick() => {
                    self.scan_due(Instant::now()).await;
                }
            }
        }

        info!("🔎 arb scanner shutting down");
    }

    /// Debounce: the first touch schedules a scan; further touches inside
    /// the window ride along with it.
    fn schedule(&mut self, asset_id: &str, now: Instant) {
        if let Some(event_id) = self.universe.asset_to_event.get(asset_id) {
            self.pending
                .entry(event_id.clone())
                .or_insert(now + Duration::from_millis(self.cfg.debounce_ms));
        }
    }

    async fn scan_due(&mut self, now: Instant) {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        if due.is_empty() {
            return;
        }
        for id in &due {
            self.pending.remove(id);
        }

        let tunables = *self.tunables.borrow();
        let mut viable = Vec::new();
        for event_id in due {
            let event = match self.universe.events.get(&event_id) {
                Some(e) => e,
                None => continue,
            };
            let cache = &self.cache;
            let lookup = |asset_id: &str| -> Option<LegQuote> {
                let snap = cache.get(asset_id, now)?;
                let ask = snap.best_ask()?;
                Some((ask.price, ask.size, snap.market_id.clone()))
            };
            if let Some(opp) = evaluate_event(
                event,
                lookup,
                tunables.arb_threshold,
                self.cfg.taker_fee,
                tunables.arb_min_profit,
            ) {
                debug!(
                    "💡 {}: S={} net/share={} max_shares={}",
                    opp.event_id, opp.sum_of_asks, opp.net_profit_per_share, opp.max_shares,
                );
                let score = score_opportunity(&opp, &self.view, self.cfg.netting_bonus);
                viable.push((score, opp));
            }
        }
        if viable.is_empty() {
            return;
        }

        // Highest score first; one execution attempt per sweep, the
        // executor's cooldown gates the rest.
        viable.sort_by(|a, b| b.0.cmp(&a.0));
        let (score, best) = &viable[0];
        if self.executor.can_attempt(now) {
            info!(
                "🏹 executing {} score={} roi={} capital={}",
                best.event_id, score, best.roi, best.required_capital,
            );
            self.executor.execute(best).await;
        }
    }
}

#[async_trait::async_trait]
impl crate::Strategy for ArbScanner {
    fn name(&self) -> &'static str {
        "arbitrage"
    }

    async fn run(self: Box<Self>, shutdown: watch::Receiver<bool>) {
        ArbScanner::run(*self, shutdown).await
    }
}
