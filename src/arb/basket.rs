//! Best-effort atomic basket execution.
//!
//! The venue has no native multi-leg primitive, so atomicity is a
//! five-phase protocol: pre-flight validation, concurrent FOK placement
//! under one basket id, fill polling to a deadline, all-or-abort
//! resolution (cancel survivors in parallel, emergency-close anything that
//! filled), and a cooldown with a consecutive-failure breaker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ArbConfig;
use crate::error::BreakerScope;
use crate::gateway::ExecutionGateway;
use crate::market_data::cache::StateCache;
use crate::types::{OrderRequest, OrderState, Origin, Side, Tif};

use super::scanner::ArbOpportunity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    GatewayHalted,
    InsufficientDepth(String),
    SlippageBound(String),
    BudgetExhausted,
    PlacementFailed(String),
    LegsNotFilled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::GatewayHalted => write!(f, "gateway halted"),
            AbortReason::InsufficientDepth(leg) => write!(f, "insufficient depth leg {leg}"),
            AbortReason::SlippageBound(leg) => write!(f, "slippage bound breached leg {leg}"),
            AbortReason::BudgetExhausted => write!(f, "arbitrage budget exhausted"),
            AbortReason::PlacementFailed(why) => write!(f, "placement failed: {why}"),
            AbortReason::LegsNotFilled => write!(f, "legs not filled by deadline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasketOutcome {
    /// All legs filled; capital spent and expected profit recorded.
    Success {
        shares: Decimal,
        capital: Decimal,
        expected_profit: Decimal,
    },
    Aborted(AbortReason),
}

pub struct BasketExecutor {
    cfg: ArbConfig,
    gateway: Arc<ExecutionGateway>,
    cache: Arc<StateCache>,
    budget_remaining: Decimal,
    consecutive_failures: u32,
    paused_until: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl BasketExecutor {
    pub fn new(cfg: ArbConfig, gateway: Arc<ExecutionGateway>, cache: Arc<StateCache>) -> Self {
        let budget = cfg.budget;
        Self {
            cfg,
            gateway,
            cache,
            budget_remaining: budget,
            consecutive_failures: 0,
            paused_until: None,
            last_attempt: None,
        }
    }

    pub fn budget_remaining(&self) -> Decimal {
        self.budget_remaining
    }

    /// Cooldown and breaker gate. The scanner checks this before handing
    /// over an opportunity.
    pub fn can_attempt(&self, now: Instant) -> bool {
        if self.budget_remaining <= Decimal::ZERO {
            return false;
        }
        if let Some(until) = self.paused_until {
            if now < until {
                return false;
            }
        }
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < Duration::from_secs(self.cfg.cooldown_secs) {
                return false;
            }
        }
        true
    }

    pub async fn execute(&mut self, opp: &ArbOpportunity) -> BasketOutcome {
        self.last_attempt = Some(Instant::now());
        let outcome = self.run_protocol(opp).await;
        match &outcome {
            BasketOutcome::Success {
                shares,
                capital,
                expected_profit,
            } => {
                self.consecutive_failures = 0;
                self.budget_remaining -= *capital;
                info!(
                    "💰 basket success {}: {} share-sets for {}, expected profit {}, budget left {}",
                    opp.event_id, shares, capital, expected_profit, self.budget_remaining,
                );
            }
            BasketOutcome::Aborted(reason) => {
                self.consecutive_failures += 1;
                warn!(
                    "🧯 basket abort {} ({}): {} consecutive",
                    opp.event_id, reason, self.consecutive_failures,
                );
                if self.consecutive_failures >= self.cfg.max_consecutive_failures {
                    let pause = Duration::from_secs(self.cfg.breaker_pause_secs);
                    self.paused_until = Some(Instant::now() + pause);
                    self.consecutive_failures = 0;
                    warn!(
                        "⛔ circuit breaker tripped ({}) — scanner paused {:?}",
                        BreakerScope::ConsecutiveArbFails,
                        pause,
                    );
                }
            }
        }
        outcome
    }

    async fn run_protocol(&mut self, opp: &ArbOpportunity) -> BasketOutcome {
        // ── Phase 1: pre-flight ──
        let (shares, live_asks) = match self.preflight(opp, Instant::now()) {
            Ok(p) => p,
            Err(reason) => return BasketOutcome::Aborted(reason),
        };
        let capital = opp.effective_sum * shares;

        // ── Phase 2: concurrent placement ──
        let basket_id = Uuid::new_v4();
        let placements = opp.legs.iter().zip(live_asks.iter()).map(|(leg, ask)| {
            let req = OrderRequest {
                asset_id: leg.asset_id.clone(),
                market_id: leg.market_id.clone(),
                side: Side::Buy,
                price: *ask + self.cfg.max_slippage_per_leg,
                size: shares,
                tif: Tif::Fok,
                post_only: false,
                origin: Origin::Arb,
                basket_id: Some(basket_id),
            };
            self.gateway.place_order(req)
        });
        let results = futures::future::join_all(placements).await;

        let mut leg_ids = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(order) => leg_ids.push(order.id),
                Err(e) => first_error = first_error.or(Some(e.to_string())),
            }
        }
        if let Some(why) = first_error {
            self.unwind(&leg_ids).await;
            return BasketOutcome::Aborted(AbortReason::PlacementFailed(why));
        }

        // ── Phase 3: fill monitoring ──
        let deadline = Instant::now() + Duration::from_secs(self.cfg.order_timeout_secs);
        let all_filled = loop {
            let states: Vec<Option<OrderState>> =
                leg_ids.iter().map(|id| self.gateway.order_state(id)).collect();

            if states
                .iter()
                .all(|s| matches!(s, Some(OrderState::Filled)))
            {
                break true;
            }
            if states.iter().any(|s| {
                matches!(s, Some(OrderState::Cancelled) | Some(OrderState::Rejected) | None)
            }) {
                break false;
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.order_check_interval_ms)).await;
        };

        // ── Phase 4: resolution ──
        if all_filled {
            BasketOutcome::Success {
                shares,
                capital,
                expected_profit: opp.net_profit_per_share * shares,
            }
        } else {
            self.unwind(&leg_ids).await;
            BasketOutcome::Aborted(AbortReason::LegsNotFilled)
        }
    }

    /// Sizing + live re-validation of every leg. Returns the share count
    /// (budget-clipped) and the live ask per leg.
    fn preflight(
        &self,
        opp: &ArbOpportunity,
        now: Instant,
    ) -> Result<(Decimal, Vec<Decimal>), AbortReason> {
        if self.gateway.is_halted() {
            return Err(AbortReason::GatewayHalted);
        }

        let mut live_asks = Vec::with_capacity(opp.legs.len());
        let mut live_max_shares = opp.max_shares;
        for leg in &opp.legs {
            let snap = self
                .cache
                .get(&leg.asset_id, now)
                .ok_or_else(|| AbortReason::InsufficientDepth(leg.asset_id.clone()))?;
            let ask = snap
                .best_ask()
                .ok_or_else(|| AbortReason::InsufficientDepth(leg.asset_id.clone()))?;
            if ask.size < self.cfg.min_depth {
                return Err(AbortReason::InsufficientDepth(leg.asset_id.clone()));
            }
            if (ask.price - leg.ask_price).abs() > self.cfg.max_slippage_per_leg {
                return Err(AbortReason::SlippageBound(leg.asset_id.clone()));
            }
            live_max_shares = live_max_shares.min(ask.size);
            live_asks.push(ask.price);
        }

        // Budget sizing: shares = floor(cap / S), bounded by displayed
        // depth.
        let cap = self.budget_remaining.min(self.cfg.per_basket_cap);
        if cap <= Decimal::ZERO || opp.effective_sum <= Decimal::ZERO {
            return Err(AbortReason::BudgetExhausted);
        }
        let affordable = (cap / opp.effective_sum).floor();
        let shares = live_max_shares.min(affordable);
        if shares < Decimal::ONE {
            return Err(AbortReason::BudgetExhausted);
        }

        Ok((shares, live_asks))
    }

    /// Abort path: cancel every still-open leg in parallel (2 s hard
    /// deadline each), then emergency-close any leg that filled anyway
    /// with an IOC sell at the touch.
    async fn unwind(&self, leg_ids: &[String]) {
        let cancel_deadline = Duration::from_secs(self.cfg.cancel_deadline_secs);
        let cancels = leg_ids.iter().map(|id| {
            let gateway = self.gateway.clone();
            let id = id.clone();
            async move {
                let open = matches!(
                    gateway.order_state(&id),
                    Some(OrderState::Open) | Some(OrderState::PartiallyFilled)
                );
                if open {
                    let _ = tokio::time::timeout(cancel_deadline, gateway.cancel_order(&id)).await;
                }
            }
        });
        futures::future::join_all(cancels).await;

        // Emergency liquidation of filled legs: the 2–5% cost here is the
        // price of the venue's missing atomic primitive.
        for id in leg_ids {
            let filled = self.gateway.filled_quantity(id);
            if filled <= Decimal::ZERO {
                continue;
            }
            let order = match self.gateway.lookup_order(id) {
                Some(o) => o,
                None => {
                    warn!("emergency close: order {} not retrievable, skipping", id);
                    continue;
                }
            };
            let now = Instant::now();
            let touch = self
                .cache
                .get(&order.asset_id, now)
                .and_then(|b| b.best_bid())
                .map(|b| b.price)
                .unwrap_or(order.price);
            warn!(
                "🚑 emergency IOC close {} {}@{}",
                order.asset_id, filled, touch,
            );
            let req = OrderRequest {
                asset_id: order.asset_id.clone(),
                market_id: order.market_id.clone(),
                side: Side::Sell,
                price: touch,
                size: filled,
                tif: Tif::Ioc,
                post_only: false,
                origin: Origin::Arb,
                basket_id: order.basket_id,
            };
            if let Err(e) = self.gateway.place_order(req).await {
                warn!("emergency close failed for {}: {}", order.asset_id, e);
            }
        }
    }
}
