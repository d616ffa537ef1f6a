//! Inventory manager: per-asset positions, realised P&L, and the dynamic
//! risk-aversion input to the quoting model.
//!
//! Fills are the single source of truth for position changes; they arrive
//! here only via the execution gateway's user-channel path. Average entry
//! uses VWAP blending; realised P&L is recognised on the closing portion of
//! a fill.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rust_decimal::{Decimal, MathematicalOps};
use tracing::info;

use crate::types::Side;

// ─────────────────────────────────────────────────────────
// Position record
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Position {
    /// Signed share count: positive long, negative short.
    pub shares: Decimal,
    pub avg_price: Decimal,
    pub first_entry: Option<Instant>,
    pub realized_pnl: Decimal,
    pub last_fill_price: Option<Decimal>,
}

impl Position {
    /// Apply one fill. Returns the realised P&L delta of the closing
    /// portion (zero when the fill only extends exposure).
    fn apply(&mut self, side: Side, size: Decimal, price: Decimal, now: Instant) -> Decimal {
        let delta = size * side.sign();
        let mut realized = Decimal::ZERO;

        let same_direction = self.shares.is_zero() || (self.shares * delta) > Decimal::ZERO;
        if same_direction {
            // Extending: VWAP blend of entry price.
            let new_shares = self.shares + delta;
            if !new_shares.is_zero() {
                self.avg_price =
                    (self.shares.abs() * self.avg_price + size * price) / new_shares.abs();
            }
            self.shares = new_shares;
        } else {
            // Reducing (possibly flipping through zero).
            let closing = size.min(self.shares.abs());
            let direction = if self.shares > Decimal::ZERO {
                Decimal::ONE
            } else {
                -Decimal::ONE
            };
            realized = (price - self.avg_price) * closing * direction;
            self.realized_pnl += realized;
            self.shares += delta;

            if self.shares.is_zero() {
                self.avg_price = Decimal::ZERO;
            } else if self.shares * direction < Decimal::ZERO {
                // Flipped through zero: remainder opens at the fill price.
                self.avg_price = price;
            }
        }

        if self.first_entry.is_none() && !self.shares.is_zero() {
            self.first_entry = Some(now);
        }
        if self.shares.is_zero() {
            self.first_entry = None;
        }
        self.last_fill_price = Some(price);
        realized
    }
}

// ─────────────────────────────────────────────────────────
// Mid-price windows for σ and γ
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct MidHistory {
    short: VecDeque<(Instant, Decimal)>,
    long: VecDeque<(Instant, Decimal)>,
    last_long_sample: Option<Instant>,
}

impl MidHistory {
    fn new() -> Self {
        Self {
            short: VecDeque::new(),
            long: VecDeque::new(),
            last_long_sample: None,
        }
    }

    fn push(&mut self, mid: Decimal, now: Instant, short_win: Duration, long_win: Duration) {
        self.short.push_back((now, mid));
        evict(&mut self.short, now, short_win);

        // Long window is downsampled to one point per second so a day of
        // history stays bounded.
        let due = self
            .last_long_sample
            .map(|t| now.duration_since(t) >= Duration::from_secs(1))
            .unwrap_or(true);
        if due {
            self.long.push_back((now, mid));
            self.last_long_sample = Some(now);
            evict(&mut self.long, now, long_win);
        }
    }
}

fn evict(window: &mut VecDeque<(Instant, Decimal)>, now: Instant, span: Duration) {
    let cutoff = now.checked_sub(span).unwrap_or(now);
    while let Some((ts, _)) = window.front() {
        if *ts < cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn std_dev(window: &VecDeque<(Instant, Decimal)>) -> Option<Decimal> {
    if window.len() < 2 {
        return None;
    }
    let n = Decimal::from(window.len());
    let mean = window.iter().map(|(_, v)| *v).sum::<Decimal>() / n;
    let var = window
        .iter()
        .map(|(_, v)| {
            let d = *v - mean;
            d * d
        })
        .sum::<Decimal>()
        / n;
    var.sqrt()
}

// ─────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────

pub struct Inventory {
    positions: RwLock<HashMap<String, Position>>,
    mids: RwLock<HashMap<String, MidHistory>>,
    gamma_base: Decimal,
    gamma_max: Decimal,
    short_window: Duration,
    long_window: Duration,
}

impl Inventory {
    pub fn new(cfg: &crate::config::MmConfig) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            mids: RwLock::new(HashMap::new()),
            gamma_base: cfg.gamma_base,
            gamma_max: cfg.gamma_max,
            short_window: Duration::from_secs(cfg.sigma_short_window_secs),
            long_window: Duration::from_secs(cfg.sigma_long_window_secs),
        }
    }

    /// Apply a fill and return the realised P&L delta. A position that
    /// returns to zero is recorded and kept as a closed entry.
    pub fn update_fill(
        &self,
        asset_id: &str,
        side: Side,
        size: Decimal,
        price: Decimal,
        now: Instant,
    ) -> Decimal {
        let mut positions = self.positions.write();
        let pos = positions.entry(asset_id.to_string()).or_default();
        let had_shares = !pos.shares.is_zero();
        let realized = pos.apply(side, size, price, now);

        if had_shares && pos.shares.is_zero() {
            info!(
                "📦 position closed {} realized={}",
                asset_id, pos.realized_pnl,
            );
        }
        realized
    }

    pub fn get_position(&self, asset_id: &str) -> Option<Position> {
        self.positions.read().get(asset_id).cloned()
    }

    pub fn position_shares(&self, asset_id: &str) -> Decimal {
        self.positions
            .read()
            .get(asset_id)
            .map(|p| p.shares)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn get_all_positions(&self) -> HashMap<String, Position> {
        self.positions.read().clone()
    }

    /// Record a mid-price observation for the σ windows.
    pub fn record_mid(&self, asset_id: &str, mid: Decimal, now: Instant) {
        let mut mids = self.mids.write();
        mids.entry(asset_id.to_string())
            .or_insert_with(MidHistory::new)
            .push(mid, now, self.short_window, self.long_window);
    }

    /// Short-window mid variance σ², the volatility input to quoting.
    pub fn short_sigma2(&self, asset_id: &str, now: Instant) -> Decimal {
        let mut mids = self.mids.write();
        match mids.get_mut(asset_id) {
            Some(h) => {
                evict(&mut h.short, now, self.short_window);
                std_dev(&h.short).map(|s| s * s).unwrap_or(Decimal::ZERO)
            }
            None => Decimal::ZERO,
        }
    }

    /// Dynamic risk-aversion γ = γ_base · (1 + σ_short/σ_long), capped at
    /// γ_max. Either window empty (or flat σ_long) falls back to γ_base.
    pub fn dynamic_gamma(&self, asset_id: &str, now: Instant) -> Decimal {
        let mut mids = self.mids.write();
        let history = match mids.get_mut(asset_id) {
            Some(h) => h,
            None => return self.gamma_base,
        };
        evict(&mut history.short, now, self.short_window);
        evict(&mut history.long, now, self.long_window);

        let (short, long) = match (std_dev(&history.short), std_dev(&history.long)) {
            (Some(s), Some(l)) if l > Decimal::ZERO => (s, l),
            _ => return self.gamma_base,
        };
        let gamma = self.gamma_base * (Decimal::ONE + short / long);
        gamma.min(self.gamma_max)
    }
}
