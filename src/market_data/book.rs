//! Per-asset order-book snapshot with cached derived values.
//!
//! Snapshots are replaced wholesale on `book` frames and mutated level by
//! level on `price_change` frames (size = 0 removes). Every mutation
//! recomputes the derived values, micro-price included, so readers never
//! pay for it.

use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Copy, Default)]
struct Derived {
    best_bid: Option<PriceLevel>,
    best_ask: Option<PriceLevel>,
    mid: Option<Decimal>,
    spread: Option<Decimal>,
    obi: Option<Decimal>,
    micro_price: Option<Decimal>,
}

/// Live order book for one asset. Bids descending, asks ascending.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub asset_id: String,
    pub market_id: String,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    /// Monotonic server timestamp from the frame, used for ordering checks.
    pub server_ts: Option<u64>,
    pub hash: Option<String>,
    pub last_trade: Option<Decimal>,
    pub last_update: Instant,
    derived: Derived,
}

impl BookSnapshot {
    pub fn new(asset_id: &str, market_id: &str, now: Instant) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            market_id: market_id.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            server_ts: None,
            hash: None,
            last_trade: None,
            last_update: now,
            derived: Derived::default(),
        }
    }

    /// Wholesale replace from a `book` frame. Input levels may arrive in
    /// any order; they are sorted here.
    pub fn replace(
        &mut self,
        mut bids: Vec<PriceLevel>,
        mut asks: Vec<PriceLevel>,
        server_ts: Option<u64>,
        hash: Option<String>,
        now: Instant,
    ) {
        bids.retain(|l| l.size > Decimal::ZERO);
        asks.retain(|l| l.size > Decimal::ZERO);
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        self.bids = bids;
        self.asks = asks;
        self.server_ts = server_ts;
        self.hash = hash;
        self.last_update = now;
        self.recompute();
    }

    /// Apply one `price_change` delta. `size == 0` removes the level.
    pub fn apply_delta(&mut self, side: Side, price: Decimal, size: Decimal, now: Instant) {
        let (levels, descending) = match side {
            Side::Buy => (&mut self.bids, true),
            Side::Sell => (&mut self.asks, false),
        };

        match levels.iter().position(|l| l.price == price) {
            Some(idx) if size.is_zero() => {
                levels.remove(idx);
            }
            Some(idx) => levels[idx].size = size,
            None if !size.is_zero() => {
                let idx = levels
                    .iter()
                    .position(|l| {
                        if descending {
                            l.price < price
                        } else {
                            l.price > price
                        }
                    })
                    .unwrap_or(levels.len());
                levels.insert(idx, PriceLevel { price, size });
            }
            None => {}
        }

        self.last_update = now;
        self.recompute();
    }

    pub fn set_last_trade(&mut self, price: Decimal, now: Instant) {
        self.last_trade = Some(price);
        self.last_update = now;
    }

    fn recompute(&mut self) {
        let best_bid = self.bids.first().copied();
        let best_ask = self.asks.first().copied();

        let (mid, spread, micro) = match (best_bid, best_ask) {
            (Some(b), Some(a)) => {
                let two = Decimal::TWO;
                let mid = (b.price + a.price) / two;
                let spread = a.price - b.price;
                let depth = b.size + a.size;
                let micro = if depth > Decimal::ZERO {
                    Some((b.size * a.price + a.size * b.price) / depth)
                } else {
                    None
                };
                (Some(mid), Some(spread), micro)
            }
            _ => (None, None, None),
        };

        let bid_depth: Decimal = self.bids.iter().map(|l| l.size).sum();
        let ask_depth: Decimal = self.asks.iter().map(|l| l.size).sum();
        let total = bid_depth + ask_depth;
        let obi = if total > Decimal::ZERO {
            Some((bid_depth - ask_depth) / total)
        } else {
            None
        };

        self.derived = Derived {
            best_bid,
            best_ask,
            mid,
            spread,
            obi,
            micro_price: micro,
        };
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.derived.best_bid
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.derived.best_ask
    }

    pub fn mid(&self) -> Option<Decimal> {
        self.derived.mid
    }

    pub fn spread(&self) -> Option<Decimal> {
        self.derived.spread
    }

    /// Order-book imbalance (Σbid − Σask)/Σ across all levels.
    pub fn obi(&self) -> Option<Decimal> {
        self.derived.obi
    }

    /// Volume-weighted mid reflecting top-of-book imbalance.
    pub fn micro_price(&self) -> Option<Decimal> {
        self.derived.micro_price
    }

    pub fn bids(&self) -> &[PriceLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[PriceLevel] {
        &self.asks
    }

    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.duration_since(self.last_update) > threshold
    }
}
