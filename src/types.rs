//! Core typed records shared across the engine.
//!
//! Venue JSON is converted into these records at the transport edge
//! (`market_data::rest`, `market_data::feed`); interior code never touches
//! raw JSON again.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Instant;

// ─────────────────────────────────────────────────────────
// Order primitives
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// +1 for Buy, -1 for Sell. Used for signed share deltas and markouts.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Time-in-force accepted by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tif {
    Gtc,
    Ioc,
    Fok,
}

impl Tif {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tif::Gtc => "GTC",
            Tif::Ioc => "IOC",
            Tif::Fok => "FOK",
        }
    }
}

/// Which strategy originated an order. The gateway applies per-strategy
/// policy (defense mode blocks Mm quotes only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Mm,
    Arb,
}

/// Order state machine. Terminal states trigger inventory update then
/// removal from the gateway's Open set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

/// A placement request as strategies hand it to the gateway.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub asset_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub tif: Tif,
    pub post_only: bool,
    pub origin: Origin,
    /// Basket correlation id for multi-leg arbitrage orders.
    pub basket_id: Option<uuid::Uuid>,
}

/// One fill applied to an order.
#[derive(Debug, Clone)]
pub struct Fill {
    pub order_id: String,
    pub asset_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub ts: Instant,
}

/// An order as tracked by the execution gateway.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub asset_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled: Decimal,
    pub tif: Tif,
    pub post_only: bool,
    pub origin: Origin,
    pub basket_id: Option<uuid::Uuid>,
    pub state: OrderState,
    pub fills: Vec<Fill>,
    pub created_at: Instant,
}

impl Order {
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }

    pub fn remaining(&self) -> Decimal {
        self.size - self.filled
    }

    pub fn is_expired(&self, now: Instant, ttl: std::time::Duration) -> bool {
        now.duration_since(self.created_at) >= ttl
    }
}

// ─────────────────────────────────────────────────────────
// User-channel order events
// ─────────────────────────────────────────────────────────

/// Subtype of a user-channel `order` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEventKind {
    Placement,
    Update,
    Cancellation,
}

/// Typed user-channel order event, produced by the feed layer and consumed
/// by the execution gateway. `size_matched` is the cumulative matched size
/// for the order; the gateway diffs it against its own tally to derive the
/// incremental fill.
#[derive(Debug, Clone)]
pub struct UserOrderEvent {
    pub kind: UserEventKind,
    pub order_id: String,
    pub asset_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size_matched: Decimal,
    pub ts: Instant,
}

// ─────────────────────────────────────────────────────────
// Market & event catalogue records
// ─────────────────────────────────────────────────────────

/// One tradeable outcome token inside a market.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub asset_id: String,
    /// Display label ("Yes", "Candidate X", …). Empty for neg-risk
    /// placeholder outcomes that have not been named yet.
    pub label: String,
}

impl Outcome {
    pub fn is_placeholder(&self) -> bool {
        self.label.trim().is_empty()
    }
}

/// A binary contract: two opposing assets whose prices sum to 1.0 at
/// settlement.
#[derive(Debug, Clone)]
pub struct Market {
    pub id: String,
    pub slug: String,
    pub question: String,
    pub description: String,
    pub tick_size: Decimal,
    /// Minimum order size in quote currency.
    pub min_order_notional: Decimal,
    pub active: bool,
    pub closed: bool,
    pub enable_order_book: bool,
    pub end_date: Option<DateTime<Utc>>,
    pub liquidity: Decimal,
    pub volume_24h: Decimal,
    pub tag_ids: Vec<u64>,
    pub outcomes: Vec<Outcome>,
}

impl Market {
    /// Searchable text for the blacklist keyword scan and the small-account
    /// priority-category match.
    pub fn search_text(&self) -> String {
        let mut s = String::with_capacity(
            self.slug.len() + self.question.len() + self.description.len() + 2,
        );
        s.push_str(&self.slug);
        s.push(' ');
        s.push_str(&self.question);
        s.push(' ');
        s.push_str(&self.description);
        s.to_lowercase()
    }
}

/// A mutually-exclusive group of markets with N ≥ 2 outcomes. Exactly one
/// outcome settles to 1.0. Binary markets are single-market events.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub neg_risk: bool,
    pub markets: Vec<Market>,
}

impl Event {
    /// All outcome tokens across the event's markets, in catalogue order.
    pub fn outcomes(&self) -> Vec<&Outcome> {
        self.markets.iter().flat_map(|m| m.outcomes.iter()).collect()
    }

    /// Named (non-placeholder) outcome count.
    pub fn named_outcome_count(&self) -> usize {
        self.outcomes().iter().filter(|o| !o.is_placeholder()).count()
    }

    pub fn has_placeholder_outcomes(&self) -> bool {
        self.outcomes().iter().any(|o| o.is_placeholder())
    }
}

// ─────────────────────────────────────────────────────────
// Venue wire shapes (REST edge only)
// ─────────────────────────────────────────────────────────

/// POST /order request body. `client_id` lets the status probe find an
/// order whose POST response was lost to a timeout.
#[derive(Debug, Clone, Serialize)]
pub struct PostOrderRequest {
    pub client_id: String,
    pub asset_id: String,
    pub side: &'static str,
    pub price: Decimal,
    pub size: Decimal,
    pub tif: &'static str,
    pub post_only: bool,
}

/// POST /order response.
#[derive(Debug, Clone, Deserialize)]
pub struct PostOrderResponse {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub error_msg: Option<String>,
}

impl PostOrderResponse {
    /// Venue status strings for a post-only order that would have crossed.
    pub fn is_post_only_reject(&self) -> bool {
        self.status.eq_ignore_ascii_case("unmatched")
            || self
                .error_msg
                .as_deref()
                .map(|m| m.to_ascii_lowercase().contains("cross"))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_sign_and_opposite() {
        assert_eq!(Side::Buy.sign(), dec!(1));
        assert_eq!(Side::Sell.sign(), dec!(-1));
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn test_order_state_terminal() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(!OrderState::Open.is_terminal());
        assert!(!OrderState::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_event_outcome_counting() {
        let market = |outcomes: Vec<(&str, &str)>| Market {
            id: "m".into(),
            slug: "s".into(),
            question: "q".into(),
            description: String::new(),
            tick_size: dec!(0.01),
            min_order_notional: dec!(1),
            active: true,
            closed: false,
            enable_order_book: true,
            end_date: None,
            liquidity: dec!(0),
            volume_24h: dec!(0),
            tag_ids: vec![],
            outcomes: outcomes
                .into_iter()
                .map(|(a, l)| Outcome {
                    asset_id: a.into(),
                    label: l.into(),
                })
                .collect(),
        };

        let event = Event {
            id: "e".into(),
            title: "t".into(),
            neg_risk: true,
            markets: vec![
                market(vec![("a1", "Candidate A")]),
                market(vec![("a2", "Candidate B")]),
                market(vec![("a3", "")]),
            ],
        };
        assert_eq!(event.named_outcome_count(), 2);
        assert!(event.has_placeholder_outcomes());
    }

    #[test]
    fn test_post_only_reject_detection() {
        let resp = PostOrderResponse {
            order_id: "o1".into(),
            status: "UNMATCHED".into(),
            error_msg: None,
        };
        assert!(resp.is_post_only_reject());

        let resp = PostOrderResponse {
            order_id: "o2".into(),
            status: "rejected".into(),
            error_msg: Some("order would cross the book".into()),
        };
        assert!(resp.is_post_only_reject());
    }
}
