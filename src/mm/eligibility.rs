//! Tier-1 market eligibility funnel.
//!
//! Runs against the candidate list after the blacklist. A market passes
//! every layer or is dropped; each rejection logs the triggering layer with
//! identifiers, each acceptance logs the measured values.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::EligibilityConfig;
use crate::market_data::book::BookSnapshot;
use crate::types::Market;

/// Which funnel layer rejected the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectLayer {
    TimeHorizon,
    NotBinary,
    Status,
    Liquidity,
    Microstructure,
    VolumeRatio,
    Category,
    Sizing,
}

impl std::fmt::Display for RejectLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectLayer::TimeHorizon => "time-horizon",
            RejectLayer::NotBinary => "not-binary",
            RejectLayer::Status => "status",
            RejectLayer::Liquidity => "liquidity",
            RejectLayer::Microstructure => "microstructure",
            RejectLayer::VolumeRatio => "volume-ratio",
            RejectLayer::Category => "category",
            RejectLayer::Sizing => "sizing",
        };
        write!(f, "{s}")
    }
}

/// Measured values of an accepted market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EligibilityReport {
    pub liquidity: Decimal,
    pub relative_spread: Decimal,
    pub volume_ratio: Decimal,
}

/// Evaluate the eight layers in order. `book` is the live (or freshly
/// rehydrated) snapshot of the market's primary outcome; `capital` decides
/// whether the small-account liquidity fallback is in play.
pub fn evaluate(
    cfg: &EligibilityConfig,
    market: &Market,
    book: Option<&BookSnapshot>,
    capital: Decimal,
    now: DateTime<Utc>,
) -> Result<EligibilityReport, RejectLayer> {
    let result = evaluate_inner(cfg, market, book, capital, now);
    match &result {
        Ok(report) => info!(
            "✅ tier-1 pass {} ({}) liq={} spread={} vol_ratio={}",
            market.id, market.slug, report.liquidity, report.relative_spread, report.volume_ratio,
        ),
        Err(layer) => debug!(
            "🚫 tier-1 reject {} ({}) layer={}",
            market.id, market.slug, layer,
        ),
    }
    result
}

fn evaluate_inner(
    cfg: &EligibilityConfig,
    market: &Market,
    book: Option<&BookSnapshot>,
    capital: Decimal,
    now: DateTime<Utc>,
) -> Result<EligibilityReport, RejectLayer> {
    // 1. Time horizon.
    match market.end_date {
        Some(end) if end > now && end - now <= Duration::days(cfg.horizon_days) => {}
        _ => return Err(RejectLayer::TimeHorizon),
    }

    // 2. Binary: exactly two outcomes.
    if market.outcomes.len() != 2 {
        return Err(RejectLayer::NotBinary);
    }

    // 3. Status.
    if !market.active || market.closed || !market.enable_order_book {
        return Err(RejectLayer::Status);
    }

    // 4. Dynamic liquidity. Small accounts get the fallback floor only on
    //    priority categories.
    let small_account = capital < cfg.small_account_capital;
    let text = market.search_text();
    let priority = cfg
        .priority_keywords
        .iter()
        .any(|k| text.contains(&k.to_lowercase()));
    let floor = if small_account && priority {
        cfg.small_account_liquidity_min
    } else {
        cfg.liquidity_min
    };
    if market.liquidity < floor {
        return Err(RejectLayer::Liquidity);
    }

    // 5. Microstructure quality needs a book.
    let book = book.ok_or(RejectLayer::Microstructure)?;
    let (best_bid, best_ask, mid, spread) = match (
        book.best_bid(),
        book.best_ask(),
        book.mid(),
        book.spread(),
    ) {
        (Some(b), Some(a), Some(m), Some(s)) if m > Decimal::ZERO => (b, a, m, s),
        _ => return Err(RejectLayer::Microstructure),
    };
    let relative_spread = spread / mid;
    if relative_spread > cfg.max_spread_pct
        || best_bid.price <= cfg.extreme_low
        || best_ask.price >= cfg.extreme_high
    {
        return Err(RejectLayer::Microstructure);
    }

    // 6. Volume-to-liquidity ratio.
    let volume_ratio = if market.liquidity > Decimal::ZERO {
        market.volume_24h / market.liquidity
    } else {
        Decimal::ZERO
    };
    if volume_ratio < cfg.volume_liquidity_ratio {
        return Err(RejectLayer::VolumeRatio);
    }

    // 7. Category match (empty target set passes; server-side filtering
    //    already applied upstream).
    if !cfg.target_tag_ids.is_empty()
        && !market.tag_ids.iter().any(|t| cfg.target_tag_ids.contains(t))
    {
        return Err(RejectLayer::Category);
    }

    // 8. Risk-adjusted sizing.
    if market.tick_size > cfg.max_tick || market.min_order_notional > cfg.max_min_order_notional {
        return Err(RejectLayer::Sizing);
    }

    Ok(EligibilityReport {
        liquidity: market.liquidity,
        relative_spread,
        volume_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::book::PriceLevel;
    use crate::types::Outcome;
    use rust_decimal_macros::dec;
    use std::time::Instant;

    fn market() -> Market {
        Market {
            id: "m1".into(),
            slug: "btc-above-100k".into(),
            question: "Bitcoin above 100k?".into(),
            description: "crypto market".into(),
            tick_size: dec!(0.01),
            min_order_notional: dec!(5),
            active: true,
            closed: false,
            enable_order_book: true,
            end_date: Some(Utc::now() + Duration::days(30)),
            liquidity: dec!(20000),
            volume_24h: dec!(8000),
            tag_ids: vec![21],
            outcomes: vec![
                Outcome {
                    asset_id: "yes".into(),
                    label: "Yes".into(),
                },
                Outcome {
                    asset_id: "no".into(),
                    label: "No".into(),
                },
            ],
        }
    }

    fn book(bid: Decimal, ask: Decimal) -> BookSnapshot {
        let mut b = BookSnapshot::new("yes", "m1", Instant::now());
        b.replace(
            vec![PriceLevel {
                price: bid,
                size: dec!(100),
            }],
            vec![PriceLevel {
                price: ask,
                size: dec!(100),
            }],
            None,
            None,
            Instant::now(),
        );
        b
    }

    fn cfg() -> EligibilityConfig {
        EligibilityConfig::default()
    }

    #[test]
    fn test_accepts_healthy_market() {
        let b = book(dec!(0.49), dec!(0.50));
        let report = evaluate(&cfg(), &market(), Some(&b), dec!(500), Utc::now()).unwrap();
        assert_eq!(report.liquidity, dec!(20000));
        assert_eq!(report.volume_ratio, dec!(0.4));
    }

    #[test]
    fn test_rejects_far_settlement() {
        let mut m = market();
        m.end_date = Some(Utc::now() + Duration::days(120));
        let b = book(dec!(0.49), dec!(0.50));
        assert_eq!(
            evaluate(&cfg(), &m, Some(&b), dec!(500), Utc::now()),
            Err(RejectLayer::TimeHorizon)
        );
    }

    #[test]
    fn test_rejects_non_binary() {
        let mut m = market();
        m.outcomes.pop();
        let b = book(dec!(0.49), dec!(0.50));
        assert_eq!(
            evaluate(&cfg(), &m, Some(&b), dec!(500), Utc::now()),
            Err(RejectLayer::NotBinary)
        );
    }

    #[test]
    fn test_rejects_closed_market() {
        let mut m = market();
        m.closed = true;
        let b = book(dec!(0.49), dec!(0.50));
        assert_eq!(
            evaluate(&cfg(), &m, Some(&b), dec!(500), Utc::now()),
            Err(RejectLayer::Status)
        );
    }

    #[test]
    fn test_small_account_fallback_only_on_priority() {
        let mut m = market();
        m.liquidity = dec!(6000);
        m.volume_24h = dec!(3000);
        let b = book(dec!(0.49), dec!(0.50));

        // $500 account: the $15k floor applies.
        assert_eq!(
            evaluate(&cfg(), &m, Some(&b), dec!(500), Utc::now()),
            Err(RejectLayer::Liquidity)
        );
        // $50 account on a crypto market: the $5k fallback applies.
        assert!(evaluate(&cfg(), &m, Some(&b), dec!(50), Utc::now()).is_ok());

        // Same small account, non-priority market text: no fallback.
        m.slug = "obscure-event".into();
        m.question = "Something else?".into();
        m.description = String::new();
        assert_eq!(
            evaluate(&cfg(), &m, Some(&b), dec!(50), Utc::now()),
            Err(RejectLayer::Liquidity)
        );
    }

    #[test]
    fn test_rejects_wide_spread_and_extremes() {
        let m = market();
        // 0.40/0.60 → relative spread 0.4, way past 3%.
        let wide = book(dec!(0.40), dec!(0.60));
        assert_eq!(
            evaluate(&cfg(), &m, Some(&wide), dec!(500), Utc::now()),
            Err(RejectLayer::Microstructure)
        );
        // Best bid pinned at the extreme.
        let pinned = book(dec!(0.02), dec!(0.03));
        assert_eq!(
            evaluate(&cfg(), &m, Some(&pinned), dec!(500), Utc::now()),
            Err(RejectLayer::Microstructure)
        );
        // No book at all.
        assert_eq!(
            evaluate(&cfg(), &m, None, dec!(500), Utc::now()),
            Err(RejectLayer::Microstructure)
        );
    }

    #[test]
    fn test_rejects_low_volume_ratio() {
        let mut m = market();
        m.volume_24h = dec!(1000); // 5% of liquidity, below 25%
        let b = book(dec!(0.49), dec!(0.50));
        assert_eq!(
            evaluate(&cfg(), &m, Some(&b), dec!(500), Utc::now()),
            Err(RejectLayer::VolumeRatio)
        );
    }

    #[test]
    fn test_category_filter() {
        let mut c = cfg();
        c.target_tag_ids = vec![7];
        let m = market(); // tagged 21
        let b = book(dec!(0.49), dec!(0.50));
        assert_eq!(
            evaluate(&c, &m, Some(&b), dec!(500), Utc::now()),
            Err(RejectLayer::Category)
        );
        c.target_tag_ids = vec![21];
        assert!(evaluate(&c, &m, Some(&b), dec!(500), Utc::now()).is_ok());
    }

    #[test]
    fn test_rejects_coarse_tick() {
        let mut m = market();
        m.tick_size = dec!(0.1);
        let b = book(dec!(0.49), dec!(0.50));
        assert_eq!(
            evaluate(&cfg(), &m, Some(&b), dec!(500), Utc::now()),
            Err(RejectLayer::Sizing)
        );
    }
}
