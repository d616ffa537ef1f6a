//! Avellaneda-Stoikov quote computation.
//!
//! Reservation price skewed by signed inventory, symmetric half-spread from
//! volatility and order-arrival intensity, then boundary handling for the
//! [0, 1] price space of outcome tokens:
//!
//!   p_r = r − q·γ·σ²
//!   δ   = (γ·σ² + ln(1 + γ/κ)) / 2
//!
//! Near either boundary the spread widens; bid and ask are hard-capped and
//! tick-aligned.

use rust_decimal::{Decimal, MathematicalOps};

#[derive(Debug, Clone, Copy)]
pub struct QuoteInputs {
    /// Reference price: the micro-price from the book snapshot.
    pub reference: Decimal,
    /// Signed inventory in shares.
    pub inventory: Decimal,
    pub gamma: Decimal,
    pub sigma2: Decimal,
    pub kappa: Decimal,
    pub min_spread: Decimal,
    /// Adverse-selection multiplier from the markout tracker (≥ 1).
    pub spread_multiplier: Decimal,
    pub tick: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundaryPolicy {
    pub low: Decimal,
    pub high: Decimal,
    /// Width of the widening band next to each boundary.
    pub band: Decimal,
    pub widen: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotePair {
    pub bid: Decimal,
    pub ask: Decimal,
    /// Inventory skew q·γ·σ² used for hysteresis comparison.
    pub skew: Decimal,
}

fn floor_to_tick(p: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return p;
    }
    (p / tick).floor() * tick
}

fn ceil_to_tick(p: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return p;
    }
    (p / tick).ceil() * tick
}

/// Compute a two-sided quote. Returns `None` when the inputs cannot yield
/// a sane pair (reference outside (0, 1), or the pair inverts after caps).
pub fn compute_quotes(inputs: &QuoteInputs, boundary: &BoundaryPolicy) -> Option<QuotePair> {
    let r = inputs.reference;
    if r <= Decimal::ZERO || r >= Decimal::ONE {
        return None;
    }

    let skew = inputs.inventory * inputs.gamma * inputs.sigma2;
    let reservation = r - skew;

    let intensity = (Decimal::ONE + inputs.gamma / inputs.kappa).ln();
    let mut half_spread = (inputs.gamma * inputs.sigma2 + intensity) / Decimal::TWO;
    half_spread = half_spread.max(inputs.min_spread / Decimal::TWO);
    half_spread *= inputs.spread_multiplier;

    // Inside the band next to either boundary, widen.
    let near_low = r <= boundary.low + boundary.band;
    let near_high = r >= boundary.high - boundary.band;
    if near_low || near_high {
        half_spread *= boundary.widen;
    }

    let mut bid = floor_to_tick(reservation - half_spread, inputs.tick);
    let mut ask = ceil_to_tick(reservation + half_spread, inputs.tick);

    // Hard caps: never bid above 0.98, never offer below 0.02.
    bid = bid.min(boundary.high);
    ask = ask.max(boundary.low);
    // And keep both inside the venue's representable range.
    bid = bid.max(inputs.tick);
    ask = ask.min(Decimal::ONE - inputs.tick);

    if bid >= ask {
        return None;
    }

    Some(QuotePair { bid, ask, skew })
}

/// Skew hysteresis: replacing quotes is worth it only when the
/// inventory-implied skew moved by at least `hysteresis_frac` of the
/// allowed skew range (the skew at the position cap). A flat range falls
/// back to the tick so quoting never deadlocks.
pub fn skew_moved_enough(
    placed_skew: Decimal,
    new_skew: Decimal,
    gamma: Decimal,
    sigma2: Decimal,
    max_position: Decimal,
    hysteresis_frac: Decimal,
    tick: Decimal,
) -> bool {
    let range = (gamma * sigma2 * max_position).abs();
    let threshold = if range > Decimal::ZERO {
        range * hysteresis_frac
    } else {
        tick
    };
    (new_skew - placed_skew).abs() >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inputs(reference: Decimal, inventory: Decimal) -> QuoteInputs {
        QuoteInputs {
            reference,
            inventory,
            gamma: dec!(0.1),
            sigma2: dec!(0.0004),
            kappa: dec!(1.5),
            min_spread: dec!(0.01),
            spread_multiplier: dec!(1),
            tick: dec!(0.01),
        }
    }

    fn boundary() -> BoundaryPolicy {
        BoundaryPolicy {
            low: dec!(0.02),
            high: dec!(0.98),
            band: dec!(0.03),
            widen: dec!(3),
        }
    }

    #[test]
    fn test_flat_inventory_is_symmetric() {
        let pair = compute_quotes(&inputs(dec!(0.50), dec!(0)), &boundary()).unwrap();
        assert_eq!(pair.skew, dec!(0));
        assert!(pair.bid < dec!(0.50));
        assert!(pair.ask > dec!(0.50));
        // Symmetric around the reference, up to tick rounding.
        assert_eq!(dec!(0.50) - pair.bid, pair.ask - dec!(0.50));
    }

    #[test]
    fn test_long_inventory_skews_down() {
        let flat = compute_quotes(&inputs(dec!(0.50), dec!(0)), &boundary()).unwrap();
        let long = compute_quotes(&inputs(dec!(0.50), dec!(200)), &boundary()).unwrap();
        // Long inventory lowers the reservation price: both quotes shift
        // down, inviting sells to us less and buys from us more.
        assert!(long.bid <= flat.bid);
        assert!(long.ask <= flat.ask);
        assert!(long.skew > dec!(0));
    }

    #[test]
    fn test_min_spread_floor() {
        let mut i = inputs(dec!(0.50), dec!(0));
        i.sigma2 = dec!(0); // dead calm
        let pair = compute_quotes(&i, &boundary()).unwrap();
        assert!(pair.ask - pair.bid >= dec!(0.01));
    }

    #[test]
    fn test_boundary_band_widens_spread() {
        let mid = compute_quotes(&inputs(dec!(0.50), dec!(0)), &boundary()).unwrap();
        let near = compute_quotes(&inputs(dec!(0.045), dec!(0)), &boundary());
        // Near 0.02 the spread triples; the pair may not even fit, which
        // also counts as refusing to quote tightly near a boundary.
        if let Some(near) = near {
            assert!(near.ask - near.bid > mid.ask - mid.bid);
        }
    }

    #[test]
    fn test_hard_caps() {
        let mut i = inputs(dec!(0.97), dec!(-500));
        i.sigma2 = dec!(0.001);
        if let Some(pair) = compute_quotes(&i, &boundary()) {
            assert!(pair.bid <= dec!(0.98));
            assert!(pair.ask >= dec!(0.02));
            assert!(pair.bid < pair.ask);
        }
    }

    #[test]
    fn test_degenerate_reference_rejected() {
        assert!(compute_quotes(&inputs(dec!(0), dec!(0)), &boundary()).is_none());
        assert!(compute_quotes(&inputs(dec!(1), dec!(0)), &boundary()).is_none());
    }

    #[test]
    fn test_spread_multiplier_widens() {
        let base = compute_quotes(&inputs(dec!(0.50), dec!(0)), &boundary()).unwrap();
        let mut i = inputs(dec!(0.50), dec!(0));
        i.spread_multiplier = dec!(2);
        let wide = compute_quotes(&i, &boundary()).unwrap();
        assert!(wide.ask - wide.bid > base.ask - base.bid);
    }

    #[test]
    fn test_hysteresis_gate() {
        // Range = 0.1 * 0.0004 * 200 = 0.008; 5% of that is 0.0004.
        let gamma = dec!(0.1);
        let sigma2 = dec!(0.0004);
        let max_pos = dec!(200);
        let frac = dec!(0.05);
        let tick = dec!(0.01);
        assert!(!skew_moved_enough(
            dec!(0.0010),
            dec!(0.0011),
            gamma,
            sigma2,
            max_pos,
            frac,
            tick
        ));
        assert!(skew_moved_enough(
            dec!(0.0010),
            dec!(0.0020),
            gamma,
            sigma2,
            max_pos,
            frac,
            tick
        ));
        // Flat range falls back to the tick threshold.
        assert!(!skew_moved_enough(
            dec!(0),
            dec!(0.001),
            gamma,
            dec!(0),
            max_pos,
            frac,
            tick
        ));
    }
}
