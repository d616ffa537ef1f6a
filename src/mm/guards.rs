//! Toxic-flow guards and the adverse-selection self-tune.
//!
//! Three detectors with distinct actions:
//!  - predictive: micro-price divergence from mid → pull quotes, no cooling
//!  - reactive: fill-velocity + order-book imbalance → flash-cancel and a
//!    silent observation window
//!  - markout self-tune: rolling 5-second markouts widen the spread under
//!    sustained adverse selection and relax it back after clean fills
//!
//! Plus a drift-clamped z-score detector that caps volatility-driven
//! adjustments during manipulation spikes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rust_decimal::{Decimal, MathematicalOps};

use crate::types::Side;

// ─────────────────────────────────────────────────────────
// Predictive guard (pure)
// ─────────────────────────────────────────────────────────

/// True when |micro − mid| / mid exceeds the threshold. A zero threshold
/// disables the guard.
pub fn micro_divergence_toxic(micro: Decimal, mid: Decimal, threshold: Decimal) -> bool {
    if threshold <= Decimal::ZERO || mid <= Decimal::ZERO {
        return false;
    }
    ((micro - mid).abs() / mid) > threshold
}

// ─────────────────────────────────────────────────────────
// Reactive circuit breaker
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ReactiveGuard {
    fills: VecDeque<Instant>,
    window: Duration,
    max_fills: usize,
    obi_threshold: Decimal,
    silence: Duration,
    silent_until: Option<Instant>,
}

impl ReactiveGuard {
    pub fn new(cfg: &crate::config::MmConfig) -> Self {
        Self {
            fills: VecDeque::new(),
            window: Duration::from_secs(cfg.fill_velocity_window_secs),
            max_fills: cfg.fill_velocity_max,
            obi_threshold: cfg.obi_threshold,
            silence: Duration::from_secs(cfg.silence_secs),
            silent_until: None,
        }
    }

    /// Record a fill; returns true when the breaker trips (fill velocity
    /// above the cap while the book is heavily one-sided).
    pub fn on_fill(&mut self, now: Instant, obi: Option<Decimal>) -> bool {
        self.fills.push_back(now);
        self.evict(now);

        let velocity_breached = self.fills.len() > self.max_fills;
        let one_sided = obi.map(|o| o.abs() > self.obi_threshold).unwrap_or(false);

        if velocity_breached && one_sided && !self.is_silent(now) {
            self.silent_until = Some(now + self.silence);
            self.fills.clear();
            return true;
        }
        false
    }

    pub fn is_silent(&self, now: Instant) -> bool {
        self.silent_until.map(|t| now < t).unwrap_or(false)
    }

    fn evict(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        while let Some(front) = self.fills.front() {
            if *front < cutoff {
                self.fills.pop_front();
            } else {
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Markout self-tune
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PendingMarkout {
    side: Side,
    price: Decimal,
    due: Instant,
}

#[derive(Debug)]
pub struct MarkoutTracker {
    horizon: Duration,
    window_len: usize,
    min_fills: usize,
    widen: Decimal,
    cap: Decimal,
    reset_consecutive: usize,
    pending: VecDeque<PendingMarkout>,
    window: VecDeque<Decimal>,
    consecutive_positive: usize,
    multiplier: Decimal,
}

impl MarkoutTracker {
    pub fn new(cfg: &crate::config::MmConfig) -> Self {
        Self {
            horizon: Duration::from_secs(cfg.markout_horizon_secs),
            window_len: cfg.markout_window,
            min_fills: cfg.markout_min_fills,
            widen: cfg.markout_widen,
            cap: cfg.markout_cap,
            reset_consecutive: cfg.markout_reset_consecutive,
            pending: VecDeque::new(),
            window: VecDeque::new(),
            consecutive_positive: 0,
            multiplier: Decimal::ONE,
        }
    }

    pub fn record_fill(&mut self, side: Side, price: Decimal, now: Instant) {
        self.pending.push_back(PendingMarkout {
            side,
            price,
            due: now + self.horizon,
        });
    }

    /// Resolve every due markout against the current mid. markout =
    /// (mid_{t+5s} − fill_price) · side_sign; negative means the market
    /// moved against us after the fill.
    pub fn resolve_due(&mut self, now: Instant, mid: Decimal) {
        while let Some(front) = self.pending.front() {
            if front.due > now {
                break;
            }
            let fill = self.pending.pop_front().expect("front checked");
            let markout = (mid - fill.price) * fill.side.sign();

            self.window.push_back(markout);
            while self.window.len() > self.window_len {
                self.window.pop_front();
            }

            if markout > Decimal::ZERO {
                self.consecutive_positive += 1;
                if self.consecutive_positive >= self.reset_consecutive {
                    self.multiplier = Decimal::ONE;
                    self.consecutive_positive = 0;
                }
            } else {
                self.consecutive_positive = 0;
                if self.window.len() >= self.min_fills && self.mean() < Decimal::ZERO {
                    self.multiplier = (self.multiplier * self.widen).min(self.cap);
                }
            }
        }
    }

    fn mean(&self) -> Decimal {
        if self.window.is_empty() {
            return Decimal::ZERO;
        }
        self.window.iter().sum::<Decimal>() / Decimal::from(self.window.len())
    }

    /// Current spread/skew multiplier, ≥ 1.
    pub fn multiplier(&self) -> Decimal {
        self.multiplier
    }
}

// ─────────────────────────────────────────────────────────
// Drift-clamped z-score
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DriftClamp {
    short: VecDeque<Decimal>,
    long: VecDeque<Decimal>,
    short_len: usize,
    long_len: usize,
    clamp: Decimal,
}

impl DriftClamp {
    pub fn new(cfg: &crate::config::MmConfig) -> Self {
        Self {
            short: VecDeque::new(),
            long: VecDeque::new(),
            short_len: cfg.zscore_short,
            long_len: cfg.zscore_long,
            clamp: cfg.zscore_clamp,
        }
    }

    pub fn push(&mut self, price: Decimal) {
        self.short.push_back(price);
        while self.short.len() > self.short_len {
            self.short.pop_front();
        }
        self.long.push_back(price);
        while self.long.len() > self.long_len {
            self.long.pop_front();
        }
    }

    fn stats(window: &VecDeque<Decimal>) -> Option<(Decimal, Decimal)> {
        if window.len() < 2 {
            return None;
        }
        let n = Decimal::from(window.len());
        let mean = window.iter().sum::<Decimal>() / n;
        let var = window
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<Decimal>()
            / n;
        Some((mean, var.sqrt().unwrap_or(Decimal::ZERO)))
    }

    /// True when the short-window mean has drifted more than `clamp`
    /// long-window deviations away from the long-window mean, the
    /// signature of a manipulation spike rather than organic volatility.
    pub fn drifting(&self) -> bool {
        let (local_mean, _) = match Self::stats(&self.short) {
            Some(s) => s,
            None => return false,
        };
        let (global_mean, global_std) = match Self::stats(&self.long) {
            Some(s) => s,
            None => return false,
        };
        if global_std <= Decimal::ZERO {
            return false;
        }
        ((local_mean - global_mean).abs() / global_std) > self.clamp
    }

    /// Clamp a volatility input while a drift spike is in progress: σ is
    /// capped at `clamp` long-window deviations. Outside a spike the input
    /// passes through untouched.
    pub fn clamp_sigma2(&self, sigma2: Decimal) -> Decimal {
        if !self.drifting() {
            return sigma2;
        }
        match Self::stats(&self.long) {
            Some((_, global_std)) if global_std > Decimal::ZERO => {
                let cap = self.clamp * global_std;
                sigma2.min(cap * cap)
            }
            _ => sigma2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn mm_cfg() -> crate::config::MmConfig {
        crate::config::MmConfig::default()
    }

    #[test]
    fn test_micro_divergence() {
        // 1% threshold: 0.505 vs 0.50 is exactly 1%, not over.
        assert!(!micro_divergence_toxic(dec!(0.505), dec!(0.50), dec!(0.01)));
        assert!(micro_divergence_toxic(dec!(0.506), dec!(0.50), dec!(0.01)));
        assert!(micro_divergence_toxic(dec!(0.494), dec!(0.50), dec!(0.01)));
        // Zero threshold disables the guard.
        assert!(!micro_divergence_toxic(dec!(0.9), dec!(0.5), dec!(0)));
    }

    #[test]
    fn test_reactive_trips_on_velocity_and_obi() {
        // Scenario S4: 6 fills in 8 seconds with OBI +0.85.
        let mut guard = ReactiveGuard::new(&mm_cfg());
        let t0 = Instant::now();
        let obi = Some(dec!(0.85));
        for i in 0..5u64 {
            assert!(!guard.on_fill(t0 + Duration::from_millis(i * 1600), obi));
        }
        // Sixth fill inside the window trips the breaker.
        assert!(guard.on_fill(t0 + Duration::from_secs(8), obi));
        // Silent for the next 30 seconds.
        assert!(guard.is_silent(t0 + Duration::from_secs(9)));
        assert!(guard.is_silent(t0 + Duration::from_secs(37)));
        assert!(!guard.is_silent(t0 + Duration::from_secs(39)));
    }

    #[test]
    fn test_reactive_needs_one_sided_book() {
        let mut guard = ReactiveGuard::new(&mm_cfg());
        let t0 = Instant::now();
        // Same velocity, balanced book: no trip.
        for i in 0..8u64 {
            assert!(!guard.on_fill(t0 + Duration::from_millis(i * 500), Some(dec!(0.2))));
        }
        assert!(!guard.is_silent(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_reactive_window_eviction() {
        let mut guard = ReactiveGuard::new(&mm_cfg());
        let t0 = Instant::now();
        let obi = Some(dec!(0.9));
        // Fills spaced 3s apart never accumulate 6 inside a 10s window.
        for i in 0..20u64 {
            assert!(!guard.on_fill(t0 + Duration::from_secs(i * 3), obi));
        }
    }

    #[test]
    fn test_markout_widen_and_reset() {
        let mut tracker = MarkoutTracker::new(&mm_cfg());
        let t0 = Instant::now();

        // Ten buys at 0.50, all followed by a mid at 0.45: mean markout is
        // firmly negative once the minimum sample count is reached.
        for i in 0..10u64 {
            tracker.record_fill(Side::Buy, dec!(0.50), t0 + Duration::from_millis(i));
        }
        tracker.resolve_due(t0 + Duration::from_secs(6), dec!(0.45));
        assert!(tracker.multiplier() > dec!(1));
        let widened = tracker.multiplier();

        // Ten consecutive positive markouts reset the multiplier.
        for i in 0..10u64 {
            tracker.record_fill(Side::Buy, dec!(0.40), t0 + Duration::from_secs(7 + i));
        }
        tracker.resolve_due(t0 + Duration::from_secs(30), dec!(0.55));
        assert_eq!(tracker.multiplier(), dec!(1));
        assert!(widened > dec!(1));
    }

    #[test]
    fn test_markout_multiplier_caps() {
        let mut tracker = MarkoutTracker::new(&mm_cfg());
        let t0 = Instant::now();
        // Relentless adverse selection: multiplier must stop at the cap.
        for round in 0..30u64 {
            for i in 0..10u64 {
                tracker.record_fill(
                    Side::Buy,
                    dec!(0.50),
                    t0 + Duration::from_secs(round * 10) + Duration::from_millis(i),
                );
            }
            tracker.resolve_due(t0 + Duration::from_secs(round * 10 + 6), dec!(0.40));
        }
        assert_eq!(tracker.multiplier(), dec!(2.5));
    }

    #[test]
    fn test_markout_not_due_not_resolved() {
        let mut tracker = MarkoutTracker::new(&mm_cfg());
        let t0 = Instant::now();
        tracker.record_fill(Side::Buy, dec!(0.50), t0);
        // Two seconds in, the 5-second markout is not due yet.
        tracker.resolve_due(t0 + Duration::from_secs(2), dec!(0.30));
        assert_eq!(tracker.multiplier(), dec!(1));
    }

    #[test]
    fn test_drift_clamp_detects_spike() {
        let mut clamp = DriftClamp::new(&mm_cfg());
        // Long history around 0.50 with mild noise.
        for i in 0..400 {
            let v = if i % 2 == 0 { dec!(0.499) } else { dec!(0.501) };
            clamp.push(v);
        }
        assert!(!clamp.drifting());

        // A violent spike fills the short window far from the long mean.
        for _ in 0..20 {
            clamp.push(dec!(0.80));
        }
        assert!(clamp.drifting());

        // σ² input is capped while drifting.
        let capped = clamp.clamp_sigma2(dec!(1.0));
        assert!(capped < dec!(1.0));
    }

    #[test]
    fn test_drift_clamp_passthrough_when_calm() {
        let mut clamp = DriftClamp::new(&mm_cfg());
        for i in 0..100 {
            let v = if i % 2 == 0 { dec!(0.49) } else { dec!(0.51) };
            clamp.push(v);
        }
        assert!(!clamp.drifting());
        assert_eq!(clamp.clamp_sigma2(dec!(0.0004)), dec!(0.0004));
    }
}
