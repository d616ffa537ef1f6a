//! Central engine configuration.
//!
//! One record of sectioned knobs, constructed once at process start and
//! threaded by reference into the components that need it. Every numeric
//! field is overridable from the environment (`PQ_*`); overrides are
//! range-checked at load. Non-structural tunables can be refreshed at
//! runtime and broadcast over a `watch` channel.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use tokio::sync::watch;

use crate::error::{EngineError, EngineResult};

/// Override `slot` from env var `key` when set and parseable.
fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse::<T>() {
            *slot = parsed;
        }
    }
}

fn env_override_bool(key: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        *slot = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

fn env_override_list(key: &str, slot: &mut Vec<String>) {
    if let Ok(v) = std::env::var(key) {
        *slot = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

// ─────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────

/// Transport endpoints and market-data timing.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub rest_url: String,
    pub ws_base_url: String,
    /// Snapshot older than this is treated as absent.
    pub stale_after_ms: u64,
    pub ping_interval_secs: u64,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    /// A connection clean for this long resets the backoff ladder.
    pub backoff_reset_secs: u64,
    /// Deadline on every awaited REST operation.
    pub api_timeout_secs: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://clob.polymarket.com".into(),
            ws_base_url: "wss://ws-subscriptions-clob.polymarket.com/ws".into(),
            stale_after_ms: 500,
            ping_interval_secs: 5,
            backoff_initial_secs: 1,
            backoff_max_secs: 60,
            backoff_reset_secs: 60,
            api_timeout_secs: 10,
        }
    }
}

impl DataConfig {
    fn apply_env(&mut self) {
        env_override("PQ_REST_URL", &mut self.rest_url);
        env_override("PQ_WS_BASE_URL", &mut self.ws_base_url);
        env_override("PQ_STALE_AFTER_MS", &mut self.stale_after_ms);
        env_override("PQ_API_TIMEOUT_SECS", &mut self.api_timeout_secs);
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Token-bucket parameters per endpoint class.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub place_per_sec: f64,
    pub place_burst: f64,
    pub cancel_per_sec: f64,
    pub cancel_burst: f64,
    pub read_per_sec: f64,
    pub read_burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            place_per_sec: 10.0,
            place_burst: 20.0,
            cancel_per_sec: 25.0,
            cancel_burst: 50.0,
            read_per_sec: 50.0,
            read_burst: 100.0,
        }
    }
}

impl RateLimitConfig {
    fn apply_env(&mut self) {
        env_override("PQ_RATE_PLACE_PER_SEC", &mut self.place_per_sec);
        env_override("PQ_RATE_PLACE_BURST", &mut self.place_burst);
        env_override("PQ_RATE_CANCEL_PER_SEC", &mut self.cancel_per_sec);
        env_override("PQ_RATE_CANCEL_BURST", &mut self.cancel_burst);
        env_override("PQ_RATE_READ_PER_SEC", &mut self.read_per_sec);
        env_override("PQ_RATE_READ_BURST", &mut self.read_burst);
    }
}

/// Global risk limits enforced by the execution gateway.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Sum of open + pending order notional must stay under this.
    pub capital_cap: Decimal,
    pub max_position_per_market: Decimal,
    pub daily_loss_limit: Decimal,
    pub daily_volume_limit: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    /// Max deviation of an entry price from the cached reference mid.
    pub entry_price_guard: Decimal,
    /// Max tolerated effective-fill vs quoted price difference.
    pub slippage_guard: Decimal,
    /// Post-only reprice attempts before entering defense mode.
    pub max_retries: u32,
    pub defense_ttl_secs: u64,
    /// Clip oversized orders down to the position cap instead of rejecting.
    pub clip_oversize_orders: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            capital_cap: dec!(500),
            max_position_per_market: dec!(200),
            daily_loss_limit: dec!(50),
            daily_volume_limit: dec!(10000),
            min_price: dec!(0.02),
            max_price: dec!(0.98),
            entry_price_guard: dec!(0.10),
            slippage_guard: dec!(0.01),
            max_retries: 3,
            defense_ttl_secs: 60,
            clip_oversize_orders: false,
        }
    }
}

impl RiskConfig {
    fn apply_env(&mut self) {
        env_override("PQ_CAPITAL_CAP", &mut self.capital_cap);
        env_override("PQ_MAX_POSITION", &mut self.max_position_per_market);
        env_override("PQ_DAILY_LOSS_LIMIT", &mut self.daily_loss_limit);
        env_override("PQ_DAILY_VOLUME_LIMIT", &mut self.daily_volume_limit);
        env_override("PQ_MIN_PRICE", &mut self.min_price);
        env_override("PQ_MAX_PRICE", &mut self.max_price);
        env_override("PQ_ENTRY_PRICE_GUARD", &mut self.entry_price_guard);
        env_override("PQ_SLIPPAGE_GUARD", &mut self.slippage_guard);
        env_override("PQ_MAX_RETRIES", &mut self.max_retries);
        env_override("PQ_DEFENSE_TTL_SECS", &mut self.defense_ttl_secs);
        env_override_bool("PQ_CLIP_OVERSIZE", &mut self.clip_oversize_orders);
    }
}

/// Tier-1 market eligibility thresholds.
#[derive(Debug, Clone)]
pub struct EligibilityConfig {
    pub horizon_days: i64,
    pub liquidity_min: Decimal,
    /// Fallback liquidity floor for small accounts on priority categories.
    pub small_account_liquidity_min: Decimal,
    pub small_account_capital: Decimal,
    pub priority_keywords: Vec<String>,
    pub max_spread_pct: Decimal,
    pub extreme_low: Decimal,
    pub extreme_high: Decimal,
    pub volume_liquidity_ratio: Decimal,
    pub target_tag_ids: Vec<u64>,
    pub max_tick: Decimal,
    pub max_min_order_notional: Decimal,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            horizon_days: 90,
            liquidity_min: dec!(15000),
            small_account_liquidity_min: dec!(5000),
            small_account_capital: dec!(100),
            priority_keywords: vec!["crypto".into(), "bitcoin".into(), "politics".into()],
            max_spread_pct: dec!(0.03),
            extreme_low: dec!(0.02),
            extreme_high: dec!(0.98),
            volume_liquidity_ratio: dec!(0.25),
            target_tag_ids: vec![],
            max_tick: dec!(0.01),
            max_min_order_notional: dec!(10),
        }
    }
}

/// Market-making strategy knobs.
#[derive(Debug, Clone)]
pub struct MmConfig {
    pub quote_size: Decimal,
    /// Upper bound on simultaneously quoted markets.
    pub max_markets: usize,
    pub quote_update_interval_ms: u64,
    pub order_ttl_secs: u64,
    /// Quotes within this distance of the recomputed target are kept.
    pub requote_tolerance: Decimal,
    pub min_spread: Decimal,
    pub gamma_base: Decimal,
    pub gamma_max: Decimal,
    /// Order-arrival intensity proxy for the half-spread term.
    pub kappa: Decimal,
    pub sigma_short_window_secs: u64,
    pub sigma_long_window_secs: u64,
    pub boundary_low: Decimal,
    pub boundary_high: Decimal,
    /// Within this fraction of a boundary the spread widens.
    pub boundary_band: Decimal,
    pub boundary_widen: Decimal,
    /// Skew changes below this fraction of the allowed range keep quotes.
    pub hysteresis_frac: Decimal,
    /// |micro − mid| / mid beyond this pulls all quotes. Zero disables.
    pub predictive_deviation: Decimal,
    pub fill_velocity_max: usize,
    pub fill_velocity_window_secs: u64,
    pub obi_threshold: Decimal,
    pub silence_secs: u64,
    pub markout_horizon_secs: u64,
    pub markout_window: usize,
    pub markout_min_fills: usize,
    pub markout_widen: Decimal,
    pub markout_cap: Decimal,
    pub markout_reset_consecutive: usize,
    pub zscore_short: usize,
    pub zscore_long: usize,
    pub zscore_clamp: Decimal,
    pub eligibility: EligibilityConfig,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            quote_size: dec!(50),
            max_markets: 10,
            quote_update_interval_ms: 500,
            order_ttl_secs: 25,
            requote_tolerance: dec!(0.002),
            min_spread: dec!(0.01),
            gamma_base: dec!(0.1),
            gamma_max: dec!(1.0),
            kappa: dec!(1.5),
            sigma_short_window_secs: 60,
            sigma_long_window_secs: 86_400,
            boundary_low: dec!(0.02),
            boundary_high: dec!(0.98),
            boundary_band: dec!(0.03),
            boundary_widen: dec!(3),
            hysteresis_frac: dec!(0.05),
            predictive_deviation: dec!(0.01),
            fill_velocity_max: 5,
            fill_velocity_window_secs: 10,
            obi_threshold: dec!(0.8),
            silence_secs: 30,
            markout_horizon_secs: 5,
            markout_window: 20,
            markout_min_fills: 10,
            markout_widen: dec!(1.15),
            markout_cap: dec!(2.5),
            markout_reset_consecutive: 10,
            zscore_short: 20,
            zscore_long: 500,
            zscore_clamp: dec!(2.5),
            eligibility: EligibilityConfig::default(),
        }
    }
}

impl MmConfig {
    fn apply_env(&mut self) {
        env_override("PQ_MM_QUOTE_SIZE", &mut self.quote_size);
        env_override("PQ_MM_MAX_MARKETS", &mut self.max_markets);
        env_override("PQ_MM_INTERVAL_MS", &mut self.quote_update_interval_ms);
        env_override("PQ_MM_ORDER_TTL_SECS", &mut self.order_ttl_secs);
        env_override("PQ_MM_REQUOTE_TOLERANCE", &mut self.requote_tolerance);
        env_override("PQ_MM_MIN_SPREAD", &mut self.min_spread);
        env_override("PQ_MM_GAMMA_BASE", &mut self.gamma_base);
        env_override("PQ_MM_GAMMA_MAX", &mut self.gamma_max);
        env_override("PQ_MM_KAPPA", &mut self.kappa);
        env_override("PQ_MM_PREDICTIVE_DEVIATION", &mut self.predictive_deviation);
        env_override("PQ_MM_OBI_THRESHOLD", &mut self.obi_threshold);
        env_override("PQ_MM_SILENCE_SECS", &mut self.silence_secs);
        env_override("PQ_MM_LIQUIDITY_MIN", &mut self.eligibility.liquidity_min);
        env_override("PQ_MM_HORIZON_DAYS", &mut self.eligibility.horizon_days);
        if let Ok(v) = std::env::var("PQ_MM_TARGET_TAG_IDS") {
            self.eligibility.target_tag_ids = v
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        let mut kw = Vec::new();
        env_override_list("PQ_MM_PRIORITY_KEYWORDS", &mut kw);
        if !kw.is_empty() {
            self.eligibility.priority_keywords = kw;
        }
    }
}

/// Arbitrage scanner and basket executor knobs.
#[derive(Debug, Clone)]
pub struct ArbConfig {
    /// Ask-sum below this is a candidate.
    pub threshold: Decimal,
    pub taker_fee: Decimal,
    pub min_profit: Decimal,
    /// Minimum displayed shares at the quoted ask, per leg.
    pub min_depth: Decimal,
    pub max_slippage_per_leg: Decimal,
    /// Total capital the strategy may commit across its lifetime today.
    pub budget: Decimal,
    pub per_basket_cap: Decimal,
    pub order_check_interval_ms: u64,
    pub order_timeout_secs: u64,
    pub cancel_deadline_secs: u64,
    pub cooldown_secs: u64,
    pub max_consecutive_failures: u32,
    pub breaker_pause_secs: u64,
    pub debounce_ms: u64,
    pub discovery_page_size: u64,
    pub discovery_max_events: u64,
    pub discovery_interval_secs: u64,
    pub min_outcomes: usize,
    /// ROI bonus per share of MM exposure a basket would neutralise.
    pub netting_bonus: Decimal,
}

impl Default for ArbConfig {
    fn default() -> Self {
        Self {
            threshold: dec!(0.98),
            taker_fee: dec!(0.015),
            min_profit: dec!(0.001),
            min_depth: dec!(10),
            max_slippage_per_leg: dec!(0.005),
            budget: dec!(100),
            per_basket_cap: dec!(10),
            order_check_interval_ms: 100,
            order_timeout_secs: 5,
            cancel_deadline_secs: 2,
            cooldown_secs: 5,
            max_consecutive_failures: 3,
            breaker_pause_secs: 30,
            debounce_ms: 100,
            discovery_page_size: 100,
            discovery_max_events: 500,
            discovery_interval_secs: 86_400,
            min_outcomes: 3,
            netting_bonus: dec!(0.01),
        }
    }
}

impl ArbConfig {
    fn apply_env(&mut self) {
        env_override("PQ_ARB_THRESHOLD", &mut self.threshold);
        env_override("PQ_ARB_TAKER_FEE", &mut self.taker_fee);
        env_override("PQ_ARB_MIN_PROFIT", &mut self.min_profit);
        env_override("PQ_ARB_MIN_DEPTH", &mut self.min_depth);
        env_override("PQ_ARB_MAX_SLIPPAGE", &mut self.max_slippage_per_leg);
        env_override("PQ_ARB_BUDGET", &mut self.budget);
        env_override("PQ_ARB_PER_BASKET_CAP", &mut self.per_basket_cap);
        env_override("PQ_ARB_ORDER_TIMEOUT_SECS", &mut self.order_timeout_secs);
        env_override("PQ_ARB_COOLDOWN_SECS", &mut self.cooldown_secs);
        env_override("PQ_ARB_DEBOUNCE_MS", &mut self.debounce_ms);
    }
}

/// Blacklist seed configuration.
#[derive(Debug, Clone)]
pub struct BlacklistConfig {
    pub manual_ids: Vec<String>,
    pub keywords: Vec<String>,
    pub max_days_until_settlement: i64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            manual_ids: vec![],
            keywords: vec!["2028".into(), "2032".into()],
            max_days_until_settlement: 365,
        }
    }
}

impl BlacklistConfig {
    fn apply_env(&mut self) {
        env_override_list("PQ_BLACKLIST_IDS", &mut self.manual_ids);
        env_override_list("PQ_BLACKLIST_KEYWORDS", &mut self.keywords);
        env_override(
            "PQ_BLACKLIST_MAX_DAYS",
            &mut self.max_days_until_settlement,
        );
    }
}

// ─────────────────────────────────────────────────────────
// Central record
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub data: DataConfig,
    pub limits: RateLimitConfig,
    pub risk: RiskConfig,
    pub mm: MmConfig,
    pub arb: ArbConfig,
    pub blacklist: BlacklistConfig,
    pub dry_run: bool,
}

impl Config {
    /// Defaults, then environment overrides, then validation.
    pub fn load() -> EngineResult<Self> {
        let mut cfg = Self::default();
        cfg.data.apply_env();
        cfg.limits.apply_env();
        cfg.risk.apply_env();
        cfg.mm.apply_env();
        cfg.arb.apply_env();
        cfg.blacklist.apply_env();
        env_override_bool("PQ_DRY_RUN", &mut cfg.dry_run);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        fn check(ok: bool, what: &str) -> EngineResult<()> {
            if ok {
                Ok(())
            } else {
                Err(EngineError::Config(what.to_string()))
            }
        }

        check(
            url::Url::parse(&self.data.rest_url).is_ok(),
            "rest_url is not a valid URL",
        )?;
        check(
            url::Url::parse(&self.data.ws_base_url).is_ok(),
            "ws_base_url is not a valid URL",
        )?;
        check(
            self.risk.min_price > Decimal::ZERO && self.risk.max_price < Decimal::ONE,
            "price guard bounds must sit inside (0, 1)",
        )?;
        check(
            self.risk.min_price < self.risk.max_price,
            "min_price must be below max_price",
        )?;
        check(
            self.risk.daily_loss_limit > Decimal::ZERO,
            "daily_loss_limit must be positive",
        )?;
        check(
            self.risk.capital_cap > Decimal::ZERO,
            "capital_cap must be positive",
        )?;
        check(
            self.arb.threshold > Decimal::ZERO && self.arb.threshold <= Decimal::ONE,
            "arb threshold must sit inside (0, 1]",
        )?;
        check(
            self.arb.per_basket_cap <= self.arb.budget,
            "per-basket cap cannot exceed the arb budget",
        )?;
        check(
            self.arb.taker_fee >= Decimal::ZERO && self.arb.taker_fee < Decimal::ONE,
            "taker fee must sit inside [0, 1)",
        )?;
        check(
            self.mm.gamma_base > Decimal::ZERO && self.mm.gamma_base <= self.mm.gamma_max,
            "gamma_base must be positive and at most gamma_max",
        )?;
        check(self.mm.kappa > Decimal::ZERO, "kappa must be positive")?;
        check(
            self.limits.place_per_sec > 0.0 && self.limits.read_per_sec > 0.0,
            "rate limits must be positive",
        )?;
        check(
            self.blacklist.max_days_until_settlement > 0,
            "settlement horizon must be positive",
        )?;
        Ok(())
    }

    /// Extract the hot-reloadable subset.
    pub fn tunables(&self) -> Tunables {
        Tunables {
            arb_threshold: self.arb.threshold,
            arb_min_profit: self.arb.min_profit,
            mm_min_spread: self.mm.min_spread,
            mm_predictive_deviation: self.mm.predictive_deviation,
        }
    }
}

/// Non-structural fields that may change without a restart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tunables {
    pub arb_threshold: Decimal,
    pub arb_min_profit: Decimal,
    pub mm_min_spread: Decimal,
    pub mm_predictive_deviation: Decimal,
}

/// Broadcast handle for tunables. `refresh_from_env` re-reads the
/// environment, revalidates, and notifies subscribers.
pub struct ConfigWatch {
    tx: watch::Sender<Tunables>,
}

impl ConfigWatch {
    pub fn new(initial: Tunables) -> (Self, watch::Receiver<Tunables>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Tunables> {
        self.tx.subscribe()
    }

    pub fn refresh_from_env(&self) -> EngineResult<Tunables> {
        let cfg = Config::load()?;
        let t = cfg.tunables();
        let _ = self.tx.send(t);
        Ok(t)
    }
}

// ─────────────────────────────────────────────────────────
// Secrets
// ─────────────────────────────────────────────────────────

/// Pluggable secret source. The core never reads secrets from disk; a
/// provider (env-backed here, a vault elsewhere) hands them over.
pub trait SecretsProvider: Send + Sync {
    fn get(&self, key: &str) -> EngineResult<SecretString>;
}

pub const SECRET_WALLET_PRIVATE_KEY: &str = "WALLET_PRIVATE_KEY";
pub const SECRET_API_KEY: &str = "API_KEY";
pub const SECRET_API_SECRET: &str = "API_SECRET";
pub const SECRET_API_PASSPHRASE: &str = "API_PASSPHRASE";

/// Environment-backed provider.
pub struct EnvSecrets;

impl SecretsProvider for EnvSecrets {
    fn get(&self, key: &str) -> EngineResult<SecretString> {
        std::env::var(key)
            .map(|v| SecretString::from(v))
            .map_err(|_| EngineError::Auth(format!("secret {key} not available")))
    }
}

/// L2 API credentials for the authenticated REST and user channel.
pub struct Credentials {
    pub api_key: String,
    pub api_secret: SecretString,
    pub api_passphrase: SecretString,
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        use secrecy::ExposeSecret;
        Self {
            api_key: self.api_key.clone(),
            api_secret: SecretString::from(self.api_secret.expose_secret().to_string()),
            api_passphrase: SecretString::from(self.api_passphrase.expose_secret().to_string()),
        }
    }
}

impl Credentials {
    pub fn from_provider(provider: &dyn SecretsProvider) -> EngineResult<Self> {
        use secrecy::ExposeSecret;
        let api_key = provider.get(SECRET_API_KEY)?.expose_secret().to_string();
        Ok(Self {
            api_key,
            api_secret: provider.get(SECRET_API_SECRET)?,
            api_passphrase: provider.get(SECRET_API_PASSPHRASE)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_url_rejected() {
        let mut cfg = Config::default();
        cfg.data.rest_url = "not a url".into();
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_inverted_price_guard_rejected() {
        let mut cfg = Config::default();
        cfg.risk.min_price = dec!(0.99);
        cfg.risk.max_price = dec!(0.50);
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_basket_cap_over_budget_rejected() {
        let mut cfg = Config::default();
        cfg.arb.per_basket_cap = dec!(500);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tunables_roundtrip() {
        let cfg = Config::default();
        let t = cfg.tunables();
        assert_eq!(t.arb_threshold, dec!(0.98));
        assert_eq!(t.mm_min_spread, cfg.mm.min_spread);

        let (watch, rx) = ConfigWatch::new(t);
        let _ = watch;
        assert_eq!(*rx.borrow(), t);
    }

    #[test]
    fn test_env_override_list_parsing() {
        let mut v = vec!["a".to_string()];
        // Var unset: untouched.
        env_override_list("PQ_TEST_UNSET_LIST_XYZ", &mut v);
        assert_eq!(v, vec!["a".to_string()]);
    }
}
