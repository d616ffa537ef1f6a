//! Market blacklist manager.
//!
//! Three layers evaluated in order, any hit rejects:
//!   1. manual kill-switch ids
//!   2. case-insensitive keyword scan over slug ∪ question ∪ description
//!   3. settlement date beyond the configured horizon
//!
//! Runtime additions take effect on the next `is_blacklisted` call.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::info;

use crate::config::BlacklistConfig;
use crate::types::Market;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistReason {
    Manual,
    Keyword,
    SettlementHorizon,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlacklistStats {
    pub checks: u64,
    pub manual_hits: u64,
    pub keyword_hits: u64,
    pub horizon_hits: u64,
}

struct Inner {
    manual: HashSet<String>,
    keywords: Vec<String>,
    stats: BlacklistStats,
}

pub struct Blacklist {
    inner: RwLock<Inner>,
    max_days_until_settlement: i64,
}

impl Blacklist {
    pub fn new(cfg: &BlacklistConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                manual: cfg.manual_ids.iter().cloned().collect(),
                keywords: cfg.keywords.iter().map(|k| k.to_lowercase()).collect(),
                stats: BlacklistStats::default(),
            }),
            max_days_until_settlement: cfg.max_days_until_settlement,
        }
    }

    /// Evaluate the three layers against a market, at `now`.
    pub fn check(&self, market: &Market, now: DateTime<Utc>) -> Option<BlacklistReason> {
        let mut inner = self.inner.write();
        inner.stats.checks += 1;

        if inner.manual.contains(&market.id) {
            inner.stats.manual_hits += 1;
            return Some(BlacklistReason::Manual);
        }

        let text = market.search_text();
        if let Some(hit) = inner.keywords.iter().find(|k| text.contains(k.as_str())) {
            info!("⛔ blacklist keyword '{}' hit market {}", hit, market.id);
            inner.stats.keyword_hits += 1;
            return Some(BlacklistReason::Keyword);
        }

        if let Some(end) = market.end_date {
            if end - now > Duration::days(self.max_days_until_settlement) {
                inner.stats.horizon_hits += 1;
                return Some(BlacklistReason::SettlementHorizon);
            }
        }

        None
    }

    pub fn is_blacklisted(&self, market: &Market) -> bool {
        self.check(market, Utc::now()).is_some()
    }

    /// Manual-layer check by id alone, for callers that hold no full
    /// `Market` record (the execution gateway).
    pub fn is_manual(&self, market_id: &str) -> bool {
        self.inner.read().manual.contains(market_id)
    }

    pub fn add_manual(&self, market_id: &str) {
        let inserted = self.inner.write().manual.insert(market_id.to_string());
        if inserted {
            info!("⛔ market {} added to manual blacklist", market_id);
        }
    }

    pub fn remove_manual(&self, market_id: &str) {
        if self.inner.write().manual.remove(market_id) {
            info!("✅ market {} removed from manual blacklist", market_id);
        }
    }

    pub fn stats(&self) -> BlacklistStats {
        self.inner.read().stats
    }
}
