//! Multi-outcome event discovery.
//!
//! Paginates the events endpoint on startup and then periodically, keeps
//! events with at least three named outcomes, and drops neg-risk events
//! that still carry unnamed placeholder outcomes (their ask-sum is
//! meaningless until every outcome is listed).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ArbConfig;
use crate::error::EngineResult;
use crate::market_data::rest::VenueRest;
use crate::rate_limit::{EndpointClass, RateLimiter};
use crate::types::Event;

/// The arb strategy's working set: candidate events plus the asset → event
/// index used to route book updates into the debounced scanner.
#[derive(Debug, Default)]
pub struct ArbUniverse {
    pub events: HashMap<String, Event>,
    pub asset_to_event: HashMap<String, String>,
}

impl ArbUniverse {
    pub fn from_events(events: Vec<Event>) -> Self {
        let mut universe = ArbUniverse::default();
        for event in events {
            for outcome in event.outcomes() {
                universe
                    .asset_to_event
                    .insert(outcome.asset_id.clone(), event.id.clone());
            }
            universe.events.insert(event.id.clone(), event);
        }
        universe
    }

    pub fn all_assets(&self) -> Vec<String> {
        self.asset_to_event.keys().cloned().collect()
    }
}

/// Keep events the scanner can price: ≥ `min_outcomes` named outcomes, and
/// no neg-risk event with unnamed placeholders.
pub fn retain_candidates(events: Vec<Event>, min_outcomes: usize) -> Vec<Event> {
    events
        .into_iter()
        .filter(|e| {
            if e.named_outcome_count() < min_outcomes {
                return false;
            }
            if e.neg_risk && e.has_placeholder_outcomes() {
                warn!(
                    "skipping neg-risk event {} — placeholder outcomes present",
                    e.id
                );
                return false;
            }
            true
        })
        .collect()
}

/// Full catalogue sweep: paginate until the venue runs dry or the cap is
/// reached. Reads are rate-limited on the read bucket; the event catalogue
/// is cached in the returned universe, not re-fetched per scan.
pub async fn discover(
    rest: &VenueRest,
    limiter: &Arc<RateLimiter>,
    cfg: &ArbConfig,
) -> EngineResult<ArbUniverse> {
    let mut all = Vec::new();
    let mut offset = 0u64;

    while offset < cfg.discovery_max_events {
        limiter.acquire(EndpointClass::Read).await;
        let page = rest.get_events(cfg.discovery_page_size, offset).await?;
        let page_len = page.len() as u64;
        all.extend(page);
        if page_len < cfg.discovery_page_size {
            break;
        }
        offset += cfg.discovery_page_size;
    }

    let total = all.len();
    let candidates = retain_candidates(all, cfg.min_outcomes);
    info!(
        "🔭 discovery: {} events fetched, {} multi-outcome candidates",
        total,
        candidates.len(),
    );
    Ok(ArbUniverse::from_events(candidates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Market, Outcome};
    use rust_decimal_macros::dec;

    fn market(id: &str, outcomes: Vec<(&str, &str)>) -> Market {
        Market {
            id: id.into(),
            slug: id.into(),
            question: String::new(),
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
        }
    }

    fn event(id: &str, neg_risk: bool, markets: Vec<Market>) -> Event {
        Event {
            id: id.into(),
            title: id.into(),
            neg_risk,
            markets,
        }
    }

    #[test]
    fn test_retains_three_plus_named_outcomes() {
        let events = vec![
            event(
                "e3",
                false,
                vec![market(
                    "m1",
                    vec![("a", "A"), ("b", "B"), ("c", "C")],
                )],
            ),
            event("e2", false, vec![market("m2", vec![("d", "Yes"), ("e", "No")])]),
        ];
        let kept = retain_candidates(events, 3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "e3");
    }

    #[test]
    fn test_drops_neg_risk_with_placeholders() {
        let events = vec![
            event(
                "dirty",
                true,
                vec![market("m1", vec![("a", "A"), ("b", "B"), ("c", "C"), ("d", "")])],
            ),
            event(
                "clean",
                true,
                vec![market("m2", vec![("e", "E"), ("f", "F"), ("g", "G")])],
            ),
        ];
        let kept = retain_candidates(events, 3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "clean");
    }

    #[test]
    fn test_universe_indexes_assets() {
        let events = vec![event(
            "e1",
            false,
            vec![
                market("m1", vec![("a", "A")]),
                market("m2", vec![("b", "B")]),
                market("m3", vec![("c", "C")]),
            ],
        )];
        let universe = ArbUniverse::from_events(retain_candidates(events, 3));
        assert_eq!(universe.asset_to_event.get("b"), Some(&"e1".to_string()));
        assert_eq!(universe.all_assets().len(), 3);
        assert!(universe.events.contains_key("e1"));
    }
}
