//! Market-data layer: order-book snapshots, the shared state cache, the
//! WebSocket feeds, and the venue REST client.
//!
//! Venue JSON stops here. Everything above this layer works with the typed
//! records in `crate::types` and `book::BookSnapshot`.

pub mod book;
pub mod cache;
pub mod feed;
pub mod rest;

use rust_decimal::Decimal;
use serde_json::Value;

use book::PriceLevel;

/// Venue numerics arrive as strings ("0.52") or numbers (0.52); normalise.
pub(crate) fn dec_from(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(_) => v.as_f64().and_then(Decimal::from_f64_retain),
        _ => None,
    }
}

pub(crate) fn dec_field(v: &Value, field: &str) -> Option<Decimal> {
    v.get(field).and_then(dec_from)
}

pub(crate) fn str_field(v: &Value, field: &str) -> Option<String> {
    v.get(field).and_then(|x| x.as_str()).map(str::to_string)
}

pub(crate) fn bool_field(v: &Value, field: &str) -> Option<bool> {
    v.get(field).and_then(|x| x.as_bool())
}

/// Parse a level array (`buys`/`sells`/`bids`/`asks`) of `{price, size}`.
pub(crate) fn parse_levels(v: &Value) -> Vec<PriceLevel> {
    v.as_array()
        .map(|levels| {
            levels
                .iter()
                .filter_map(|lvl| {
                    let price = dec_field(lvl, "price")?;
                    let size = dec_field(lvl, "size")?;
                    Some(PriceLevel { price, size })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_dec_from_string_and_number() {
        assert_eq!(dec_from(&json!("0.52")), Some(dec!(0.52)));
        assert_eq!(dec_from(&json!(0.5)), Some(dec!(0.5)));
        assert_eq!(dec_from(&json!(null)), None);
        assert_eq!(dec_from(&json!("not-a-number")), None);
    }

    #[test]
    fn test_parse_levels_skips_malformed() {
        let v = json!([
            {"price": "0.40", "size": "10"},
            {"price": "oops", "size": "5"},
            {"size": "5"},
            {"price": 0.45, "size": 3},
        ]);
        let levels = parse_levels(&v);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, dec!(0.40));
        assert_eq!(levels[1].size, dec!(3));
    }
}
