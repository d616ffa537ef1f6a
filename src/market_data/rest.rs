//! Venue REST client.
//!
//! Catalogue pagination (`/markets`, `/events`), book rehydration
//! (`/book/<asset>`), and the order surface (`POST /order`,
//! `DELETE /order/<id>`, `GET /order/<id>` for the timeout probe).
//! Authenticated calls carry L2 HMAC-SHA256 headers. In `--dry-run` mode
//! POST/DELETE never reach the network; the client answers with synthetic
//! accepted responses so the engine above behaves identically.

use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::cache::BookData;
use super::{bool_field, dec_field, parse_levels, str_field};
use crate::config::{Credentials, DataConfig};
use crate::error::{ApiError, EngineResult};
use crate::types::{Event, Market, Outcome, PostOrderRequest, PostOrderResponse};

type HmacSha256 = Hmac<Sha256>;

pub struct VenueRest {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    credentials: Option<Credentials>,
    dry_run: bool,
}

impl VenueRest {
    pub fn new(cfg: &DataConfig, credentials: Option<Credentials>, dry_run: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.rest_url.trim_end_matches('/').to_string(),
            timeout: cfg.api_timeout(),
            credentials,
            dry_run,
        }
    }

    // ─────────────────────────────────────────────────
    // Catalogue
    // ─────────────────────────────────────────────────

    /// One page of the market list, optionally filtered server-side by
    /// category tag.
    pub async fn get_markets(
        &self,
        tag_id: Option<u64>,
        limit: u64,
        offset: u64,
    ) -> EngineResult<Vec<Market>> {
        let mut url = format!(
            "{}/markets?closed=false&limit={}&offset={}",
            self.base_url, limit, offset
        );
        if let Some(tag) = tag_id {
            url.push_str(&format!("&tag_id={tag}"));
        }
        let body = self.get_json(&url).await?;
        let markets = body
            .as_array()
            .map(|arr| arr.iter().filter_map(parse_market).collect())
            .unwrap_or_default();
        Ok(markets)
    }

    /// One page of the event list.
    pub async fn get_events(&self, limit: u64, offset: u64) -> EngineResult<Vec<Event>> {
        let url = format!(
            "{}/events?closed=false&active=true&limit={}&offset={}",
            self.base_url, limit, offset
        );
        let body = self.get_json(&url).await?;
        let events = body
            .as_array()
            .map(|arr| arr.iter().filter_map(parse_event).collect())
            .unwrap_or_default();
        Ok(events)
    }

    /// Full book snapshot for rehydration.
    pub async fn get_book(&self, asset_id: &str) -> EngineResult<BookData> {
        let url = format!("{}/book/{}", self.base_url, asset_id);
        let body = self.get_json(&url).await?;
        Ok(parse_book(asset_id, &body))
    }

    // ─────────────────────────────────────────────────
    // Orders
    // ─────────────────────────────────────────────────

    pub async fn post_order(&self, req: &PostOrderRequest) -> EngineResult<PostOrderResponse> {
        if self.dry_run {
            info!(
                "📝 DRY POST /order {} {} {}@{} {}",
                req.asset_id, req.side, req.size, req.price, req.tif,
            );
            return Ok(PostOrderResponse {
                order_id: format!("dry-{}", uuid::Uuid::new_v4()),
                status: "live".into(),
                error_msg: None,
            });
        }

        let body = serde_json::to_string(req)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        let url = format!("{}/order", self.base_url);
        let request = self
            .http
            .post(&url)
            .headers(self.auth_headers("POST", "/order", &body)?)
            .header("content-type", "application/json")
            .body(body);

        let resp = self.send(request).await?;
        resp.json::<PostOrderResponse>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()).into())
    }

    pub async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        if self.dry_run {
            info!("📝 DRY DELETE /order/{}", order_id);
            return Ok(());
        }

        let path = format!("/order/{order_id}");
        let url = format!("{}{}", self.base_url, path);
        let request = self
            .http
            .delete(&url)
            .headers(self.auth_headers("DELETE", &path, "")?);
        self.send(request).await?;
        Ok(())
    }

    /// Status probe after an ambiguous POST timeout. `None` means the venue
    /// does not know the order.
    pub async fn get_order_status(&self, order_id: &str) -> EngineResult<Option<OrderStatus>> {
        if self.dry_run {
            return Ok(None);
        }

        let path = format!("/order/{order_id}");
        let url = format!("{}{}", self.base_url, path);
        let request = self
            .http
            .get(&url)
            .headers(self.auth_headers("GET", &path, "")?);

        let resp = match self.send(request).await {
            Ok(resp) => resp,
            Err(crate::error::EngineError::Api(ApiError::Http(404))) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(Some(OrderStatus {
            order_id: str_field(&body, "order_id").unwrap_or_else(|| order_id.to_string()),
            status: str_field(&body, "status").unwrap_or_default(),
            size_matched: dec_field(&body, "size_matched").unwrap_or(Decimal::ZERO),
        }))
    }

    // ─────────────────────────────────────────────────
    // Plumbing
    // ─────────────────────────────────────────────────

    async fn get_json(&self, url: &str) -> EngineResult<Value> {
        let resp = self.send(self.http.get(url)).await?;
        resp.json::<Value>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()).into())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> EngineResult<reqwest::Response> {
        let fut = request.timeout(self.timeout).send();
        let resp = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) if e.is_timeout() => return Err(ApiError::Timeout.into()),
            Ok(Err(e)) => {
                warn!("http error: {e}");
                return Err(ApiError::InvalidResponse(e.to_string()).into());
            }
            Err(_) => return Err(ApiError::Timeout.into()),
        };

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ApiError::RateLimit.into());
        }
        if !status.is_success() {
            return Err(ApiError::Http(status.as_u16()).into());
        }
        Ok(resp)
    }

    /// L2 auth headers: HMAC-SHA256 over timestamp + method + path + body,
    /// base64 encoded, plus key and passphrase.
    fn auth_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> EngineResult<reqwest::header::HeaderMap> {
        use reqwest::header::{HeaderMap, HeaderValue};

        let mut headers = HeaderMap::new();
        let creds = match &self.credentials {
            Some(c) => c,
            None => return Ok(headers),
        };

        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_payload(
            creds.api_secret.expose_secret(),
            &timestamp,
            method,
            path,
            body,
        )?;

        let put = |headers: &mut HeaderMap, key: &'static str, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(key, v);
            }
        };
        put(&mut headers, "x-api-key", &creds.api_key);
        put(&mut headers, "x-api-signature", &signature);
        put(&mut headers, "x-api-timestamp", &timestamp);
        put(
            &mut headers,
            "x-api-passphrase",
            creds.api_passphrase.expose_secret(),
        );
        Ok(headers)
    }
}

#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub order_id: String,
    pub status: String,
    pub size_matched: Decimal,
}

/// HMAC-SHA256 signature over `timestamp + method + path + body`.
fn sign_payload(
    secret_b64: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> EngineResult<String> {
    let engine = base64::engine::general_purpose::URL_SAFE;
    let key = engine
        .decode(secret_b64)
        .map_err(|_| crate::error::EngineError::Auth("api secret is not base64".into()))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|_| crate::error::EngineError::Auth("api secret has invalid length".into()))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(engine.encode(mac.finalize().into_bytes()))
}

// ─────────────────────────────────────────────────────────
// Venue JSON → typed records
// ─────────────────────────────────────────────────────────

fn parse_end_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Outcome labels and token ids arrive as parallel JSON-encoded string
/// arrays (`outcomes`, `clobTokenIds`); token order matches label order.
fn parse_outcomes(v: &Value) -> Vec<Outcome> {
    let labels: Vec<String> = str_field(v, "outcomes")
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let tokens: Vec<String> = str_field(v, "clobTokenIds")
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    tokens
        .into_iter()
        .enumerate()
        .map(|(i, asset_id)| Outcome {
            asset_id,
            label: labels.get(i).cloned().unwrap_or_default(),
        })
        .collect()
}

fn parse_tag_ids(v: &Value) -> Vec<u64> {
    v.get("tags")
        .and_then(|t| t.as_array())
        .map(|tags| {
            tags.iter()
                .filter_map(|t| {
                    t.get("id").and_then(|id| {
                        id.as_u64()
                            .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_market(v: &Value) -> Option<Market> {
    let id = str_field(v, "conditionId").or_else(|| str_field(v, "condition_id"))?;
    let market = Market {
        id,
        slug: str_field(v, "slug").unwrap_or_default(),
        question: str_field(v, "question").unwrap_or_default(),
        description: str_field(v, "description").unwrap_or_default(),
        tick_size: dec_field(v, "orderPriceMinTickSize").unwrap_or(Decimal::new(1, 2)),
        min_order_notional: dec_field(v, "orderMinSize").unwrap_or(Decimal::ONE),
        active: bool_field(v, "active").unwrap_or(false),
        closed: bool_field(v, "closed").unwrap_or(true),
        enable_order_book: bool_field(v, "enableOrderBook").unwrap_or(false),
        end_date: str_field(v, "endDate").as_deref().and_then(parse_end_date),
        liquidity: dec_field(v, "liquidityNum")
            .or_else(|| dec_field(v, "liquidity"))
            .unwrap_or(Decimal::ZERO),
        volume_24h: dec_field(v, "volume24hrNum")
            .or_else(|| dec_field(v, "volume24hr"))
            .unwrap_or(Decimal::ZERO),
        tag_ids: parse_tag_ids(v),
        outcomes: parse_outcomes(v),
    };
    Some(market)
}

pub(crate) fn parse_event(v: &Value) -> Option<Event> {
    let id = str_field(v, "id")?;
    let markets = v
        .get("markets")
        .and_then(|m| m.as_array())
        .map(|arr| arr.iter().filter_map(parse_market).collect())
        .unwrap_or_default();
    Some(Event {
        id,
        title: str_field(v, "title").unwrap_or_default(),
        neg_risk: bool_field(v, "negRisk").unwrap_or(false),
        markets,
    })
}

pub(crate) fn parse_book(asset_id: &str, v: &Value) -> BookData {
    let bids = v
        .get("bids")
        .or_else(|| v.get("buys"))
        .map(parse_levels)
        .unwrap_or_default();
    let asks = v
        .get("asks")
        .or_else(|| v.get("sells"))
        .map(parse_levels)
        .unwrap_or_default();
    debug!(
        "book {}: {} bid levels, {} ask levels",
        asset_id,
        bids.len(),
        asks.len()
    );
    BookData {
        asset_id: asset_id.to_string(),
        market_id: str_field(v, "market").unwrap_or_default(),
        bids,
        asks,
        server_ts: v
            .get("timestamp")
            .and_then(|t| t.as_u64().or_else(|| t.as_str().and_then(|s| s.parse().ok()))),
        hash: str_field(v, "hash"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_market_full() {
        let v = json!({
            "conditionId": "0xabc",
            "slug": "will-it-rain",
            "question": "Will it rain?",
            "description": "Rain by midnight UTC.",
            "orderPriceMinTickSize": "0.01",
            "orderMinSize": 5,
            "active": true,
            "closed": false,
            "enableOrderBook": true,
            "endDate": "2026-09-01T00:00:00Z",
            "liquidityNum": "18000.5",
            "volume24hrNum": 6000,
            "tags": [{"id": 7}, {"id": "21"}],
            "outcomes": "[\"Yes\", \"No\"]",
            "clobTokenIds": "[\"tok-yes\", \"tok-no\"]"
        });
        let m = parse_market(&v).unwrap();
        assert_eq!(m.id, "0xabc");
        assert_eq!(m.tick_size, dec!(0.01));
        assert_eq!(m.liquidity, dec!(18000.5));
        assert_eq!(m.tag_ids, vec![7, 21]);
        assert_eq!(m.outcomes.len(), 2);
        assert_eq!(m.outcomes[0].asset_id, "tok-yes");
        assert_eq!(m.outcomes[0].label, "Yes");
        assert!(m.end_date.is_some());
    }

    #[test]
    fn test_parse_market_missing_id_rejected() {
        assert!(parse_market(&json!({"slug": "x"})).is_none());
    }

    #[test]
    fn test_parse_event_with_neg_risk() {
        let v = json!({
            "id": "ev1",
            "title": "Who wins?",
            "negRisk": true,
            "markets": [
                {"conditionId": "m1", "outcomes": "[\"A\"]", "clobTokenIds": "[\"t1\"]"},
                {"conditionId": "m2", "outcomes": "[\"\"]", "clobTokenIds": "[\"t2\"]"}
            ]
        });
        let e = parse_event(&v).unwrap();
        assert!(e.neg_risk);
        assert_eq!(e.markets.len(), 2);
        assert_eq!(e.named_outcome_count(), 1);
        assert!(e.has_placeholder_outcomes());
    }

    #[test]
    fn test_parse_book_buys_sells_naming() {
        let v = json!({
            "market": "mkt1",
            "timestamp": "17",
            "hash": "h",
            "buys": [{"price": "0.40", "size": "10"}],
            "sells": [{"price": "0.60", "size": "4"}]
        });
        let book = parse_book("asset1", &v);
        assert_eq!(book.market_id, "mkt1");
        assert_eq!(book.server_ts, Some(17));
        assert_eq!(book.bids[0].price, dec!(0.40));
        assert_eq!(book.asks[0].size, dec!(4));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let engine = base64::engine::general_purpose::URL_SAFE;
        let secret = engine.encode(b"super-secret-key");
        let a = sign_payload(&secret, "1700000000", "POST", "/order", "{}").unwrap();
        let b = sign_payload(&secret, "1700000000", "POST", "/order", "{}").unwrap();
        let c = sign_payload(&secret, "1700000001", "POST", "/order", "{}").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_dry_run_never_touches_network() {
        let rest = VenueRest::new(&DataConfig::default(), None, true);
        let resp = rest
            .post_order(&PostOrderRequest {
                client_id: "c-1".into(),
                asset_id: "a".into(),
                side: "BUY",
                price: dec!(0.50),
                size: dec!(10),
                tif: "GTC",
                post_only: true,
            })
            .await
            .unwrap();
        assert!(resp.order_id.starts_with("dry-"));
        assert!(rest.cancel_order(&resp.order_id).await.is_ok());
        assert!(rest.get_order_status(&resp.order_id).await.unwrap().is_none());
    }
}
