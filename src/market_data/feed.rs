//! WebSocket feeds: one socket on the market channel, one on the user
//! channel.
//!
//! Each feed loops: connect (10 s deadline) → subscribe → PING keepalive →
//! read until the socket drops → emit `Disconnected` and wait for the
//! dispatcher's ack (flash-cancel runs inside that ack) → back off →
//! reconnect → resubscribe. Backoff is exponential 1 → 2 → 4 → … → 60 s and
//! resets after 60 s of clean connection. Non-JSON frames are dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::cache::{BookData, Channel, FeedEvent, StateCache};
use super::{dec_field, parse_levels, str_field};
use crate::config::{Credentials, DataConfig};
use crate::types::{Side, UserEventKind, UserOrderEvent};

// ─────────────────────────────────────────────────────────
// Backoff
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    reset_after: Duration,
}

impl Backoff {
    pub(crate) fn new(cfg: &DataConfig) -> Self {
        let initial = Duration::from_secs(cfg.backoff_initial_secs);
        Self {
            current: initial,
            initial,
            max: Duration::from_secs(cfg.backoff_max_secs),
            reset_after: Duration::from_secs(cfg.backoff_reset_secs),
        }
    }

    /// Delay to sleep before the next attempt; doubles up to the cap.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// A connection that stayed up long enough resets the ladder.
    pub(crate) fn note_connection_result(&mut self, connected_for: Duration) {
        if connected_for >= self.reset_after {
            self.current = self.initial;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Frame parsing (pure)
// ─────────────────────────────────────────────────────────

fn parse_side(raw: &str) -> Option<Side> {
    if raw.eq_ignore_ascii_case("BUY") {
        Some(Side::Buy)
    } else if raw.eq_ignore_ascii_case("SELL") {
        Some(Side::Sell)
    } else {
        None
    }
}

/// Parse one market-channel frame into a feed event.
pub(crate) fn parse_market_frame(v: &Value) -> Option<FeedEvent> {
    match v.get("event_type").and_then(|e| e.as_str())? {
        "book" => {
            let asset_id = str_field(v, "asset_id")?;
            let bids = v
                .get("buys")
                .or_else(|| v.get("bids"))
                .map(parse_levels)
                .unwrap_or_default();
            let asks = v
                .get("sells")
                .or_else(|| v.get("asks"))
                .map(parse_levels)
                .unwrap_or_default();
            Some(FeedEvent::Book(BookData {
                asset_id,
                market_id: str_field(v, "market").unwrap_or_default(),
                bids,
                asks,
                server_ts: v.get("timestamp").and_then(|t| {
                    t.as_u64().or_else(|| t.as_str().and_then(|s| s.parse().ok()))
                }),
                hash: str_field(v, "hash"),
            }))
        }
        "price_change" => {
            let asset_id = str_field(v, "asset_id")?;
            let deltas = v
                .get("changes")
                .and_then(|c| c.as_array())
                .map(|changes| {
                    changes
                        .iter()
                        .filter_map(|ch| {
                            let side = parse_side(ch.get("side")?.as_str()?)?;
                            let price = dec_field(ch, "price")?;
                            let size = dec_field(ch, "size")?;
                            Some((side, price, size))
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if deltas.is_empty() {
                return None;
            }
            Some(FeedEvent::PriceChange { asset_id, deltas })
        }
        "last_trade_price" => {
            let asset_id = str_field(v, "asset_id")?;
            let price = dec_field(v, "price")?;
            Some(FeedEvent::LastTrade { asset_id, price })
        }
        other => {
            debug!("ignoring market frame event_type={}", other);
            None
        }
    }
}

/// Parse one user-channel `order` frame.
pub(crate) fn parse_user_frame(v: &Value, now: Instant) -> Option<UserOrderEvent> {
    let event_type = v.get("event_type").and_then(|e| e.as_str())?;
    if !event_type.eq_ignore_ascii_case("order") {
        return None;
    }

    let kind = match v.get("type").and_then(|t| t.as_str())? {
        t if t.eq_ignore_ascii_case("PLACEMENT") => UserEventKind::Placement,
        t if t.eq_ignore_ascii_case("UPDATE") => UserEventKind::Update,
        t if t.eq_ignore_ascii_case("CANCELLATION") => UserEventKind::Cancellation,
        other => {
            debug!("ignoring user order type={}", other);
            return None;
        }
    };

    Some(UserOrderEvent {
        kind,
        order_id: str_field(v, "id").or_else(|| str_field(v, "order_id"))?,
        asset_id: str_field(v, "asset_id").unwrap_or_default(),
        market_id: str_field(v, "market").unwrap_or_default(),
        side: v
            .get("side")
            .and_then(|s| s.as_str())
            .and_then(parse_side)
            .unwrap_or(Side::Buy),
        price: dec_field(v, "price").unwrap_or_default(),
        size_matched: dec_field(v, "size_matched").unwrap_or_default(),
        ts: now,
    })
}

/// Frames may arrive singly or batched in an array.
fn frame_values(text: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(arr)) => arr,
        Ok(v) => vec![v],
        // Non-JSON frames (PONG and friends) are dropped.
        Err(_) => Vec::new(),
    }
}

// ─────────────────────────────────────────────────────────
// Market feed
// ─────────────────────────────────────────────────────────

pub struct MarketFeed {
    cfg: DataConfig,
    cache: Arc<StateCache>,
    events_tx: mpsc::Sender<FeedEvent>,
}

impl MarketFeed {
    pub fn new(cfg: DataConfig, cache: Arc<StateCache>, events_tx: mpsc::Sender<FeedEvent>) -> Self {
        Self {
            cfg,
            cache,
            events_tx,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let url = format!("{}/market", self.cfg.ws_base_url);
        let mut backoff = Backoff::new(&self.cfg);
        info!("📡 market feed started → {}", url);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected_at = Instant::now();
            let session = self.session(&url, &mut shutdown).await;
            backoff.note_connection_result(connected_at.elapsed());

            match session {
                SessionEnd::Shutdown => break,
                SessionEnd::Dropped => {
                    // Disconnect hooks (flash-cancel) must finish before we
                    // schedule the reconnect.
                    let (ack_tx, ack_rx) = oneshot::channel();
                    let _ = self
                        .events_tx
                        .send(FeedEvent::Disconnected {
                            channel: Channel::Market,
                            ack: ack_tx,
                        })
                        .await;
                    let _ = ack_rx.await;

                    let delay = backoff.next_delay();
                    warn!("📡 market feed reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!("📡 market feed shutting down");
    }

    async fn session(&self, url: &str, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let connect = tokio::time::timeout(Duration::from_secs(10), connect_async(url)).await;
        let ws = match connect {
            Ok(Ok((ws, resp))) => {
                info!("✅ market WS connected (status={:?})", resp.status());
                ws
            }
            Ok(Err(e)) => {
                warn!("market WS connect error: {e:?}");
                return SessionEnd::Dropped;
            }
            Err(_) => {
                warn!("market WS connect timeout");
                return SessionEnd::Dropped;
            }
        };

        let (mut write, mut read) = ws.split();

        let assets = self.cache.subscribed();
        let subscribe = json!({
            "type": "market",
            "assets_ids": assets,
        });
        if write
            .send(Message::Text(subscribe.to_string()))
            .await
            .is_err()
        {
            return SessionEnd::Dropped;
        }

        let _ = self
            .events_tx
            .send(FeedEvent::Connected {
                channel: Channel::Market,
            })
            .await;

        let mut ping = tokio::time::interval(Duration::from_secs(self.cfg.ping_interval_secs));
        ping.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                _ = ping.tick() => {
                    if write.send(Message::Text("PING".into())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        for value in frame_values(&text) {
                            if let Some(event) = parse_market_frame(&value) {
                                if self.events_tx.send(event).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!("market WS closed by server: {frame:?}");
                        return SessionEnd::Dropped;
                    }
                    Some(Err(e)) => {
                        warn!("market WS error: {e:?}");
                        return SessionEnd::Dropped;
                    }
                    None => return SessionEnd::Dropped,
                    _ => {}
                }
            }
        }
    }
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

// ─────────────────────────────────────────────────────────
// User feed
// ─────────────────────────────────────────────────────────

pub struct UserFeed {
    cfg: DataConfig,
    credentials: Credentials,
    /// Typed order events for the execution gateway.
    orders_tx: mpsc::Sender<UserOrderEvent>,
    /// Connectivity events share the dispatcher channel.
    events_tx: mpsc::Sender<FeedEvent>,
}

impl UserFeed {
    pub fn new(
        cfg: DataConfig,
        credentials: Credentials,
        orders_tx: mpsc::Sender<UserOrderEvent>,
        events_tx: mpsc::Sender<FeedEvent>,
    ) -> Self {
        Self {
            cfg,
            credentials,
            orders_tx,
            events_tx,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        use secrecy::ExposeSecret;

        let url = format!("{}/user", self.cfg.ws_base_url);
        let mut backoff = Backoff::new(&self.cfg);
        info!("👤 user feed started → {}", url);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let subscribe = json!({
                "type": "user",
                "markets": [],
                "auth": {
                    "apiKey": self.credentials.api_key,
                    "secret": self.credentials.api_secret.expose_secret(),
                    "passphrase": self.credentials.api_passphrase.expose_secret(),
                },
            });

            let connected_at = Instant::now();
            let session = self.session(&url, subscribe.to_string(), &mut shutdown).await;
            backoff.note_connection_result(connected_at.elapsed());

            match session {
                SessionEnd::Shutdown => break,
                SessionEnd::Dropped => {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    let _ = self
                        .events_tx
                        .send(FeedEvent::Disconnected {
                            channel: Channel::User,
                            ack: ack_tx,
                        })
                        .await;
                    let _ = ack_rx.await;

                    let delay = backoff.next_delay();
                    warn!("👤 user feed reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!("👤 user feed shutting down");
    }

    async fn session(
        &self,
        url: &str,
        subscribe: String,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let connect = tokio::time::timeout(Duration::from_secs(10), connect_async(url)).await;
        let ws = match connect {
            Ok(Ok((ws, resp))) => {
                info!("✅ user WS connected (status={:?})", resp.status());
                ws
            }
            Ok(Err(e)) => {
                warn!("user WS connect error: {e:?}");
                return SessionEnd::Dropped;
            }
            Err(_) => {
                warn!("user WS connect timeout");
                return SessionEnd::Dropped;
            }
        };

        let (mut write, mut read) = ws.split();
        if write.send(Message::Text(subscribe)).await.is_err() {
            return SessionEnd::Dropped;
        }

        let _ = self
            .events_tx
            .send(FeedEvent::Connected {
                channel: Channel::User,
            })
            .await;

        let mut ping = tokio::time::interval(Duration::from_secs(self.cfg.ping_interval_secs));
        ping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                _ = ping.tick() => {
                    if write.send(Message::Text("PING".into())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let now = Instant::now();
                        for value in frame_values(&text) {
                            if let Some(event) = parse_user_frame(&value, now) {
                                if self.orders_tx.send(event).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!("user WS closed by server: {frame:?}");
                        return SessionEnd::Dropped;
                    }
                    Some(Err(e)) => {
                        warn!("user WS error: {e:?}");
                        return SessionEnd::Dropped;
                    }
                    None => return SessionEnd::Dropped,
                    _ => {}
                }
            }
        }
    }
}
