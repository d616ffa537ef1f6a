//! State cache and handler dispatch.
//!
//! The cache is the only shared mutable surface with one writer (the
//! dispatch task) and many readers (strategies). Reads clone the snapshot;
//! snapshots are small. The dispatch task is the single consumer of the
//! feed channel, so handlers observe updates in arrival order per asset.
//!
//! Handlers must not block: MM and Arb register handlers that forward into
//! their own queues and return immediately.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::book::{BookSnapshot, PriceLevel};
use crate::types::Side;

// ─────────────────────────────────────────────────────────
// Feed events (market channel → dispatcher)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Market,
    User,
}

/// Raw book payload as produced by the feed parser or REST rehydration.
#[derive(Debug, Clone)]
pub struct BookData {
    pub asset_id: String,
    pub market_id: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub server_ts: Option<u64>,
    pub hash: Option<String>,
}

#[derive(Debug)]
pub enum FeedEvent {
    /// Full snapshot: replace wholesale.
    Book(BookData),
    /// Level deltas; size = 0 removes a level.
    PriceChange {
        asset_id: String,
        deltas: Vec<(Side, Decimal, Decimal)>,
    },
    LastTrade {
        asset_id: String,
        price: Decimal,
    },
    /// Fired on every socket loss. The feed waits on `ack` before it
    /// begins reconnecting, so disconnect handlers (flash-cancel) complete
    /// first.
    Disconnected {
        channel: Channel,
        ack: oneshot::Sender<()>,
    },
    /// Fired once a socket is back up and resubscribed.
    Connected {
        channel: Channel,
    },
}

// ─────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────

pub struct StateCache {
    books: RwLock<HashMap<String, BookSnapshot>>,
    subscribed: RwLock<HashSet<String>>,
    stale_after: Duration,
}

impl StateCache {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(HashSet::new()),
            stale_after,
        }
    }

    /// Cloned snapshot, or `None` when absent or stale. Consumers must
    /// treat stale books as absent.
    pub fn get(&self, asset_id: &str, now: Instant) -> Option<BookSnapshot> {
        let books = self.books.read();
        let snap = books.get(asset_id)?;
        if snap.is_stale(now, self.stale_after) {
            return None;
        }
        Some(snap.clone())
    }

    /// Cloned snapshot regardless of staleness (rehydration, diagnostics).
    pub fn get_any(&self, asset_id: &str) -> Option<BookSnapshot> {
        self.books.read().get(asset_id).cloned()
    }

    pub fn subscribe(&self, asset_ids: &[String]) {
        let mut set = self.subscribed.write();
        for id in asset_ids {
            set.insert(id.clone());
        }
    }

    pub fn unsubscribe(&self, asset_ids: &[String]) {
        let mut set = self.subscribed.write();
        for id in asset_ids {
            set.remove(id);
        }
        let mut books = self.books.write();
        for id in asset_ids {
            books.remove(id);
        }
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.read().iter().cloned().collect()
    }

    fn apply_book(&self, data: BookData, now: Instant) -> BookSnapshot {
        let mut books = self.books.write();
        let snap = books
            .entry(data.asset_id.clone())
            .or_insert_with(|| BookSnapshot::new(&data.asset_id, &data.market_id, now));
        if !data.market_id.is_empty() {
            snap.market_id = data.market_id;
        }
        snap.replace(data.bids, data.asks, data.server_ts, data.hash, now);
        snap.clone()
    }

    fn apply_deltas(
        &self,
        asset_id: &str,
        deltas: &[(Side, Decimal, Decimal)],
        now: Instant,
    ) -> Option<BookSnapshot> {
        let mut books = self.books.write();
        let snap = books.get_mut(asset_id)?;
        for (side, price, size) in deltas {
            snap.apply_delta(*side, *price, *size, now);
        }
        Some(snap.clone())
    }

    fn apply_last_trade(&self, asset_id: &str, price: Decimal, now: Instant) {
        if let Some(snap) = self.books.write().get_mut(asset_id) {
            snap.set_last_trade(price, now);
        }
    }

    /// Test-only mutator so strategy tests can seed books without a
    /// running dispatcher.
    #[cfg(test)]
    pub(crate) fn test_apply_book(&self, data: BookData, now: Instant) -> BookSnapshot {
        self.apply_book(data, now)
    }
}

// ─────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────

pub type UpdateHandler = Box<dyn Fn(&BookSnapshot) + Send + Sync>;
type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type AsyncHook = Box<dyn Fn() -> BoxFuture + Send + Sync>;
pub type RehydrateFn =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<BookData>> + Send>> + Send + Sync>;

struct HandlerEntry {
    name: String,
    filter: Option<HashSet<String>>,
    handler: UpdateHandler,
}

/// Single-consumer dispatch task. Applies mutations to the cache and fires
/// update handlers in arrival order.
pub struct Dispatcher {
    cache: std::sync::Arc<StateCache>,
    rx: mpsc::Receiver<FeedEvent>,
    handlers: Vec<HandlerEntry>,
    disconnect_hooks: Vec<AsyncHook>,
    reconnect_hooks: Vec<AsyncHook>,
    rehydrate: Option<RehydrateFn>,
}

impl Dispatcher {
    pub fn new(cache: std::sync::Arc<StateCache>, rx: mpsc::Receiver<FeedEvent>) -> Self {
        Self {
            cache,
            rx,
            handlers: Vec::new(),
            disconnect_hooks: Vec::new(),
            reconnect_hooks: Vec::new(),
            rehydrate: None,
        }
    }

    /// Register a named update handler. `asset_filter = None` means all
    /// assets. Handlers run on the dispatch task and must not block.
    pub fn register_update_handler(
        &mut self,
        name: &str,
        handler: UpdateHandler,
        asset_filter: Option<HashSet<String>>,
    ) {
        self.handlers.push(HandlerEntry {
            name: name.to_string(),
            filter: asset_filter,
            handler,
        });
    }

    /// Disconnect hooks are awaited to completion before the feed is
    /// allowed to reconnect (flash-cancel lives here).
    pub fn register_disconnect_handler(&mut self, hook: AsyncHook) {
        self.disconnect_hooks.push(hook);
    }

    /// Reconnect hooks fire after resubscription and rehydration complete.
    pub fn register_reconnect_handler(&mut self, hook: AsyncHook) {
        self.reconnect_hooks.push(hook);
    }

    pub fn set_rehydrator(&mut self, f: RehydrateFn) {
        self.rehydrate = Some(f);
    }

    fn fire_handlers(&self, snap: &BookSnapshot) {
        for entry in &self.handlers {
            let wants = entry
                .filter
                .as_ref()
                .map(|f| f.contains(&snap.asset_id))
                .unwrap_or(true);
            if wants {
                (entry.handler)(snap);
            }
        }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            "🗂️ dispatcher started | handlers={} disconnect_hooks={}",
            self.handlers.len(),
            self.disconnect_hooks.len(),
        );

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                ev = self.rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };

            match event {
                FeedEvent::Book(data) => {
                    let snap = self.cache.apply_book(data, Instant::now());
                    self.fire_handlers(&snap);
                }
                FeedEvent::PriceChange { asset_id, deltas } => {
                    if let Some(snap) =
                        self.cache.apply_deltas(&asset_id, &deltas, Instant::now())
                    {
                        self.fire_handlers(&snap);
                    } else {
                        debug!("price_change for unknown asset {}", asset_id);
                    }
                }
                FeedEvent::LastTrade { asset_id, price } => {
                    self.cache.apply_last_trade(&asset_id, price, Instant::now());
                }
                FeedEvent::Disconnected { channel, ack } => {
                    warn!("🔌 {:?} channel disconnected — running disconnect hooks", channel);
                    for hook in &self.disconnect_hooks {
                        hook().await;
                    }
                    // Releasing the ack lets the feed start its backoff.
                    let _ = ack.send(());
                }
                FeedEvent::Connected { channel } => {
                    info!("🔌 {:?} channel connected", channel);
                    if channel == Channel::Market {
                        self.rehydrate_all().await;
                    }
                    for hook in &self.reconnect_hooks {
                        hook().await;
                    }
                }
            }
        }

        info!("🗂️ dispatcher shutting down");
    }

    async fn rehydrate_all(&self) {
        let rehydrate = match &self.rehydrate {
            Some(f) => f,
            None => return,
        };
        let assets = self.cache.subscribed();
        info!("💧 rehydrating {} assets via REST", assets.len());
        for asset in assets {
            match rehydrate(asset.clone()).await {
                Some(data) => {
                    let snap = self.cache.apply_book(data, Instant::now());
                    self.fire_handlers(&snap);
                }
                None => warn!("💧 rehydration failed for {}", asset),
            }
        }
    }
}
