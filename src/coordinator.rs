//! Cross-strategy coordination: a read-only view of the MM's per-market
//! inventory, consumed by the arbitrage scorer.
//!
//! The MM publishes snapshots over a `watch` channel; the arb side holds
//! the receiver. There is no write path and no shared mutable state;
//! coordination is purely informational.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tokio::sync::watch;

/// Per-market signed share counts: market_id → asset_id → shares.
pub type InventoryExport = HashMap<String, HashMap<String, Decimal>>;

/// Publisher half, owned by the MM strategy.
pub struct InventoryPublisher {
    tx: watch::Sender<InventoryExport>,
}

/// Reader half, held by the arb scorer. Every read is a cloned snapshot;
/// nothing handed out can mutate MM state.
#[derive(Clone)]
pub struct InventoryView {
    rx: watch::Receiver<InventoryExport>,
}

pub fn inventory_channel() -> (InventoryPublisher, InventoryView) {
    let (tx, rx) = watch::channel(InventoryExport::new());
    (InventoryPublisher { tx }, InventoryView { rx })
}

impl InventoryPublisher {
    pub fn publish(&self, export: InventoryExport) {
        let _ = self.tx.send(export);
    }
}

impl InventoryView {
    /// Signed shares per asset for one market. Empty map when the MM holds
    /// nothing there.
    pub fn get_market_inventory(&self, market_id: &str) -> HashMap<String, Decimal> {
        self.rx
            .borrow()
            .get(market_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Signed MM exposure for a single asset.
    pub fn asset_exposure(&self, market_id: &str, asset_id: &str) -> Decimal {
        self.rx
            .borrow()
            .get(market_id)
            .and_then(|m| m.get(asset_id))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}
