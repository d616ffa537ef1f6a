//! polyquote: market-making and multi-outcome arbitrage engine for a
//! prediction-market CLOB.
//!
//! Two strategies share one venue connection: a maker posting two-sided
//! Avellaneda-Stoikov quotes, and a scanner buying full outcome baskets
//! whenever the ask-sum across a mutually-exclusive event drops below 1.
//! Everything flows through the execution gateway, which owns the global
//! risk limits and the daily circuit breaker.
//!
//! Architecture (one tokio runtime, actor tasks over bounded channels):
//!
//!   market WS ─┐
//!   user WS ───┤→ dispatcher → state cache → handlers ─→ MM actor
//!              │                                       └→ arb scanner → basket executor
//!              └────────────── order events ──→ execution gateway ← both strategies

pub mod arb;
pub mod blacklist;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod market_data;
pub mod mm;
pub mod rate_limit;
pub mod types;

use async_trait::async_trait;
use tokio::sync::watch;

/// Minimal strategy capability: the supervisor holds a heterogeneous
/// collection of these and runs each as its own task. The inventory-export
/// capability is separate (see `coordinator`) and only the MM implements
/// it.
#[async_trait]
pub trait Strategy: Send {
    fn name(&self) -> &'static str;
    /// Run until the shutdown signal flips. Consumes the strategy.
    async fn run(self: Box<Self>, shutdown: watch::Receiver<bool>);
}
