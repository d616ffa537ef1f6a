//! Multi-outcome arbitrage: event discovery, the debounced ask-sum
//! scanner, and best-effort atomic basket execution.

pub mod basket;
pub mod discovery;
pub mod scanner;

pub use basket::{BasketExecutor, BasketOutcome};
pub use discovery::ArbUniverse;
pub use scanner::{ArbOpportunity, ArbScanner};
