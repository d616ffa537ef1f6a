//! Market-making strategy: tier-1 eligibility funnel, Avellaneda-Stoikov
//! quoting, and the toxic-flow guard rail around it.

pub mod eligibility;
pub mod guards;
pub mod quoting;
pub mod strategy;

pub use strategy::{BookTick, MarketMaker};
