//! Tagged error taxonomy for the engine.
//!
//! Every failure that crosses a component boundary is a variant here, never
//! a bare string. Strategies match on the variant to decide whether to log
//! and move on (validation rejections) or back off (breakers).

use thiserror::Error;

/// API-level failures from the venue's REST surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("rate limited by venue")]
    RateLimit,
    #[error("request timed out")]
    Timeout,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("http status {0}")]
    Http(u16),
}

/// Trading rejections raised by the execution gateway's validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradingError {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("order rejected by venue: {0}")]
    OrderRejected(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("FOK order not filled")]
    FokNotFilled,
    #[error("slippage exceeded")]
    SlippageExceeded,
    #[error("price outside guard bounds")]
    PriceGuard,
}

/// Which breaker tripped. Daily halts the gateway; the others pause a
/// single strategy surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerScope {
    Daily,
    ToxicFlow,
    ConsecutiveArbFails,
}

impl std::fmt::Display for BreakerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerScope::Daily => write!(f, "daily"),
            BreakerScope::ToxicFlow => write!(f, "toxic-flow"),
            BreakerScope::ConsecutiveArbFails => write!(f, "consecutive-arb-fails"),
        }
    }
}

/// Top-level engine error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("trading error: {0}")]
    Trading(#[from] TradingError),
    #[error("strategy error: {0}")]
    Strategy(String),
    #[error("circuit breaker tripped: {scope}")]
    CircuitBreakerTripped { scope: BreakerScope },
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),
    #[error("data validation error: {0}")]
    DataValidation(String),
}

impl EngineError {
    /// Validation rejections a strategy should log-and-skip rather than
    /// treat as fatal.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::Trading(_) | EngineError::CircuitBreakerTripped { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
