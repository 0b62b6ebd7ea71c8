/// Error taxonomy for broker, ledger and override-document operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Quote service returned nothing usable for the symbol
    #[error("no quote available for {0}")]
    NoQuote(String),

    /// Malformed quantity/price; never retried
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Close requested for a symbol with no holdings
    #[error("no position for {0}")]
    NoPosition(String),

    /// Another writer holds the override-document lock
    #[error("overrides document is locked")]
    OverridesLocked,

    /// Symbol is outside its trading hours; silent no-op upstream
    #[error("{symbol} is gated: {reason}")]
    Gated { symbol: String, reason: String },

    /// Transport-level failure talking to the broker
    #[error("network error: {0}")]
    Network(String),

    /// Broker rejected the request outright
    #[error("broker api error: {0}")]
    Api(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    /// Whether the backoff executor should attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::NoQuote(_)
                | BrokerError::OverridesLocked
                | BrokerError::Network(_)
                | BrokerError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(BrokerError::NoQuote("AAPL".to_string()).is_retryable());
        assert!(BrokerError::Network("timeout".to_string()).is_retryable());
        assert!(BrokerError::OverridesLocked.is_retryable());
    }

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        assert!(!BrokerError::InvalidOrder("qty=0".to_string()).is_retryable());
        assert!(!BrokerError::NoPosition("BTC-USD".to_string()).is_retryable());
        assert!(!BrokerError::Api("rejected".to_string()).is_retryable());
        let gated = BrokerError::Gated {
            symbol: "AAPL".to_string(),
            reason: "market closed".to_string(),
        };
        assert!(!gated.is_retryable());
    }
}
