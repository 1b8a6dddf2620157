// =============================================================================
// Engine Error Taxonomy
// =============================================================================
//
// Domain boundaries return `EngineError` so callers can branch on the kind:
// only RateLimited, Timeout and generic Exchange errors are retryable;
// CircuitOpen, Validation and InsufficientBalance never are. Application
// plumbing (startup, config, loops) stays on `anyhow`.
// =============================================================================

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Risk gate, sizing, or adapter precision rejected the trade. No state
    /// was changed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Phase-1 re-check found the reservation unaffordable.
    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance {
        available: Decimal,
        required: Decimal,
    },

    /// The circuit breaker for `service` is OPEN. Never retried.
    #[error("circuit open for {service}, retry in {retry_in:.1}s")]
    CircuitOpen { service: String, retry_in: f64 },

    /// Upstream classified the response as a rate limit.
    #[error("rate limited by {exchange}, backoff {backoff_seconds}s")]
    RateLimited {
        exchange: String,
        backoff_seconds: u64,
    },

    /// Transient venue failure (network, upstream 5xx). Retried once.
    #[error("exchange error: {0}")]
    Exchange(String),

    /// The venue rejected the request outright (4xx, business error codes).
    /// Counts as a venue failure but is never retried.
    #[error("exchange rejected: {0}")]
    ExchangeRejected(String),

    /// HTTP deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The trade reached the exchange but local state could not be finalised;
    /// the reconciliation worker owns it now.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Shared key-value store (circuit / proxy / rate-limit state) failure.
    #[error("state store error: {0}")]
    Store(String),

    /// Precondition violation. Surfaced, never retried.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether the retry wrapper may re-attempt the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Exchange(_)
        )
    }

    /// Truncate venue error strings before they land in DB columns.
    pub fn message_for_db(&self) -> String {
        let msg = self.to_string();
        match msg.char_indices().nth(500) {
            Some((i, _)) => msg[..i].to_string(),
            None => msg,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn retryability_matches_the_matrix() {
        assert!(EngineError::Timeout("read".into()).is_retryable());
        assert!(EngineError::RateLimited {
            exchange: "BINANCE".into(),
            backoff_seconds: 2
        }
        .is_retryable());
        assert!(EngineError::Exchange("HTTP 502".into()).is_retryable());

        assert!(!EngineError::ExchangeRejected("HTTP 400: bad qty".into()).is_retryable());
        assert!(!EngineError::CircuitOpen {
            service: "binance".into(),
            retry_in: 12.0
        }
        .is_retryable());
        assert!(!EngineError::Validation("too small".into()).is_retryable());
        assert!(!EngineError::InsufficientBalance {
            available: dec!(10),
            required: dec!(100)
        }
        .is_retryable());
    }
}
