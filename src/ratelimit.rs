// =============================================================================
// Rate-Limit Manager — per-exchange cooldown with exponential backoff
// =============================================================================
//
// Tracks venue-wide rate limiting independently of any single proxy: once a
// venue answers 429 (or an equivalent, see the fetcher's classifier), every
// worker backs off that venue. Consecutive strikes double the cooldown up to
// a cap; one success clears the strike count.
//
// State lives in the shared KvStore (`rl:<exchange>:*`) so workers coordinate.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::store::KvStore;
use crate::types::Exchange;

/// Backoff cap in seconds.
const MAX_BACKOFF_SECONDS: u64 = 60;
/// A single attempt never sleeps longer than this; longer cooldowns are the
/// caller's problem (re-enqueue or surface).
const MAX_WAIT_PER_ATTEMPT_SECONDS: u64 = 10;
/// Strike counters expire if a venue stays quiet this long.
const STRIKES_TTL_SECONDS: u64 = 300;

/// Snapshot for the ops API.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub exchange: Exchange,
    pub strikes: i64,
    pub cooldown_remaining_seconds: f64,
}

pub struct RateLimitManager {
    store: Arc<dyn KvStore>,
}

impl RateLimitManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn strikes_key(exchange: Exchange) -> String {
        format!("rl:{}:strikes", exchange.as_str().to_ascii_lowercase())
    }

    fn until_key(exchange: Exchange) -> String {
        format!("rl:{}:limited_until", exchange.as_str().to_ascii_lowercase())
    }

    /// Whether requests to `exchange` may proceed right now.
    pub async fn can_proceed(&self, exchange: Exchange) -> EngineResult<bool> {
        Ok(self.cooldown_remaining(exchange).await? <= 0.0)
    }

    /// Seconds left on the venue-wide cooldown (zero when clear).
    pub async fn cooldown_remaining(&self, exchange: Exchange) -> EngineResult<f64> {
        let until: Option<f64> = self
            .store
            .get(&Self::until_key(exchange))
            .await?
            .and_then(|v| v.parse().ok());
        match until {
            Some(until) => Ok((until - now_seconds()).max(0.0)),
            None => Ok(0.0),
        }
    }

    /// A request to `exchange` succeeded; the strike run is over.
    pub async fn record_success(&self, exchange: Exchange) -> EngineResult<()> {
        self.store.del(&Self::strikes_key(exchange)).await
    }

    /// A request was rate-limited. Returns the backoff the caller should
    /// respect: `min(2^strikes, 60)` seconds.
    pub async fn record_rate_limit(&self, exchange: Exchange) -> EngineResult<u64> {
        let strikes = self
            .store
            .incr_ex(&Self::strikes_key(exchange), STRIKES_TTL_SECONDS)
            .await?;
        let backoff = backoff_seconds(strikes);
        let until = now_seconds() + backoff as f64;
        self.store
            .set_ex(&Self::until_key(exchange), &until.to_string(), backoff.max(1))
            .await?;
        warn!(
            exchange = %exchange,
            strikes,
            backoff_seconds = backoff,
            "exchange rate limited, cooling down"
        );
        Ok(backoff)
    }

    /// Sleep out the cooldown, bounded at 10 s per attempt. Returns the
    /// seconds actually waited; a remaining cooldown longer than the bound is
    /// left in place for the caller to observe via `can_proceed`.
    pub async fn wait_if_needed(&self, exchange: Exchange) -> EngineResult<f64> {
        let remaining = self.cooldown_remaining(exchange).await?;
        if remaining <= 0.0 {
            return Ok(0.0);
        }
        let wait = bounded_wait(remaining);
        debug!(exchange = %exchange, wait_seconds = wait, "waiting out rate-limit cooldown");
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        Ok(wait)
    }

    pub async fn stats(&self, exchange: Exchange) -> EngineResult<RateLimitStats> {
        let strikes = self
            .store
            .get(&Self::strikes_key(exchange))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(RateLimitStats {
            exchange,
            strikes,
            cooldown_remaining_seconds: self.cooldown_remaining(exchange).await?,
        })
    }
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// `min(2^strikes, 60)`; the first strike backs off 2 s.
fn backoff_seconds(strikes: i64) -> u64 {
    let exp = strikes.clamp(1, 6) as u32;
    2u64.saturating_pow(exp).min(MAX_BACKOFF_SECONDS)
}

fn bounded_wait(remaining_seconds: f64) -> f64 {
    remaining_seconds.min(MAX_WAIT_PER_ATTEMPT_SECONDS as f64)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_seconds(1), 2);
        assert_eq!(backoff_seconds(2), 4);
        assert_eq!(backoff_seconds(3), 8);
        assert_eq!(backoff_seconds(5), 32);
        assert_eq!(backoff_seconds(6), 60);
        assert_eq!(backoff_seconds(50), 60);
    }

    #[test]
    fn per_attempt_wait_is_bounded() {
        assert_eq!(bounded_wait(3.0), 3.0);
        assert_eq!(bounded_wait(45.0), 10.0);
    }

    #[tokio::test]
    async fn strikes_escalate_and_success_clears() {
        let manager = RateLimitManager::new(Arc::new(MemoryStore::new()));

        assert!(manager.can_proceed(Exchange::Okx).await.unwrap());

        let first = manager.record_rate_limit(Exchange::Okx).await.unwrap();
        let second = manager.record_rate_limit(Exchange::Okx).await.unwrap();
        assert_eq!(first, 2);
        assert_eq!(second, 4);
        assert!(!manager.can_proceed(Exchange::Okx).await.unwrap());

        // A different venue is unaffected.
        assert!(manager.can_proceed(Exchange::Binance).await.unwrap());

        manager.record_success(Exchange::Okx).await.unwrap();
        let after_clear = manager.record_rate_limit(Exchange::Okx).await.unwrap();
        assert_eq!(after_clear, 2);
    }
}
