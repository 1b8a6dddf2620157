// =============================================================================
// Circuit Breaker Registry — per-service fast-fail shared across workers
// =============================================================================
//
// State machine (exhaustive):
//
//   CLOSED    --threshold failures in window-->  OPEN
//   OPEN      --reset timeout elapsed + call-->  HALF_OPEN
//   HALF_OPEN --success threshold successes-->   CLOSED
//   HALF_OPEN --any failure-->                   OPEN
//
// All state lives in the shared KvStore under `cb:<service>:*` so concurrent
// workers agree on whether a venue is healthy. Counter updates are atomic
// single-key operations; the worst race on a state transition is two workers
// both writing the same target state.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BreakerDefaults;
use crate::error::{EngineError, EngineResult};
use crate::store::KvStore;

/// TTL for every breaker key. A service nobody touches for this long decays
/// back to CLOSED.
const KEY_TTL_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one breaker for the ops API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub service: String,
    pub state: CircuitState,
    pub failures: i64,
    pub successes: i64,
    pub time_remaining_seconds: f64,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    service: String,
    config: BreakerDefaults,
    store: Arc<dyn KvStore>,
}

impl CircuitBreaker {
    pub fn new(service: &str, config: BreakerDefaults, store: Arc<dyn KvStore>) -> Self {
        Self {
            service: service.to_ascii_lowercase(),
            config,
            store,
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("cb:{}:{}", self.service, suffix)
    }

    pub async fn state(&self) -> EngineResult<CircuitState> {
        Ok(self
            .store
            .get(&self.key("state"))
            .await?
            .map(|s| CircuitState::parse(&s))
            .unwrap_or(CircuitState::Closed))
    }

    /// Whether a request may proceed. An OPEN breaker whose reset timeout has
    /// elapsed transitions to HALF_OPEN and admits the probing call.
    pub async fn can_execute(&self) -> EngineResult<bool> {
        match self.state().await? {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(true),
            CircuitState::Open => {
                let elapsed = self.seconds_since_open().await?;
                match elapsed {
                    Some(e) if e >= self.config.reset_timeout_seconds as f64 => {
                        self.set_state(CircuitState::HalfOpen).await?;
                        info!(service = %self.service, "circuit OPEN -> HALF_OPEN (probing)");
                        Ok(true)
                    }
                    // Missing opened_at means the key expired; fail open.
                    None => Ok(true),
                    _ => Ok(false),
                }
            }
        }
    }

    /// `can_execute` as a guard: blocked calls surface the non-retryable
    /// `CircuitOpen` error with the remaining cooldown.
    pub async fn guard(&self) -> EngineResult<()> {
        if self.can_execute().await? {
            Ok(())
        } else {
            Err(EngineError::CircuitOpen {
                service: self.service.clone(),
                retry_in: self.time_remaining().await?,
            })
        }
    }

    /// Seconds until an OPEN breaker starts probing. Zero otherwise.
    pub async fn time_remaining(&self) -> EngineResult<f64> {
        if self.state().await? != CircuitState::Open {
            return Ok(0.0);
        }
        match self.seconds_since_open().await? {
            Some(elapsed) => Ok((self.config.reset_timeout_seconds as f64 - elapsed).max(0.0)),
            None => Ok(0.0),
        }
    }

    pub async fn record_success(&self) -> EngineResult<()> {
        match self.state().await? {
            CircuitState::HalfOpen => {
                let successes = self
                    .store
                    .incr_ex(&self.key("successes"), KEY_TTL_SECONDS)
                    .await?;
                if successes >= self.config.success_threshold {
                    self.close_circuit().await?;
                    info!(
                        service = %self.service,
                        successes,
                        "circuit HALF_OPEN -> CLOSED (recovered)"
                    );
                }
            }
            CircuitState::Closed => {
                // Sliding-window reset: one success clears the failure run.
                self.store.del(&self.key("failures")).await?;
            }
            CircuitState::Open => {}
        }
        Ok(())
    }

    pub async fn record_failure(&self, error: &str) -> EngineResult<()> {
        match self.state().await? {
            CircuitState::HalfOpen => {
                self.open_circuit().await?;
                warn!(
                    service = %self.service,
                    error,
                    "circuit HALF_OPEN -> OPEN (probe failed)"
                );
            }
            CircuitState::Closed => {
                let failures = self
                    .store
                    .incr_ex(&self.key("failures"), self.config.failure_window_seconds)
                    .await?;
                if failures >= self.config.failure_threshold {
                    self.open_circuit().await?;
                    warn!(
                        service = %self.service,
                        failures,
                        window_seconds = self.config.failure_window_seconds,
                        "circuit CLOSED -> OPEN"
                    );
                }
            }
            CircuitState::Open => {}
        }
        Ok(())
    }

    /// Operator action: force the breaker back to CLOSED.
    pub async fn reset(&self) -> EngineResult<()> {
        self.close_circuit().await?;
        info!(service = %self.service, "circuit manually reset to CLOSED");
        Ok(())
    }

    pub async fn stats(&self) -> EngineResult<BreakerStats> {
        let failures = self
            .store
            .get(&self.key("failures"))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let successes = self
            .store
            .get(&self.key("successes"))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(BreakerStats {
            service: self.service.clone(),
            state: self.state().await?,
            failures,
            successes,
            time_remaining_seconds: self.time_remaining().await?,
        })
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn seconds_since_open(&self) -> EngineResult<Option<f64>> {
        let opened_at: Option<f64> = self
            .store
            .get(&self.key("opened_at"))
            .await?
            .and_then(|v| v.parse().ok());
        Ok(opened_at.map(|at| now_seconds() - at))
    }

    async fn set_state(&self, state: CircuitState) -> EngineResult<()> {
        self.store
            .set_ex(&self.key("state"), state.as_str(), KEY_TTL_SECONDS)
            .await
    }

    async fn open_circuit(&self) -> EngineResult<()> {
        self.set_state(CircuitState::Open).await?;
        self.store
            .set_ex(
                &self.key("opened_at"),
                &now_seconds().to_string(),
                KEY_TTL_SECONDS,
            )
            .await?;
        self.store.del(&self.key("successes")).await
    }

    async fn close_circuit(&self) -> EngineResult<()> {
        self.set_state(CircuitState::Closed).await?;
        self.store.del(&self.key("failures")).await?;
        self.store.del(&self.key("successes")).await?;
        self.store.del(&self.key("opened_at")).await
    }
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lazily creates one breaker per service name. Breakers share the KvStore,
/// so every registry in every worker observes the same state.
pub struct BreakerRegistry {
    store: Arc<dyn KvStore>,
    defaults: BreakerDefaults,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(store: Arc<dyn KvStore>, defaults: BreakerDefaults) -> Self {
        Self {
            store,
            defaults,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        let name = service.to_ascii_lowercase();
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    &name,
                    self.defaults,
                    self.store.clone(),
                ))
            })
            .clone()
    }

    pub async fn all_stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.lock().values().cloned().collect();
        let mut stats = Vec::with_capacity(breakers.len());
        for b in breakers {
            if let Ok(s) = b.stats().await {
                stats.push(s);
            }
        }
        stats
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn breaker(threshold: i64, reset_timeout: u64) -> CircuitBreaker {
        let config = BreakerDefaults {
            failure_threshold: threshold,
            failure_window_seconds: 60,
            reset_timeout_seconds: reset_timeout,
            success_threshold: 2,
        };
        CircuitBreaker::new("binance", config, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let b = breaker(3, 30);

        for _ in 0..2 {
            b.record_failure("boom").await.unwrap();
            assert!(b.can_execute().await.unwrap());
        }
        b.record_failure("boom").await.unwrap();

        assert_eq!(b.state().await.unwrap(), CircuitState::Open);
        assert!(!b.can_execute().await.unwrap());
        assert!(b.time_remaining().await.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_run() {
        let b = breaker(3, 30);

        b.record_failure("boom").await.unwrap();
        b.record_failure("boom").await.unwrap();
        b.record_success().await.unwrap();
        b.record_failure("boom").await.unwrap();
        b.record_failure("boom").await.unwrap();

        // The run restarted after the success, so the circuit is still closed.
        assert_eq!(b.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn full_recovery_cycle() {
        let b = breaker(3, 1);

        for _ in 0..3 {
            b.record_failure("boom").await.unwrap();
        }
        assert!(!b.can_execute().await.unwrap());

        // Wait out the reset timeout, then the next call probes.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(b.can_execute().await.unwrap());
        assert_eq!(b.state().await.unwrap(), CircuitState::HalfOpen);

        // success_threshold = 2 closes the circuit.
        b.record_success().await.unwrap();
        assert_eq!(b.state().await.unwrap(), CircuitState::HalfOpen);
        b.record_success().await.unwrap();
        assert_eq!(b.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failure_during_probe_reopens() {
        let b = breaker(3, 1);

        for _ in 0..3 {
            b.record_failure("boom").await.unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(b.can_execute().await.unwrap());

        b.record_failure("still down").await.unwrap();
        assert_eq!(b.state().await.unwrap(), CircuitState::Open);
        assert!(!b.can_execute().await.unwrap());
    }

    #[tokio::test]
    async fn guard_surfaces_circuit_open_error() {
        let b = breaker(1, 30);
        b.record_failure("boom").await.unwrap();

        match b.guard().await {
            Err(EngineError::CircuitOpen { service, retry_in }) => {
                assert_eq!(service, "binance");
                assert!(retry_in > 0.0);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn registry_reuses_breakers_per_service() {
        let registry = BreakerRegistry::new(
            Arc::new(MemoryStore::new()),
            BreakerDefaults::default(),
        );
        let a = registry.breaker("Binance");
        let b = registry.breaker("binance");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
