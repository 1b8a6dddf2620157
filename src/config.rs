// =============================================================================
// Engine Configuration — environment-sourced settings
// =============================================================================
//
// Every tunable the engine consults lives here, loaded once at startup from
// the environment (a `.env` file is honoured via dotenv in main). Unset
// variables fall back to the documented defaults; malformed values fail
// startup rather than silently trading with wrong limits.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::warn;

use crate::types::Exchange;

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Circuit-breaker defaults applied to every service unless overridden.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BreakerDefaults {
    pub failure_threshold: i64,
    pub failure_window_seconds: u64,
    pub reset_timeout_seconds: u64,
    pub success_threshold: i64,
}

impl Default for BreakerDefaults {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_seconds: 60,
            reset_timeout_seconds: 30,
            success_threshold: 2,
        }
    }
}

/// Per-tier polling cadence. Interval drives the tick loop, batch caps the
/// number of whales handed to the fetcher per tick.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TierConfig {
    pub interval_seconds: u64,
    pub max_whales: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PollingConfig {
    pub critical: TierConfig,
    pub high: TierConfig,
    pub normal: TierConfig,
    pub low: TierConfig,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            critical: TierConfig {
                interval_seconds: 2,
                max_whales: 10,
            },
            high: TierConfig {
                interval_seconds: 5,
                max_whales: 50,
            },
            normal: TierConfig {
                interval_seconds: 15,
                max_whales: 100,
            },
            low: TierConfig {
                interval_seconds: 60,
                max_whales: 200,
            },
        }
    }
}

/// Fetcher concurrency and HTTP deadlines.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FetchConfig {
    pub max_concurrent: usize,
    pub retry_count: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub pool_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 25,
            retry_count: 1,
            connect_timeout_secs: 5,
            read_timeout_secs: 15,
            pool_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    #[serde(skip)]
    pub database_url: String,
    #[serde(skip)]
    pub redis_url: Option<String>,
    pub bind_addr: String,

    // Proxy pool sources.
    pub proxy_list: Option<String>,
    pub proxy_pool_file: Option<String>,

    // Risk gate constants.
    pub min_trading_balance_usdt: Decimal,
    pub min_trade_size_usdt: Decimal,
    pub max_trade_size_usdt: Decimal,
    pub trade_size_buffer_percent: Decimal,
    /// Minimum order notionals keyed `<EXCHANGE>_<SPOT|FUTURES>`.
    pub exchange_min_notional: HashMap<String, Decimal>,

    pub signal_expiry_seconds: i64,
    pub polling: PollingConfig,
    pub fetch: FetchConfig,
    pub breaker: BreakerDefaults,

    // Background loop cadence.
    pub mark_to_market_interval_seconds: u64,
    pub queue_cleanup_interval_seconds: u64,
    pub priority_recompute_interval_seconds: u64,
    pub reconcile_interval_seconds: u64,
}

impl EngineConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let database_url = env_string("DATABASE_URL")
            .context("DATABASE_URL is required (postgres://...)")?;
        let redis_url = env_string("REDIS_URL");
        if redis_url.is_none() {
            warn!("REDIS_URL not set, breaker/proxy/rate-limit state is process-local");
        }

        let mut exchange_min_notional = default_min_notionals();
        if let Some(raw) = env_string("EXCHANGE_MIN_NOTIONAL") {
            let overrides: HashMap<String, Decimal> = serde_json::from_str(&raw)
                .context("EXCHANGE_MIN_NOTIONAL must be a JSON object of key -> amount")?;
            exchange_min_notional.extend(overrides);
        }

        let polling = PollingConfig {
            critical: TierConfig {
                interval_seconds: env_parse("POLL_CRITICAL_INTERVAL_SECONDS", 2u64)?,
                max_whales: env_parse("POLL_CRITICAL_BATCH", 10i64)?,
            },
            high: TierConfig {
                interval_seconds: env_parse("POLL_HIGH_INTERVAL_SECONDS", 5u64)?,
                max_whales: env_parse("POLL_HIGH_BATCH", 50i64)?,
            },
            normal: TierConfig {
                interval_seconds: env_parse("POLL_NORMAL_INTERVAL_SECONDS", 15u64)?,
                max_whales: env_parse("POLL_NORMAL_BATCH", 100i64)?,
            },
            low: TierConfig {
                interval_seconds: env_parse("POLL_LOW_INTERVAL_SECONDS", 60u64)?,
                max_whales: env_parse("POLL_LOW_BATCH", 200i64)?,
            },
        };

        let breaker = BreakerDefaults {
            failure_threshold: env_parse("CB_FAILURE_THRESHOLD", 5i64)?,
            failure_window_seconds: env_parse("CB_FAILURE_WINDOW_SECONDS", 60u64)?,
            reset_timeout_seconds: env_parse("CB_RESET_TIMEOUT_SECONDS", 30u64)?,
            success_threshold: env_parse("CB_SUCCESS_THRESHOLD", 2i64)?,
        };

        Ok(Self {
            database_url,
            redis_url,
            bind_addr: env_string("CACHALOT_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3001".into()),
            proxy_list: env_string("PROXY_LIST"),
            proxy_pool_file: env_string("PROXY_POOL_FILE"),
            min_trading_balance_usdt: env_parse("MIN_TRADING_BALANCE_USDT", dec!(10))?,
            min_trade_size_usdt: env_parse("MIN_TRADE_SIZE_USDT", dec!(5))?,
            max_trade_size_usdt: env_parse("MAX_TRADE_SIZE_USDT", dec!(10000))?,
            trade_size_buffer_percent: env_parse("TRADE_SIZE_BUFFER_PERCENT", dec!(5))?,
            exchange_min_notional,
            signal_expiry_seconds: env_parse("SIGNAL_EXPIRY_SECONDS", 60i64)?,
            polling,
            fetch: FetchConfig::default(),
            breaker,
            mark_to_market_interval_seconds: env_parse("MARK_TO_MARKET_INTERVAL_SECONDS", 10u64)?,
            queue_cleanup_interval_seconds: env_parse("QUEUE_CLEANUP_INTERVAL_SECONDS", 30u64)?,
            priority_recompute_interval_seconds: env_parse(
                "PRIORITY_RECOMPUTE_INTERVAL_SECONDS",
                300u64,
            )?,
            reconcile_interval_seconds: env_parse("RECONCILE_INTERVAL_SECONDS", 60u64)?,
        })
    }

    /// Minimum order notional for a venue and market type, before the fee
    /// buffer is applied.
    pub fn min_notional(&self, exchange: Exchange, is_futures: bool) -> Decimal {
        let key = format!(
            "{}_{}",
            exchange.as_str(),
            if is_futures { "FUTURES" } else { "SPOT" }
        );
        self.exchange_min_notional
            .get(&key)
            .copied()
            .unwrap_or(self.min_trade_size_usdt)
    }
}

fn default_min_notionals() -> HashMap<String, Decimal> {
    let mut m = HashMap::new();
    m.insert("BINANCE_SPOT".into(), dec!(5));
    m.insert("BINANCE_FUTURES".into(), dec!(5));
    m.insert("BYBIT_SPOT".into(), dec!(1));
    m.insert("BYBIT_FUTURES".into(), dec!(5));
    m.insert("OKX_SPOT".into(), dec!(1));
    m.insert("OKX_FUTURES".into(), dec!(5));
    m.insert("BITGET_SPOT".into(), dec!(1));
    m.insert("BITGET_FUTURES".into(), dec!(5));
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_notional_falls_back_to_min_trade_size() {
        let config = EngineConfig {
            database_url: String::new(),
            redis_url: None,
            bind_addr: String::new(),
            proxy_list: None,
            proxy_pool_file: None,
            min_trading_balance_usdt: dec!(10),
            min_trade_size_usdt: dec!(5),
            max_trade_size_usdt: dec!(10000),
            trade_size_buffer_percent: dec!(5),
            exchange_min_notional: default_min_notionals(),
            signal_expiry_seconds: 60,
            polling: PollingConfig::default(),
            fetch: FetchConfig::default(),
            breaker: BreakerDefaults::default(),
            mark_to_market_interval_seconds: 10,
            queue_cleanup_interval_seconds: 30,
            priority_recompute_interval_seconds: 300,
            reconcile_interval_seconds: 60,
        };

        assert_eq!(config.min_notional(Exchange::Binance, true), dec!(5));
        // Hyperliquid has no configured notional and uses the floor.
        assert_eq!(config.min_notional(Exchange::Hyperliquid, true), dec!(5));
    }
}
