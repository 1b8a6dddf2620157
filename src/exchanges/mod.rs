// =============================================================================
// Exchange Port — uniform interface over heterogeneous venue adapters
// =============================================================================
//
// Every adapter speaks the same `ExchangePort` trait and returns the same
// normalized `OrderResult`. Venue quirks (signing schemes, hedge-mode flags,
// reduce-only params, filter names) stay inside the adapter files.
//
// Precision is non-negotiable: a quantity that quantizes to zero against the
// venue's LOT_SIZE step is an `invalid trade size` validation error, never a
// silent skip.
//
// Outbound calls are wrapped breaker-outermost with retry inside; see
// `guarded_call`.
// =============================================================================

pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod okx;

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{EngineError, EngineResult};
use crate::ratelimit::RateLimitManager;
use crate::types::{Exchange, PositionSide, TradeSide};

/// Delay before the single transient-error retry.
const RETRY_DELAY_MS: u64 = 500;
/// Rate-limit waits inside the wrapper are bounded per attempt.
const MAX_RETRY_WAIT_SECONDS: u64 = 10;

// ---------------------------------------------------------------------------
// Normalized results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Pending,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Pending => "PENDING",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Expired)
    }
}

/// Every adapter call normalizes the venue response into this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: TradeSide,
    pub order_type: String,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

/// Venue filters needed for order precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// LOT_SIZE step.
    pub step_size: Decimal,
    /// PRICE_FILTER tick.
    pub tick_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountBalance {
    pub total_usdt: Decimal,
    pub available_usdt: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// Venue credentials. OKX and Bitget additionally require the passphrase.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// The port
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExchangePort: Send + Sync {
    fn name(&self) -> Exchange;

    /// Verify connectivity and credentials before first use.
    async fn initialize(&self) -> EngineResult<()>;

    /// Release the session. Adapters with pooled HTTP clients treat this as a
    /// no-op but callers always invoke it in a guaranteed-release scope.
    async fn close(&self) -> EngineResult<()>;

    // -- Spot -----------------------------------------------------------------
    async fn spot_market_buy(&self, symbol: &str, quantity: Decimal) -> EngineResult<OrderResult>;
    async fn spot_market_sell(&self, symbol: &str, quantity: Decimal)
        -> EngineResult<OrderResult>;
    async fn spot_limit_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult>;
    async fn spot_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult>;

    // -- Futures --------------------------------------------------------------
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()>;
    async fn futures_market_long(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult>;
    async fn futures_market_short(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult>;
    /// Reduce-only close of an existing position; `quantity` of None closes
    /// the full size the venue reports.
    async fn futures_close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Option<Decimal>,
    ) -> EngineResult<OrderResult>;

    // -- Account --------------------------------------------------------------
    async fn get_account_balance(&self) -> EngineResult<AccountBalance>;
    async fn get_asset_balance(&self, asset: &str) -> EngineResult<AssetBalance>;
    async fn get_futures_balance(&self) -> EngineResult<AccountBalance>;
    async fn transfer_to_futures(&self, asset: &str, amount: Decimal) -> EngineResult<()>;
    async fn transfer_to_spot(&self, asset: &str, amount: Decimal) -> EngineResult<()>;

    // -- Orders & market data -------------------------------------------------
    async fn get_order(
        &self,
        symbol: &str,
        order_id: &str,
        is_futures: bool,
    ) -> EngineResult<OrderResult>;
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        is_futures: bool,
    ) -> EngineResult<()>;
    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        is_futures: bool,
    ) -> EngineResult<Vec<OrderResult>>;
    async fn get_ticker_price(&self, symbol: &str) -> EngineResult<Decimal>;
    async fn get_symbol_info(&self, symbol: &str, is_futures: bool) -> EngineResult<SymbolInfo>;

    async fn get_min_notional(&self, symbol: &str, is_futures: bool) -> EngineResult<Decimal> {
        Ok(self.get_symbol_info(symbol, is_futures).await?.min_notional)
    }

    /// Quantize to the LOT_SIZE step. Zero after quantization is fatal.
    async fn round_quantity(
        &self,
        symbol: &str,
        quantity: Decimal,
        is_futures: bool,
    ) -> EngineResult<Decimal> {
        let info = self.get_symbol_info(symbol, is_futures).await?;
        let rounded = quantize_step(quantity, info.step_size);
        if rounded.is_zero() {
            return Err(EngineError::Validation(format!(
                "invalid trade size: {quantity} {symbol} quantizes to zero (step {})",
                info.step_size
            )));
        }
        Ok(rounded)
    }

    /// Quantize to the PRICE_FILTER tick.
    async fn round_price(
        &self,
        symbol: &str,
        price: Decimal,
        is_futures: bool,
    ) -> EngineResult<Decimal> {
        let info = self.get_symbol_info(symbol, is_futures).await?;
        Ok(quantize_step(price, info.tick_size))
    }

    // -- Stop-loss orders -----------------------------------------------------
    async fn place_stop_loss_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        stop_price: Decimal,
        is_futures: bool,
    ) -> EngineResult<OrderResult>;

    async fn cancel_stop_loss_order(
        &self,
        symbol: &str,
        order_id: &str,
        is_futures: bool,
    ) -> EngineResult<()> {
        self.cancel_order(symbol, order_id, is_futures).await
    }

    async fn modify_stop_loss_order(
        &self,
        symbol: &str,
        order_id: &str,
        side: PositionSide,
        quantity: Decimal,
        new_stop_price: Decimal,
        is_futures: bool,
    ) -> EngineResult<OrderResult> {
        self.cancel_order(symbol, order_id, is_futures).await?;
        self.place_stop_loss_order(symbol, side, quantity, new_stop_price, is_futures)
            .await
    }

    /// Stop price `percent` away from entry, against the position.
    fn calculate_stop_loss_price(
        &self,
        entry_price: Decimal,
        side: PositionSide,
        percent: Decimal,
    ) -> Decimal {
        let fraction = percent / dec!(100);
        match side {
            PositionSide::Long => entry_price * (Decimal::ONE - fraction),
            PositionSide::Short => entry_price * (Decimal::ONE + fraction),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the adapter for `exchange`. Hyperliquid is poll-only and has no
/// execution adapter.
pub fn build_executor(
    exchange: Exchange,
    credentials: Credentials,
) -> EngineResult<Box<dyn ExchangePort>> {
    match exchange {
        Exchange::Binance => Ok(Box::new(binance::BinanceExecutor::new(credentials))),
        Exchange::Bybit => Ok(Box::new(bybit::BybitExecutor::new(credentials))),
        Exchange::Okx => {
            if credentials.passphrase.is_none() {
                return Err(EngineError::Validation("OKX requires a passphrase".into()));
            }
            Ok(Box::new(okx::OkxExecutor::new(credentials)))
        }
        Exchange::Bitget => {
            if credentials.passphrase.is_none() {
                return Err(EngineError::Validation(
                    "Bitget requires a passphrase".into(),
                ));
            }
            Ok(Box::new(bitget::BitgetExecutor::new(credentials)))
        }
        Exchange::Hyperliquid => Err(EngineError::Validation(
            "Hyperliquid is poll-only, not an execution venue".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Breaker + retry wrapper
// ---------------------------------------------------------------------------

/// Run one adapter operation with the breaker consulted first and a single
/// retry for transient failures inside. Breaker bookkeeping only counts
/// errors that came from the venue; validation failures are the caller's.
pub async fn guarded_call<T, F, Fut>(
    breaker: &CircuitBreaker,
    rate_limits: &RateLimitManager,
    exchange: Exchange,
    op: F,
) -> EngineResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    breaker.guard().await?;

    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => {
                breaker.record_success().await?;
                rate_limits.record_success(exchange).await?;
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt == 0 => {
                attempt += 1;
                match &err {
                    EngineError::RateLimited { .. } => {
                        let backoff = rate_limits.record_rate_limit(exchange).await?;
                        let wait = backoff.min(MAX_RETRY_WAIT_SECONDS);
                        debug!(exchange = %exchange, wait, "rate limited, backing off before retry");
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    }
                    _ => {
                        debug!(exchange = %exchange, error = %err, "transient error, retrying once");
                        tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                    }
                }
            }
            Err(err) => {
                if venue_fault(&err) {
                    breaker.record_failure(&err.to_string()).await?;
                }
                if let EngineError::RateLimited { .. } = &err {
                    warn!(exchange = %exchange, "rate limited with retry exhausted");
                }
                return Err(err);
            }
        }
    }
}

/// Whether an error counts against the venue's circuit breaker.
fn venue_fault(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::Exchange(_)
            | EngineError::ExchangeRejected(_)
            | EngineError::Timeout(_)
            | EngineError::RateLimited { .. }
    )
}

// ---------------------------------------------------------------------------
// Symbol + precision helpers
// ---------------------------------------------------------------------------

/// Fold exchange-form symbols to the canonical form the engine stores:
/// strip "SWAP"/"-SWAP" markers and instrument dashes, dedupe the quote
/// ("BTC-USDT-SWAP" and "BTCUSDTSWAPUSDT" both become "BTCUSDT").
pub fn normalize_symbol(raw: &str) -> String {
    let mut symbol = raw.to_ascii_uppercase().replace('-', "").replace('/', "");
    if symbol.contains("SWAP") {
        symbol = symbol.replace("SWAP", "");
    }
    while symbol.contains("USDTUSDT") {
        symbol = symbol.replace("USDTUSDT", "USDT");
    }
    symbol
}

/// Floor `value` to a multiple of `step`. A zero step passes the value
/// through (venue reported no filter).
pub fn quantize_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

/// Pull a Decimal out of a JSON field that may be a string or a number.
pub(crate) fn json_decimal(value: &Value, key: &str) -> EngineResult<Decimal> {
    let field = value
        .get(key)
        .ok_or_else(|| EngineError::Exchange(format!("missing field {key} in response")))?;
    decimal_from_json(field)
        .ok_or_else(|| EngineError::Exchange(format!("unparseable decimal in field {key}")))
}

pub(crate) fn json_decimal_or(value: &Value, key: &str, default: Decimal) -> Decimal {
    value
        .get(key)
        .and_then(decimal_from_json)
        .unwrap_or(default)
}

fn decimal_from_json(field: &Value) -> Option<Decimal> {
    match field {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Shared HTTP-level classification for adapter responses: 429/418 and
/// rate-limit body markers become `RateLimited`, everything else is a generic
/// exchange error carrying the venue text.
pub(crate) fn classify_response_error(
    exchange: Exchange,
    status: reqwest::StatusCode,
    body: &str,
) -> EngineError {
    let lowered = body.to_ascii_lowercase();
    let rate_limited = status.as_u16() == 429
        || status.as_u16() == 418
        || (status.as_u16() == 403 && (lowered.contains("rate") || lowered.contains("limit")))
        || body.contains("-1015")
        || body.contains("50011");
    if rate_limited {
        EngineError::RateLimited {
            exchange: exchange.as_str().to_string(),
            backoff_seconds: 2,
        }
    } else if status.is_client_error() {
        // Non-rate-limit 4xx is a deterministic rejection; retrying repeats it.
        EngineError::ExchangeRejected(format!("{exchange} HTTP {status}: {body}"))
    } else {
        EngineError::Exchange(format!("{exchange} HTTP {status}: {body}"))
    }
}

pub(crate) fn request_error(exchange: Exchange, err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout(format!("{exchange}: {err}"))
    } else {
        EngineError::Exchange(format!("{exchange}: {err}"))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerDefaults;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn symbol_normalization_folds_swap_forms() {
        assert_eq!(normalize_symbol("BTCUSDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("BTCUSDTSWAPUSDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("BTC-USDT-SWAP"), "BTCUSDT");
        assert_eq!(normalize_symbol("eth/usdt"), "ETHUSDT");
    }

    #[test]
    fn quantize_floors_to_step() {
        // 100 USDT at 50 000 with step 0.001 -> 0.002 exactly.
        let qty = dec!(100) / dec!(50000);
        assert_eq!(quantize_step(qty, dec!(0.001)), dec!(0.002));

        assert_eq!(quantize_step(dec!(0.0299), dec!(0.001)), dec!(0.029));
        assert_eq!(quantize_step(dec!(5), Decimal::ZERO), dec!(5));
        // Coarser step than the quantity floors to zero; round_quantity turns
        // that into a validation error.
        assert_eq!(quantize_step(dec!(0.002), dec!(0.01)), dec!(0));
    }

    #[test]
    fn classification_catches_venue_specific_codes() {
        let err = classify_response_error(
            Exchange::Binance,
            reqwest::StatusCode::OK,
            "{\"code\":-1015,\"msg\":\"Too many orders\"}",
        );
        assert!(matches!(err, EngineError::RateLimited { .. }));

        let err = classify_response_error(
            Exchange::Okx,
            reqwest::StatusCode::OK,
            "{\"code\":\"50011\"}",
        );
        assert!(matches!(err, EngineError::RateLimited { .. }));

        let err = classify_response_error(
            Exchange::Binance,
            reqwest::StatusCode::BAD_GATEWAY,
            "upstream blew up",
        );
        assert!(matches!(err, EngineError::Exchange(_)));

        // Plain 4xx is a rejection, never retried.
        let err = classify_response_error(
            Exchange::Binance,
            reqwest::StatusCode::BAD_REQUEST,
            "{\"code\":-1013,\"msg\":\"Invalid quantity\"}",
        );
        assert!(matches!(err, EngineError::ExchangeRejected(_)));
    }

    #[tokio::test]
    async fn guarded_call_retries_once_then_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let breaker = CircuitBreaker::new("binance", BreakerDefaults::default(), store.clone());
        let rate_limits = RateLimitManager::new(store);

        let calls = AtomicU32::new(0);
        let result = guarded_call(&breaker, &rate_limits, Exchange::Binance, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EngineError::Timeout("read".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn guarded_call_fast_fails_when_circuit_open() {
        let store = Arc::new(MemoryStore::new());
        let defaults = BreakerDefaults {
            failure_threshold: 1,
            ..BreakerDefaults::default()
        };
        let breaker = CircuitBreaker::new("binance", defaults, store.clone());
        let rate_limits = RateLimitManager::new(store);
        breaker.record_failure("down").await.unwrap();

        let calls = AtomicU32::new(0);
        let result: EngineResult<u32> =
            guarded_call(&breaker, &rate_limits, Exchange::Binance, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(1) }
            })
            .await;

        assert!(matches!(result, Err(EngineError::CircuitOpen { .. })));
        // The operation never ran.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validation_errors_do_not_trip_the_breaker() {
        let store = Arc::new(MemoryStore::new());
        let defaults = BreakerDefaults {
            failure_threshold: 1,
            ..BreakerDefaults::default()
        };
        let breaker = CircuitBreaker::new("binance", defaults, store.clone());
        let rate_limits = RateLimitManager::new(store);

        let result: EngineResult<u32> =
            guarded_call(&breaker, &rate_limits, Exchange::Binance, || async {
                Err(EngineError::Validation("bad size".into()))
            })
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));

        // Breaker still admits calls.
        assert!(breaker.can_execute().await.unwrap());
    }
}
