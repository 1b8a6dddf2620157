// =============================================================================
// Parallel Fetcher — concurrent whale-position polling through the proxy pool
// =============================================================================
//
// Concurrency contract:
//   - one global semaphore (default 25) caps total in-flight requests
//   - one semaphore per exchange caps per-venue concurrency; both must be
//     held for a request to run
//   - one retry with a fresh proxy; rate-limited outcomes consult the
//     Rate-Limit Manager and wait its (bounded) backoff
//
// Every outcome is recorded with both the proxy pool and the rate-limit
// manager before the result is returned.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::proxy::{ProxyPool, ProxySelection};
use crate::ratelimit::RateLimitManager;
use crate::types::{Exchange, TradeSide, TradeType, TraderPosition, Whale};

/// Per-venue concurrency caps. Bitget and OKX block aggressively; Hyperliquid
/// is on-chain data with generous limits.
fn exchange_concurrency(exchange: Exchange) -> usize {
    match exchange {
        Exchange::Binance => 10,
        Exchange::Bybit => 5,
        Exchange::Okx => 3,
        Exchange::Bitget => 3,
        Exchange::Hyperliquid => 10,
    }
}

/// Result of one whale's fetch attempt chain.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub whale_id: i64,
    pub success: bool,
    pub positions: Vec<TraderPosition>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub proxy_id: Option<u32>,
    pub rate_limited: bool,
}

impl FetchResult {
    fn failure(whale_id: i64, error: impl Into<String>, rate_limited: bool) -> Self {
        Self {
            whale_id,
            success: false,
            positions: Vec::new(),
            error: Some(error.into()),
            latency_ms: 0,
            proxy_id: None,
            rate_limited,
        }
    }
}

pub struct ParallelFetcher {
    proxy_pool: Arc<ProxyPool>,
    rate_limits: Arc<RateLimitManager>,
    config: FetchConfig,
    global: Semaphore,
    per_exchange: HashMap<Exchange, Semaphore>,
}

impl ParallelFetcher {
    pub fn new(
        proxy_pool: Arc<ProxyPool>,
        rate_limits: Arc<RateLimitManager>,
        config: FetchConfig,
    ) -> Self {
        let per_exchange = Exchange::all()
            .into_iter()
            .map(|e| (e, Semaphore::new(exchange_concurrency(e))))
            .collect();
        Self {
            proxy_pool,
            rate_limits,
            global: Semaphore::new(config.max_concurrent),
            per_exchange,
            config,
        }
    }

    /// Fetch current positions for every whale in the batch concurrently.
    pub async fn fetch_all(&self, whales: &[Whale]) -> HashMap<i64, FetchResult> {
        if whales.is_empty() {
            return HashMap::new();
        }

        let results = join_all(whales.iter().map(|w| self.fetch_with_semaphores(w))).await;

        let mut map = HashMap::with_capacity(results.len());
        let mut success = 0usize;
        let mut rate_limited = 0usize;
        for result in results {
            if result.success {
                success += 1;
            }
            if result.rate_limited {
                rate_limited += 1;
            }
            map.insert(result.whale_id, result);
        }
        info!(
            total = whales.len(),
            success, rate_limited, "parallel fetch cycle complete"
        );
        map
    }

    async fn fetch_with_semaphores(&self, whale: &Whale) -> FetchResult {
        // Both permits must be held; global first so one hot venue cannot
        // starve the pool.
        let Ok(_global) = self.global.acquire().await else {
            return FetchResult::failure(whale.id, "fetcher shutting down", false);
        };
        let venue_semaphore = match self.per_exchange.get(&whale.exchange) {
            Some(s) => s,
            None => return FetchResult::failure(whale.id, "unsupported exchange", false),
        };
        let Ok(_venue) = venue_semaphore.acquire().await else {
            return FetchResult::failure(whale.id, "fetcher shutting down", false);
        };

        self.fetch_with_retry(whale).await
    }

    async fn fetch_with_retry(&self, whale: &Whale) -> FetchResult {
        let exchange = whale.exchange;

        // Respect any venue-wide cooldown before the first attempt.
        if let Ok(false) = self.rate_limits.can_proceed(exchange).await {
            if let Ok(waited) = self.rate_limits.wait_if_needed(exchange).await {
                if waited > 0.0 {
                    debug!(whale = %whale.name, exchange = %exchange, waited, "cooldown wait");
                }
            }
            // Still limited after the bounded wait: surface as rate-limited
            // so the scheduler re-enqueues the whale next tick.
            if let Ok(false) = self.rate_limits.can_proceed(exchange).await {
                return FetchResult::failure(whale.id, "venue cooling down", true);
            }
        }

        let mut last: Option<FetchResult> = None;
        for attempt in 0..=self.config.retry_count {
            let proxy = self.proxy_pool.pick(exchange);
            let started = Instant::now();
            let mut result = self.attempt(whale, proxy.as_ref()).await;
            result.latency_ms = started.elapsed().as_millis() as u64;
            result.proxy_id = proxy.as_ref().map(|p| p.id);

            if let Some(proxy) = &proxy {
                self.proxy_pool
                    .record(
                        proxy.id,
                        exchange,
                        result.success,
                        result.latency_ms,
                        result.rate_limited,
                    )
                    .await;
            }

            if result.success {
                let _ = self.rate_limits.record_success(exchange).await;
                return result;
            }

            if result.rate_limited {
                let backoff = self
                    .rate_limits
                    .record_rate_limit(exchange)
                    .await
                    .unwrap_or(2);
                warn!(
                    whale = %whale.name,
                    exchange = %exchange,
                    backoff,
                    attempt = attempt + 1,
                    "fetch rate limited"
                );
                if attempt < self.config.retry_count {
                    tokio::time::sleep(Duration::from_secs(backoff.min(10))).await;
                }
            } else if attempt < self.config.retry_count {
                // Fresh proxy next loop; brief linear backoff.
                tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
            }
            last = Some(result);
        }

        last.unwrap_or_else(|| FetchResult::failure(whale.id, "max retries exceeded", false))
    }

    /// One HTTP attempt through one proxy.
    async fn attempt(&self, whale: &Whale, proxy: Option<&ProxySelection>) -> FetchResult {
        let client = match self.build_client(proxy) {
            Ok(c) => c,
            Err(e) => return FetchResult::failure(whale.id, format!("client build: {e}"), false),
        };

        let response = match whale.exchange {
            Exchange::Binance => {
                let body = json!({
                    "encryptedUid": whale.exchange_uid,
                    "tradeType": "PERPETUAL",
                });
                client
                    .post("https://www.binance.com/bapi/futures/v1/public/future/leaderboard/getOtherPosition")
                    .json(&body)
                    .send()
                    .await
            }
            Exchange::Bybit => {
                let body = json!({ "leaderMark": whale.exchange_uid, "pageSize": 50 });
                client
                    .post("https://api2.bybit.com/fapi/beehive/public/v1/common/position/list")
                    .json(&body)
                    .send()
                    .await
            }
            Exchange::Okx => client
                .get(format!(
                    "https://www.okx.com/api/v5/copytrading/public-current-subpositions?uniqueCode={}",
                    whale.exchange_uid
                ))
                .send()
                .await,
            Exchange::Bitget => client
                .get(format!(
                    "https://api.bitget.com/api/v2/copy/mix-trader/order-current-track?traderId={}&pageSize=50",
                    whale.exchange_uid
                ))
                .send()
                .await,
            Exchange::Hyperliquid => {
                let body = json!({ "type": "clearinghouseState", "user": whale.exchange_uid });
                client
                    .post("https://api.hyperliquid.xyz/info")
                    .json(&body)
                    .send()
                    .await
            }
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let msg = e.to_string();
                if e.is_timeout() {
                    return FetchResult::failure(whale.id, "timeout", false);
                }
                return FetchResult::failure(whale.id, &msg, is_rate_limit_text(&msg));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return FetchResult::failure(whale.id, e.to_string(), false),
        };

        if !status.is_success() {
            let rate_limited = is_rate_limited_response(status.as_u16(), &body);
            return FetchResult::failure(
                whale.id,
                format!("HTTP {status}: {}", snippet(&body, 200)),
                rate_limited,
            );
        }
        // Some venues answer 200 with an embedded throttle code.
        if body.contains("-1015") || body.contains("\"50011\"") {
            return FetchResult::failure(whale.id, "embedded rate-limit code", true);
        }

        let value: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => return FetchResult::failure(whale.id, format!("bad JSON: {e}"), false),
        };

        match parse_positions(whale.exchange, &value) {
            Ok(positions) => FetchResult {
                whale_id: whale.id,
                success: true,
                positions,
                error: None,
                latency_ms: 0,
                proxy_id: None,
                rate_limited: false,
            },
            Err(e) => FetchResult::failure(whale.id, e, false),
        }
    }

    fn build_client(&self, proxy: Option<&ProxySelection>) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .timeout(Duration::from_secs(self.config.read_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(self.config.pool_timeout_secs))
            .pool_max_idle_per_host(20);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(&proxy.url)?);
        }
        Ok(builder.build()?)
    }
}

// ---------------------------------------------------------------------------
// Rate-limit classification
// ---------------------------------------------------------------------------

/// HTTP-level classification: 429/418 always, 403 only with rate/limit text,
/// plus the venue-embedded codes (Binance -1015, OKX 50011).
pub fn is_rate_limited_response(status: u16, body: &str) -> bool {
    if status == 429 || status == 418 {
        return true;
    }
    let lowered = body.to_ascii_lowercase();
    if status == 403 && (lowered.contains("rate") || lowered.contains("limit")) {
        return true;
    }
    body.contains("-1015") || body.contains("50011")
}

/// Char-boundary-safe prefix for error messages.
fn snippet(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Message-level classification for exceptions without an HTTP status.
pub fn is_rate_limit_text(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("rate")
        || lowered.contains("limit")
        || lowered.contains("too many")
        || lowered.contains("429")
}

// ---------------------------------------------------------------------------
// Per-venue position parsing
// ---------------------------------------------------------------------------

fn dec_of(value: &Value, key: &str) -> Decimal {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(Decimal::ZERO),
        Some(Value::Number(n)) => n.to_string().parse().unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

/// Normalize a venue payload into the engine's `TraderPosition` set.
pub fn parse_positions(exchange: Exchange, body: &Value) -> Result<Vec<TraderPosition>, String> {
    match exchange {
        Exchange::Binance => {
            let list = body
                .pointer("/data/otherPositionRetList")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            Ok(list
                .iter()
                .filter_map(|p| {
                    let amount = dec_of(p, "amount");
                    if amount.is_zero() {
                        return None;
                    }
                    let entry_price = dec_of(p, "entryPrice");
                    let mark = dec_of(p, "markPrice");
                    let side = if amount > Decimal::ZERO {
                        TradeSide::Buy
                    } else {
                        TradeSide::Sell
                    };
                    Some(TraderPosition {
                        symbol: crate::exchanges::normalize_symbol(
                            p.get("symbol").and_then(|v| v.as_str()).unwrap_or(""),
                        ),
                        side,
                        trade_type: if side == TradeSide::Buy {
                            TradeType::FuturesLong
                        } else {
                            TradeType::FuturesShort
                        },
                        quantity: amount.abs(),
                        entry_price,
                        size_usd: (amount.abs() * if mark.is_zero() { entry_price } else { mark }),
                        leverage: dec_of(p, "leverage").max(Decimal::ONE),
                    })
                })
                .collect())
        }
        Exchange::Bybit => {
            let list = body
                .pointer("/result/data")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            Ok(list
                .iter()
                .filter_map(|p| {
                    let size = dec_of(p, "sizeX").max(dec_of(p, "size"));
                    if size.is_zero() {
                        return None;
                    }
                    let is_long = p.get("side").and_then(|v| v.as_i64()) == Some(0)
                        || p.get("side").and_then(|v| v.as_str()) == Some("Buy");
                    Some(TraderPosition {
                        symbol: crate::exchanges::normalize_symbol(
                            p.get("symbol").and_then(|v| v.as_str()).unwrap_or(""),
                        ),
                        side: if is_long { TradeSide::Buy } else { TradeSide::Sell },
                        trade_type: if is_long {
                            TradeType::FuturesLong
                        } else {
                            TradeType::FuturesShort
                        },
                        quantity: size,
                        entry_price: dec_of(p, "entryPrice"),
                        size_usd: size * dec_of(p, "entryPrice"),
                        // leverageE2 is scaled by 100 on the beehive API.
                        leverage: {
                            let e2 = dec_of(p, "leverageE2");
                            if e2.is_zero() {
                                dec_of(p, "leverage").max(Decimal::ONE)
                            } else {
                                (e2 / Decimal::ONE_HUNDRED).max(Decimal::ONE)
                            }
                        },
                    })
                })
                .collect())
        }
        Exchange::Okx => {
            let list = body
                .get("data")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            Ok(list
                .iter()
                .filter_map(|p| {
                    let qty = dec_of(p, "subPos");
                    if qty.is_zero() {
                        return None;
                    }
                    let is_long = p.get("posSide").and_then(|v| v.as_str()) == Some("long");
                    let entry = dec_of(p, "openAvgPx");
                    Some(TraderPosition {
                        symbol: crate::exchanges::normalize_symbol(
                            p.get("instId").and_then(|v| v.as_str()).unwrap_or(""),
                        ),
                        side: if is_long { TradeSide::Buy } else { TradeSide::Sell },
                        trade_type: if is_long {
                            TradeType::FuturesLong
                        } else {
                            TradeType::FuturesShort
                        },
                        quantity: qty.abs(),
                        entry_price: entry,
                        size_usd: qty.abs() * entry,
                        leverage: dec_of(p, "lever").max(Decimal::ONE),
                    })
                })
                .collect())
        }
        Exchange::Bitget => {
            let list = body
                .pointer("/data/trackingList")
                .and_then(|v| v.as_array())
                .or_else(|| body.get("data").and_then(|v| v.as_array()))
                .cloned()
                .unwrap_or_default();
            Ok(list
                .iter()
                .filter_map(|p| {
                    let qty = dec_of(p, "openSize").max(dec_of(p, "size"));
                    if qty.is_zero() {
                        return None;
                    }
                    let is_long = p.get("holdSide").and_then(|v| v.as_str()) == Some("long");
                    let entry = dec_of(p, "openPriceAvg").max(dec_of(p, "openPrice"));
                    Some(TraderPosition {
                        symbol: crate::exchanges::normalize_symbol(
                            p.get("symbol").and_then(|v| v.as_str()).unwrap_or(""),
                        ),
                        side: if is_long { TradeSide::Buy } else { TradeSide::Sell },
                        trade_type: if is_long {
                            TradeType::FuturesLong
                        } else {
                            TradeType::FuturesShort
                        },
                        quantity: qty,
                        entry_price: entry,
                        size_usd: qty * entry,
                        leverage: dec_of(p, "leverage").max(Decimal::ONE),
                    })
                })
                .collect())
        }
        Exchange::Hyperliquid => {
            let list = body
                .get("assetPositions")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            Ok(list
                .iter()
                .filter_map(|entry| {
                    let p = entry.get("position")?;
                    let szi = dec_of(p, "szi");
                    if szi.is_zero() {
                        return None;
                    }
                    let coin = p.get("coin").and_then(|v| v.as_str()).unwrap_or("");
                    let is_long = szi > Decimal::ZERO;
                    let leverage = p
                        .pointer("/leverage/value")
                        .and_then(|v| v.as_i64())
                        .map(Decimal::from)
                        .unwrap_or(Decimal::ONE);
                    Some(TraderPosition {
                        symbol: format!("{}USDT", coin.to_ascii_uppercase()),
                        side: if is_long { TradeSide::Buy } else { TradeSide::Sell },
                        trade_type: if is_long {
                            TradeType::FuturesLong
                        } else {
                            TradeType::FuturesShort
                        },
                        quantity: szi.abs(),
                        entry_price: dec_of(p, "entryPx"),
                        size_usd: dec_of(p, "positionValue"),
                        leverage,
                    })
                })
                .collect())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn classification_matrix() {
        assert!(is_rate_limited_response(429, ""));
        assert!(is_rate_limited_response(418, "teapot"));
        assert!(is_rate_limited_response(403, "request rate exceeded"));
        assert!(!is_rate_limited_response(403, "forbidden region"));
        assert!(is_rate_limited_response(200, "{\"code\":-1015}"));
        assert!(is_rate_limited_response(200, "{\"code\":\"50011\"}"));
        assert!(!is_rate_limited_response(502, "bad gateway"));

        assert!(is_rate_limit_text("Too Many Requests"));
        assert!(is_rate_limit_text("429 slow down"));
        assert!(!is_rate_limit_text("connection refused"));
    }

    #[test]
    fn binance_leaderboard_positions_parse() {
        let body = json!({
            "data": {
                "otherPositionRetList": [
                    {"symbol": "BTCUSDT", "amount": "1.5", "entryPrice": "60000",
                     "markPrice": "61000", "leverage": "10"},
                    {"symbol": "ETHUSDT", "amount": "-10", "entryPrice": "3000",
                     "markPrice": "0", "leverage": "5"},
                    {"symbol": "DOGEUSDT", "amount": "0", "entryPrice": "0.1"}
                ]
            }
        });
        let positions = parse_positions(Exchange::Binance, &body).unwrap();
        assert_eq!(positions.len(), 2);

        assert_eq!(positions[0].side, TradeSide::Buy);
        assert_eq!(positions[0].trade_type, TradeType::FuturesLong);
        assert_eq!(positions[0].quantity, dec!(1.5));
        assert_eq!(positions[0].size_usd, dec!(91500));

        assert_eq!(positions[1].side, TradeSide::Sell);
        assert_eq!(positions[1].trade_type, TradeType::FuturesShort);
        // Zero mark price falls back to entry.
        assert_eq!(positions[1].size_usd, dec!(30000));
    }

    #[test]
    fn hyperliquid_clearinghouse_positions_parse() {
        let body = json!({
            "assetPositions": [
                {"position": {"coin": "BTC", "szi": "-0.8", "entryPx": "64000",
                              "positionValue": "51200", "leverage": {"value": 20}}},
                {"position": {"coin": "SOL", "szi": "0", "entryPx": "150"}}
            ]
        });
        let positions = parse_positions(Exchange::Hyperliquid, &body).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTCUSDT");
        assert_eq!(positions[0].side, TradeSide::Sell);
        assert_eq!(positions[0].quantity, dec!(0.8));
        assert_eq!(positions[0].leverage, dec!(20));
    }

    #[test]
    fn okx_subpositions_parse() {
        let body = json!({
            "data": [
                {"instId": "BTC-USDT-SWAP", "posSide": "long", "subPos": "2",
                 "openAvgPx": "50000", "lever": "10"}
            ]
        });
        let positions = parse_positions(Exchange::Okx, &body).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTCUSDT");
        assert_eq!(positions[0].size_usd, dec!(100000));
    }
}
