// =============================================================================
// OKX Adapter — v5 API, spot + USDT swaps, passphrase-signed requests
// =============================================================================
//
// OKX signs `timestamp + METHOD + requestPath + body` with HMAC-SHA256 and
// sends it base64-encoded alongside the passphrase header. Instrument ids are
// dashed ("BTC-USDT", "BTC-USDT-SWAP"); canonical symbols are re-expanded on
// the way out and folded back on the way in.
// =============================================================================

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::exchanges::{
    json_decimal_or, request_error, AccountBalance, AssetBalance, Credentials, ExchangePort,
    OrderResult, OrderStatus, SymbolInfo,
};
use crate::types::{Exchange, PositionSide, TradeSide};

type HmacSha256 = Hmac<Sha256>;

const BASE: &str = "https://www.okx.com";

pub struct OkxExecutor {
    credentials: Credentials,
    client: reqwest::Client,
}

/// Expand a canonical symbol into an OKX instrument id.
pub fn inst_id(symbol: &str, is_futures: bool) -> String {
    let base = symbol.strip_suffix("USDT").unwrap_or(symbol);
    if is_futures {
        format!("{base}-USDT-SWAP")
    } else {
        format!("{base}-USDT")
    }
}

fn okx_side(side: TradeSide) -> &'static str {
    match side {
        TradeSide::Buy => "buy",
        TradeSide::Sell => "sell",
    }
}

fn td_mode(is_futures: bool) -> &'static str {
    if is_futures {
        "cross"
    } else {
        "cash"
    }
}

impl OkxExecutor {
    pub fn new(credentials: Credentials) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(15))
            .pool_max_idle_per_host(20)
            .build()
            .unwrap_or_default();
        Self {
            credentials,
            client,
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> EngineResult<String> {
        let message = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|_| EngineError::Fatal("HMAC rejected key".into()))?;
        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn unwrap_envelope(body: &str) -> EngineResult<Vec<Value>> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| EngineError::Exchange(format!("OKX bad JSON: {e}")))?;
        let code = value.get("code").and_then(|v| v.as_str()).unwrap_or("-1");
        if code != "0" {
            let msg = value
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            if code == "50011" {
                return Err(EngineError::RateLimited {
                    exchange: "OKX".into(),
                    backoff_seconds: 2,
                });
            }
            return Err(EngineError::ExchangeRejected(format!(
                "OKX code {code}: {msg}"
            )));
        }
        Ok(value
            .get("data")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> EngineResult<Vec<Value>> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let sign = self.sign(&timestamp, method.as_str(), path, &body_str)?;

        let mut req = self
            .client
            .request(method, format!("{BASE}{path}"))
            .header("OK-ACCESS-KEY", &self.credentials.api_key)
            .header("OK-ACCESS-SIGN", sign)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                self.credentials.passphrase.as_deref().unwrap_or_default(),
            )
            .header("Content-Type", "application/json");
        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let resp = req.send().await.map_err(|e| request_error(Exchange::Okx, e))?;
        let text = resp
            .text()
            .await
            .map_err(|e| request_error(Exchange::Okx, e))?;
        Self::unwrap_envelope(&text)
    }

    async fn public_get(&self, path: &str) -> EngineResult<Vec<Value>> {
        let resp = self
            .client
            .get(format!("{BASE}{path}"))
            .send()
            .await
            .map_err(|e| request_error(Exchange::Okx, e))?;
        let text = resp
            .text()
            .await
            .map_err(|e| request_error(Exchange::Okx, e))?;
        Self::unwrap_envelope(&text)
    }

    async fn place_order(
        &self,
        symbol: &str,
        is_futures: bool,
        side: TradeSide,
        ord_type: &str,
        quantity: Decimal,
        price: Option<Decimal>,
        reduce_only: bool,
    ) -> EngineResult<OrderResult> {
        let inst = inst_id(symbol, is_futures);
        let cl_ord_id = format!("cch{}", Uuid::new_v4().simple());
        let mut payload = json!({
            "instId": inst,
            "tdMode": td_mode(is_futures),
            "side": okx_side(side),
            "ordType": ord_type,
            "sz": quantity.normalize().to_string(),
            "clOrdId": cl_ord_id,
        });
        let map = payload.as_object_mut().expect("literal object");
        if !is_futures && ord_type == "market" {
            // Size market orders in base units, not quote.
            map.insert("tgtCcy".into(), json!("base_ccy"));
        }
        if let Some(price) = price {
            map.insert("px".into(), json!(price.normalize().to_string()));
        }
        if reduce_only {
            map.insert("reduceOnly".into(), json!(true));
        }

        let data = self
            .request(reqwest::Method::POST, "/api/v5/trade/order", Some(&payload))
            .await?;
        let entry = data
            .first()
            .ok_or_else(|| EngineError::Exchange("OKX order: empty data".into()))?;
        let ord_id = entry
            .get("ordId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Exchange("OKX order: missing ordId".into()))?
            .to_string();

        self.get_order(symbol, &ord_id, is_futures).await
    }
}

#[async_trait]
impl ExchangePort for OkxExecutor {
    fn name(&self) -> Exchange {
        Exchange::Okx
    }

    #[instrument(skip(self), name = "okx::initialize")]
    async fn initialize(&self) -> EngineResult<()> {
        self.request(reqwest::Method::GET, "/api/v5/account/balance?ccy=USDT", None)
            .await?;
        debug!("okx executor initialised");
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }

    // -- Spot -----------------------------------------------------------------

    async fn spot_market_buy(&self, symbol: &str, quantity: Decimal) -> EngineResult<OrderResult> {
        self.place_order(symbol, false, TradeSide::Buy, "market", quantity, None, false)
            .await
    }

    async fn spot_market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_order(symbol, false, TradeSide::Sell, "market", quantity, None, false)
            .await
    }

    async fn spot_limit_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_order(symbol, false, TradeSide::Buy, "limit", quantity, Some(price), false)
            .await
    }

    async fn spot_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_order(symbol, false, TradeSide::Sell, "limit", quantity, Some(price), false)
            .await
    }

    // -- Futures --------------------------------------------------------------

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let payload = json!({
            "instId": inst_id(symbol, true),
            "lever": leverage.to_string(),
            "mgnMode": "cross",
        });
        self.request(
            reqwest::Method::POST,
            "/api/v5/account/set-leverage",
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    async fn futures_market_long(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_order(symbol, true, TradeSide::Buy, "market", quantity, None, false)
            .await
    }

    async fn futures_market_short(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_order(symbol, true, TradeSide::Sell, "market", quantity, None, false)
            .await
    }

    async fn futures_close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Option<Decimal>,
    ) -> EngineResult<OrderResult> {
        match quantity {
            Some(qty) => {
                self.place_order(symbol, true, side.closing_side(), "market", qty, None, true)
                    .await
            }
            None => {
                // Venue-side full close; the response has no fill details, so
                // report a market order sized by the venue.
                let payload = json!({
                    "instId": inst_id(symbol, true),
                    "mgnMode": "cross",
                });
                let data = self
                    .request(
                        reqwest::Method::POST,
                        "/api/v5/trade/close-position",
                        Some(&payload),
                    )
                    .await?;
                let entry = data.first().cloned().unwrap_or(Value::Null);
                Ok(OrderResult {
                    order_id: entry
                        .get("ordId")
                        .and_then(|v| v.as_str())
                        .unwrap_or("close-position")
                        .to_string(),
                    client_order_id: None,
                    symbol: symbol.to_string(),
                    side: side.closing_side(),
                    order_type: "MARKET".into(),
                    status: OrderStatus::Filled,
                    quantity: Decimal::ZERO,
                    filled_quantity: Decimal::ZERO,
                    price: None,
                    avg_fill_price: None,
                    fee: Decimal::ZERO,
                    fee_currency: Some("USDT".into()),
                    timestamp: Utc::now(),
                })
            }
        }
    }

    // -- Account --------------------------------------------------------------

    async fn get_account_balance(&self) -> EngineResult<AccountBalance> {
        let data = self
            .request(reqwest::Method::GET, "/api/v5/account/balance?ccy=USDT", None)
            .await?;
        let account = data
            .first()
            .ok_or_else(|| EngineError::Exchange("OKX balance: empty data".into()))?;
        let detail = account
            .get("details")
            .and_then(|v| v.as_array())
            .and_then(|d| d.first())
            .cloned()
            .unwrap_or(Value::Null);
        Ok(AccountBalance {
            total_usdt: json_decimal_or(account, "totalEq", Decimal::ZERO),
            available_usdt: json_decimal_or(&detail, "availBal", Decimal::ZERO),
        })
    }

    async fn get_asset_balance(&self, asset: &str) -> EngineResult<AssetBalance> {
        let data = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v5/account/balance?ccy={asset}"),
                None,
            )
            .await?;
        let detail = data
            .first()
            .and_then(|a| a.get("details"))
            .and_then(|v| v.as_array())
            .and_then(|d| d.first())
            .cloned();
        match detail {
            Some(detail) => Ok(AssetBalance {
                asset: asset.to_string(),
                free: json_decimal_or(&detail, "availBal", Decimal::ZERO),
                locked: json_decimal_or(&detail, "frozenBal", Decimal::ZERO),
            }),
            None => Ok(AssetBalance {
                asset: asset.to_string(),
                free: Decimal::ZERO,
                locked: Decimal::ZERO,
            }),
        }
    }

    async fn get_futures_balance(&self) -> EngineResult<AccountBalance> {
        // Unified trading account: same wallet backs swaps.
        self.get_account_balance().await
    }

    async fn transfer_to_futures(&self, asset: &str, amount: Decimal) -> EngineResult<()> {
        // Funding (6) -> trading (18).
        let payload = json!({
            "ccy": asset,
            "amt": amount.normalize().to_string(),
            "from": "6",
            "to": "18",
        });
        self.request(reqwest::Method::POST, "/api/v5/asset/transfer", Some(&payload))
            .await?;
        Ok(())
    }

    async fn transfer_to_spot(&self, asset: &str, amount: Decimal) -> EngineResult<()> {
        let payload = json!({
            "ccy": asset,
            "amt": amount.normalize().to_string(),
            "from": "18",
            "to": "6",
        });
        self.request(reqwest::Method::POST, "/api/v5/asset/transfer", Some(&payload))
            .await?;
        Ok(())
    }

    // -- Orders & market data -------------------------------------------------

    async fn get_order(
        &self,
        symbol: &str,
        order_id: &str,
        is_futures: bool,
    ) -> EngineResult<OrderResult> {
        let inst = inst_id(symbol, is_futures);
        let data = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v5/trade/order?instId={inst}&ordId={order_id}"),
                None,
            )
            .await?;
        let entry = data
            .first()
            .ok_or_else(|| EngineError::Exchange(format!("OKX order {order_id} not found")))?;
        parse_order(symbol, entry)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        is_futures: bool,
    ) -> EngineResult<()> {
        let payload = json!({
            "instId": inst_id(symbol, is_futures),
            "ordId": order_id,
        });
        self.request(
            reqwest::Method::POST,
            "/api/v5/trade/cancel-order",
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        is_futures: bool,
    ) -> EngineResult<Vec<OrderResult>> {
        let inst_type = if is_futures { "SWAP" } else { "SPOT" };
        let mut path = format!("/api/v5/trade/orders-pending?instType={inst_type}");
        if let Some(symbol) = symbol {
            path.push_str(&format!("&instId={}", inst_id(symbol, is_futures)));
        }
        let data = self.request(reqwest::Method::GET, &path, None).await?;
        data.iter()
            .map(|entry| {
                let raw_inst = entry.get("instId").and_then(|v| v.as_str()).unwrap_or("");
                let canonical = crate::exchanges::normalize_symbol(raw_inst);
                parse_order(&canonical, entry)
            })
            .collect()
    }

    async fn get_ticker_price(&self, symbol: &str) -> EngineResult<Decimal> {
        let data = self
            .public_get(&format!(
                "/api/v5/market/ticker?instId={}",
                inst_id(symbol, false)
            ))
            .await?;
        let entry = data
            .first()
            .ok_or_else(|| EngineError::Exchange(format!("OKX no ticker for {symbol}")))?;
        let price = json_decimal_or(entry, "last", Decimal::ZERO);
        if price.is_zero() {
            return Err(EngineError::Exchange(format!(
                "OKX zero ticker price for {symbol}"
            )));
        }
        Ok(price)
    }

    async fn get_symbol_info(&self, symbol: &str, is_futures: bool) -> EngineResult<SymbolInfo> {
        let inst_type = if is_futures { "SWAP" } else { "SPOT" };
        let data = self
            .public_get(&format!(
                "/api/v5/public/instruments?instType={inst_type}&instId={}",
                inst_id(symbol, is_futures)
            ))
            .await?;
        let entry = data
            .first()
            .ok_or_else(|| EngineError::Validation(format!("unknown symbol {symbol} on OKX")))?;
        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            step_size: json_decimal_or(entry, "lotSz", Decimal::ZERO),
            tick_size: json_decimal_or(entry, "tickSz", Decimal::ZERO),
            min_qty: json_decimal_or(entry, "minSz", Decimal::ZERO),
            // OKX publishes no notional floor; the engine config supplies one.
            min_notional: Decimal::ZERO,
        })
    }

    // -- Stop-loss orders -----------------------------------------------------

    async fn place_stop_loss_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        stop_price: Decimal,
        is_futures: bool,
    ) -> EngineResult<OrderResult> {
        let payload = json!({
            "instId": inst_id(symbol, is_futures),
            "tdMode": td_mode(is_futures),
            "side": okx_side(side.closing_side()),
            "ordType": "conditional",
            "sz": quantity.normalize().to_string(),
            "slTriggerPx": stop_price.normalize().to_string(),
            // -1 executes the triggered order at market.
            "slOrdPx": "-1",
            "reduceOnly": is_futures,
        });
        let data = self
            .request(
                reqwest::Method::POST,
                "/api/v5/trade/order-algo",
                Some(&payload),
            )
            .await?;
        let entry = data
            .first()
            .ok_or_else(|| EngineError::Exchange("OKX algo order: empty data".into()))?;
        Ok(OrderResult {
            order_id: entry
                .get("algoId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            client_order_id: None,
            symbol: symbol.to_string(),
            side: side.closing_side(),
            order_type: "STOP_MARKET".into(),
            status: OrderStatus::New,
            quantity,
            filled_quantity: Decimal::ZERO,
            price: None,
            avg_fill_price: None,
            fee: Decimal::ZERO,
            fee_currency: Some("USDT".into()),
            timestamp: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn map_status(raw: &str) -> OrderStatus {
    match raw {
        "live" => OrderStatus::New,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "canceled" | "mmp_canceled" => OrderStatus::Canceled,
        _ => OrderStatus::Pending,
    }
}

fn parse_order(symbol: &str, entry: &Value) -> EngineResult<OrderResult> {
    let order_id = entry
        .get("ordId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::Exchange("OKX order: missing ordId".into()))?
        .to_string();
    let side = match entry.get("side").and_then(|v| v.as_str()) {
        Some("sell") => TradeSide::Sell,
        _ => TradeSide::Buy,
    };
    let filled = json_decimal_or(entry, "accFillSz", Decimal::ZERO);
    let avg_price = json_decimal_or(entry, "avgPx", Decimal::ZERO);

    Ok(OrderResult {
        order_id,
        client_order_id: entry
            .get("clOrdId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from),
        symbol: symbol.to_string(),
        side,
        order_type: entry
            .get("ordType")
            .and_then(|v| v.as_str())
            .unwrap_or("market")
            .to_ascii_uppercase(),
        status: map_status(entry.get("state").and_then(|v| v.as_str()).unwrap_or("")),
        quantity: json_decimal_or(entry, "sz", filled),
        filled_quantity: filled,
        price: entry
            .get("px")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()),
        avg_fill_price: if avg_price.is_zero() { None } else { Some(avg_price) },
        // OKX reports fees as negative amounts.
        fee: json_decimal_or(entry, "fee", Decimal::ZERO).abs(),
        fee_currency: entry
            .get("feeCcy")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn inst_id_expansion() {
        assert_eq!(inst_id("BTCUSDT", false), "BTC-USDT");
        assert_eq!(inst_id("BTCUSDT", true), "BTC-USDT-SWAP");
        assert_eq!(inst_id("SOLUSDT", true), "SOL-USDT-SWAP");
    }

    #[test]
    fn envelope_maps_rate_limit_code() {
        let ok = r#"{"code":"0","msg":"","data":[{"ordId":"1"}]}"#;
        assert_eq!(OkxExecutor::unwrap_envelope(ok).unwrap().len(), 1);

        let limited = r#"{"code":"50011","msg":"Too Many Requests"}"#;
        assert!(matches!(
            OkxExecutor::unwrap_envelope(limited),
            Err(EngineError::RateLimited { .. })
        ));
    }

    #[test]
    fn fee_sign_is_normalized() {
        let entry = json!({
            "ordId": "55",
            "side": "buy",
            "ordType": "market",
            "state": "filled",
            "sz": "0.5",
            "accFillSz": "0.5",
            "avgPx": "3000",
            "fee": "-1.5",
            "feeCcy": "USDT"
        });
        let order = parse_order("ETHUSDT", &entry).unwrap();
        assert_eq!(order.fee, dec!(1.5));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(3000)));
    }
}
