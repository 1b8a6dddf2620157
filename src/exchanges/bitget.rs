// =============================================================================
// Bitget Adapter — v2 API, spot + USDT-M futures, passphrase-signed
// =============================================================================
//
// Signing matches the OKX scheme (base64 HMAC-SHA256 over timestamp + method
// + path + body) but with millisecond timestamps and ACCESS-* headers.
//
// Venue quirks carried here: spot market BUY orders are sized in quote
// currency (USDT), precision comes as decimal-place counts rather than step
// strings, and futures need productType/marginCoin on every call.
// =============================================================================

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
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

const BASE: &str = "https://api.bitget.com";
const PRODUCT_TYPE: &str = "USDT-FUTURES";

pub struct BitgetExecutor {
    credentials: Credentials,
    client: reqwest::Client,
}

fn bitget_side(side: TradeSide) -> &'static str {
    match side {
        TradeSide::Buy => "buy",
        TradeSide::Sell => "sell",
    }
}

/// Decimal-place count to step size: 3 -> 0.001.
fn step_from_places(places: i64) -> Decimal {
    if places <= 0 {
        Decimal::ONE
    } else {
        Decimal::new(1, places as u32)
    }
}

impl BitgetExecutor {
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

    fn unwrap_envelope(body: &str) -> EngineResult<Value> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| EngineError::Exchange(format!("BITGET bad JSON: {e}")))?;
        let code = value.get("code").and_then(|v| v.as_str()).unwrap_or("-1");
        if code != "00000" {
            let msg = value
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            if code == "429" || code == "40429" || msg.to_ascii_lowercase().contains("too many") {
                return Err(EngineError::RateLimited {
                    exchange: "BITGET".into(),
                    backoff_seconds: 2,
                });
            }
            return Err(EngineError::ExchangeRejected(format!(
                "BITGET code {code}: {msg}"
            )));
        }
        Ok(value.get("data").cloned().unwrap_or(Value::Null))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> EngineResult<Value> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let sign = self.sign(&timestamp, method.as_str(), path, &body_str)?;

        let mut req = self
            .client
            .request(method, format!("{BASE}{path}"))
            .header("ACCESS-KEY", &self.credentials.api_key)
            .header("ACCESS-SIGN", sign)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header(
                "ACCESS-PASSPHRASE",
                self.credentials.passphrase.as_deref().unwrap_or_default(),
            )
            .header("Content-Type", "application/json");
        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| request_error(Exchange::Bitget, e))?;
        let text = resp
            .text()
            .await
            .map_err(|e| request_error(Exchange::Bitget, e))?;
        Self::unwrap_envelope(&text)
    }

    async fn public_get(&self, path: &str) -> EngineResult<Value> {
        let resp = self
            .client
            .get(format!("{BASE}{path}"))
            .send()
            .await
            .map_err(|e| request_error(Exchange::Bitget, e))?;
        let text = resp
            .text()
            .await
            .map_err(|e| request_error(Exchange::Bitget, e))?;
        Self::unwrap_envelope(&text)
    }

    async fn place_spot_order(
        &self,
        symbol: &str,
        side: TradeSide,
        order_type: &str,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> EngineResult<OrderResult> {
        // Spot market buys are sized in quote currency.
        let size = if order_type == "market" && side == TradeSide::Buy {
            let ticker = self.get_ticker_price(symbol).await?;
            (quantity * ticker).normalize().to_string()
        } else {
            quantity.normalize().to_string()
        };

        let mut payload = json!({
            "symbol": symbol,
            "side": bitget_side(side),
            "orderType": order_type,
            "force": "gtc",
            "size": size,
            "clientOid": format!("cch{}", Uuid::new_v4().simple()),
        });
        if let Some(price) = price {
            payload
                .as_object_mut()
                .expect("literal object")
                .insert("price".into(), json!(price.normalize().to_string()));
        }

        let data = self
            .request(
                reqwest::Method::POST,
                "/api/v2/spot/trade/place-order",
                Some(&payload),
            )
            .await?;
        let order_id = data
            .get("orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Exchange("BITGET order: missing orderId".into()))?
            .to_string();
        self.get_order(symbol, &order_id, false).await
    }

    async fn place_futures_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> EngineResult<OrderResult> {
        let payload = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginMode": "crossed",
            "marginCoin": "USDT",
            "side": bitget_side(side),
            "orderType": "market",
            "size": quantity.normalize().to_string(),
            "reduceOnly": if reduce_only { "YES" } else { "NO" },
            "clientOid": format!("cch{}", Uuid::new_v4().simple()),
        });
        let data = self
            .request(
                reqwest::Method::POST,
                "/api/v2/mix/order/place-order",
                Some(&payload),
            )
            .await?;
        let order_id = data
            .get("orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Exchange("BITGET order: missing orderId".into()))?
            .to_string();
        self.get_order(symbol, &order_id, true).await
    }
}

#[async_trait]
impl ExchangePort for BitgetExecutor {
    fn name(&self) -> Exchange {
        Exchange::Bitget
    }

    #[instrument(skip(self), name = "bitget::initialize")]
    async fn initialize(&self) -> EngineResult<()> {
        self.request(
            reqwest::Method::GET,
            "/api/v2/spot/account/assets?coin=USDT",
            None,
        )
        .await?;
        debug!("bitget executor initialised");
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }

    // -- Spot -----------------------------------------------------------------

    async fn spot_market_buy(&self, symbol: &str, quantity: Decimal) -> EngineResult<OrderResult> {
        self.place_spot_order(symbol, TradeSide::Buy, "market", quantity, None)
            .await
    }

    async fn spot_market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_spot_order(symbol, TradeSide::Sell, "market", quantity, None)
            .await
    }

    async fn spot_limit_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_spot_order(symbol, TradeSide::Buy, "limit", quantity, Some(price))
            .await
    }

    async fn spot_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_spot_order(symbol, TradeSide::Sell, "limit", quantity, Some(price))
            .await
    }

    // -- Futures --------------------------------------------------------------

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let payload = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": "USDT",
            "leverage": leverage.to_string(),
        });
        self.request(
            reqwest::Method::POST,
            "/api/v2/mix/account/set-leverage",
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
        self.place_futures_order(symbol, TradeSide::Buy, quantity, false)
            .await
    }

    async fn futures_market_short(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_futures_order(symbol, TradeSide::Sell, quantity, false)
            .await
    }

    async fn futures_close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Option<Decimal>,
    ) -> EngineResult<OrderResult> {
        let qty = match quantity {
            Some(q) => q,
            None => {
                let data = self
                    .request(
                        reqwest::Method::GET,
                        &format!(
                            "/api/v2/mix/position/single-position?symbol={symbol}\
                             &productType={PRODUCT_TYPE}&marginCoin=USDT"
                        ),
                        None,
                    )
                    .await?;
                data.as_array()
                    .and_then(|l| l.first())
                    .map(|p| json_decimal_or(p, "total", Decimal::ZERO))
                    .unwrap_or(Decimal::ZERO)
            }
        };
        if qty.is_zero() {
            return Err(EngineError::Validation(format!(
                "no open {symbol} position on BITGET to close"
            )));
        }
        self.place_futures_order(symbol, side.closing_side(), qty, true)
            .await
    }

    // -- Account --------------------------------------------------------------

    async fn get_account_balance(&self) -> EngineResult<AccountBalance> {
        let usdt = self.get_asset_balance("USDT").await?;
        Ok(AccountBalance {
            total_usdt: usdt.free + usdt.locked,
            available_usdt: usdt.free,
        })
    }

    async fn get_asset_balance(&self, asset: &str) -> EngineResult<AssetBalance> {
        let data = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v2/spot/account/assets?coin={asset}"),
                None,
            )
            .await?;
        let entry = data.as_array().and_then(|l| l.first()).cloned();
        match entry {
            Some(entry) => Ok(AssetBalance {
                asset: asset.to_string(),
                free: json_decimal_or(&entry, "available", Decimal::ZERO),
                locked: json_decimal_or(&entry, "frozen", Decimal::ZERO),
            }),
            None => Ok(AssetBalance {
                asset: asset.to_string(),
                free: Decimal::ZERO,
                locked: Decimal::ZERO,
            }),
        }
    }

    async fn get_futures_balance(&self) -> EngineResult<AccountBalance> {
        let data = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v2/mix/account/accounts?productType={PRODUCT_TYPE}"),
                None,
            )
            .await?;
        let entry = data
            .as_array()
            .and_then(|l| l.iter().find(|a| {
                a.get("marginCoin").and_then(|v| v.as_str()) == Some("USDT")
            }))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(AccountBalance {
            total_usdt: json_decimal_or(&entry, "accountEquity", Decimal::ZERO),
            available_usdt: json_decimal_or(&entry, "available", Decimal::ZERO),
        })
    }

    async fn transfer_to_futures(&self, asset: &str, amount: Decimal) -> EngineResult<()> {
        let payload = json!({
            "fromType": "spot",
            "toType": "usdt_futures",
            "amount": amount.normalize().to_string(),
            "coin": asset,
        });
        self.request(
            reqwest::Method::POST,
            "/api/v2/spot/wallet/transfer",
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    async fn transfer_to_spot(&self, asset: &str, amount: Decimal) -> EngineResult<()> {
        let payload = json!({
            "fromType": "usdt_futures",
            "toType": "spot",
            "amount": amount.normalize().to_string(),
            "coin": asset,
        });
        self.request(
            reqwest::Method::POST,
            "/api/v2/spot/wallet/transfer",
            Some(&payload),
        )
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
        if is_futures {
            let data = self
                .request(
                    reqwest::Method::GET,
                    &format!(
                        "/api/v2/mix/order/detail?symbol={symbol}\
                         &productType={PRODUCT_TYPE}&orderId={order_id}"
                    ),
                    None,
                )
                .await?;
            parse_order(symbol, &data)
        } else {
            let data = self
                .request(
                    reqwest::Method::GET,
                    &format!("/api/v2/spot/trade/orderInfo?orderId={order_id}"),
                    None,
                )
                .await?;
            let entry = data
                .as_array()
                .and_then(|l| l.first())
                .cloned()
                .unwrap_or(data);
            parse_order(symbol, &entry)
        }
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        is_futures: bool,
    ) -> EngineResult<()> {
        if is_futures {
            let payload = json!({
                "symbol": symbol,
                "productType": PRODUCT_TYPE,
                "orderId": order_id,
            });
            self.request(
                reqwest::Method::POST,
                "/api/v2/mix/order/cancel-order",
                Some(&payload),
            )
            .await?;
        } else {
            let payload = json!({
                "symbol": symbol,
                "orderId": order_id,
            });
            self.request(
                reqwest::Method::POST,
                "/api/v2/spot/trade/cancel-order",
                Some(&payload),
            )
            .await?;
        }
        Ok(())
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        is_futures: bool,
    ) -> EngineResult<Vec<OrderResult>> {
        let path = if is_futures {
            let mut p = format!("/api/v2/mix/order/orders-pending?productType={PRODUCT_TYPE}");
            if let Some(symbol) = symbol {
                p.push_str(&format!("&symbol={symbol}"));
            }
            p
        } else {
            let mut p = "/api/v2/spot/trade/unfilled-orders".to_string();
            if let Some(symbol) = symbol {
                p.push_str(&format!("?symbol={symbol}"));
            }
            p
        };
        let data = self.request(reqwest::Method::GET, &path, None).await?;
        let list = if is_futures {
            data.get("entrustedList")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default()
        } else {
            data.as_array().cloned().unwrap_or_default()
        };
        list.iter()
            .map(|entry| {
                let sym = entry
                    .get("symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or(symbol.unwrap_or_default());
                parse_order(sym, entry)
            })
            .collect()
    }

    async fn get_ticker_price(&self, symbol: &str) -> EngineResult<Decimal> {
        let data = self
            .public_get(&format!("/api/v2/spot/market/tickers?symbol={symbol}"))
            .await?;
        let entry = data
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| EngineError::Exchange(format!("BITGET no ticker for {symbol}")))?;
        let price = json_decimal_or(entry, "lastPr", Decimal::ZERO);
        if price.is_zero() {
            return Err(EngineError::Exchange(format!(
                "BITGET zero ticker price for {symbol}"
            )));
        }
        Ok(price)
    }

    async fn get_symbol_info(&self, symbol: &str, is_futures: bool) -> EngineResult<SymbolInfo> {
        if is_futures {
            let data = self
                .public_get(&format!(
                    "/api/v2/mix/market/contracts?productType={PRODUCT_TYPE}&symbol={symbol}"
                ))
                .await?;
            let entry = data
                .as_array()
                .and_then(|l| l.first())
                .ok_or_else(|| {
                    EngineError::Validation(format!("unknown symbol {symbol} on BITGET"))
                })?;
            Ok(SymbolInfo {
                symbol: symbol.to_string(),
                step_size: step_from_places(
                    entry.get("volumePlace").and_then(value_as_i64).unwrap_or(0),
                ),
                tick_size: step_from_places(
                    entry.get("pricePlace").and_then(value_as_i64).unwrap_or(0),
                ),
                min_qty: json_decimal_or(entry, "minTradeNum", Decimal::ZERO),
                min_notional: json_decimal_or(entry, "minTradeUSDT", Decimal::ZERO),
            })
        } else {
            let data = self
                .public_get(&format!("/api/v2/spot/public/symbols?symbol={symbol}"))
                .await?;
            let entry = data
                .as_array()
                .and_then(|l| l.first())
                .ok_or_else(|| {
                    EngineError::Validation(format!("unknown symbol {symbol} on BITGET"))
                })?;
            Ok(SymbolInfo {
                symbol: symbol.to_string(),
                step_size: step_from_places(
                    entry
                        .get("quantityPrecision")
                        .and_then(value_as_i64)
                        .unwrap_or(0),
                ),
                tick_size: step_from_places(
                    entry
                        .get("pricePrecision")
                        .and_then(value_as_i64)
                        .unwrap_or(0),
                ),
                min_qty: json_decimal_or(entry, "minTradeAmount", Decimal::ZERO),
                min_notional: json_decimal_or(entry, "minTradeUSDT", Decimal::ZERO),
            })
        }
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
        if !is_futures {
            return Err(EngineError::Validation(
                "BITGET spot has no exchange-side stop orders; engine triggers apply".into(),
            ));
        }
        let hold_side = match side {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        };
        let payload = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": "USDT",
            "planType": "loss_plan",
            "triggerPrice": stop_price.normalize().to_string(),
            "holdSide": hold_side,
            "size": quantity.normalize().to_string(),
        });
        let data = self
            .request(
                reqwest::Method::POST,
                "/api/v2/mix/order/place-tpsl-order",
                Some(&payload),
            )
            .await?;
        Ok(OrderResult {
            order_id: data
                .get("orderId")
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

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn map_status(raw: &str) -> OrderStatus {
    match raw {
        "live" | "new" | "init" => OrderStatus::New,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "cancelled" | "canceled" => OrderStatus::Canceled,
        _ => OrderStatus::Pending,
    }
}

fn parse_order(symbol: &str, entry: &Value) -> EngineResult<OrderResult> {
    let order_id = entry
        .get("orderId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::Exchange("BITGET order: missing orderId".into()))?
        .to_string();
    let side = match entry.get("side").and_then(|v| v.as_str()) {
        Some("sell") => TradeSide::Sell,
        _ => TradeSide::Buy,
    };
    let filled = json_decimal_or(entry, "baseVolume", Decimal::ZERO);
    let avg_price = json_decimal_or(entry, "priceAvg", Decimal::ZERO);

    // feeDetail arrives as a JSON string of per-coin entries; sum magnitudes.
    let mut fee = Decimal::ZERO;
    let mut fee_currency = None;
    if let Some(raw) = entry.get("feeDetail").and_then(|v| v.as_str()) {
        if let Ok(detail) = serde_json::from_str::<Value>(raw) {
            if let Some(map) = detail.as_object() {
                for (coin, info) in map {
                    if coin == "newFees" {
                        continue;
                    }
                    fee += json_decimal_or(info, "totalFee", Decimal::ZERO).abs();
                    fee_currency.get_or_insert_with(|| coin.clone());
                }
            }
        }
    }

    Ok(OrderResult {
        order_id,
        client_order_id: entry
            .get("clientOid")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from),
        symbol: symbol.to_string(),
        side,
        order_type: entry
            .get("orderType")
            .and_then(|v| v.as_str())
            .unwrap_or("market")
            .to_ascii_uppercase(),
        status: map_status(entry.get("status").and_then(|v| v.as_str()).unwrap_or("")),
        quantity: json_decimal_or(entry, "size", filled),
        filled_quantity: filled,
        price: entry
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()),
        avg_fill_price: if avg_price.is_zero() { None } else { Some(avg_price) },
        fee,
        fee_currency,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn precision_places_convert_to_steps() {
        assert_eq!(step_from_places(3), dec!(0.001));
        assert_eq!(step_from_places(0), Decimal::ONE);
        assert_eq!(step_from_places(-2), Decimal::ONE);
    }

    #[test]
    fn envelope_detects_rate_limits() {
        let limited = r#"{"code":"429","msg":"Too Many Requests"}"#;
        assert!(matches!(
            BitgetExecutor::unwrap_envelope(limited),
            Err(EngineError::RateLimited { .. })
        ));

        let ok = r#"{"code":"00000","msg":"success","data":{"orderId":"77"}}"#;
        let data = BitgetExecutor::unwrap_envelope(ok).unwrap();
        assert_eq!(data.get("orderId").unwrap(), "77");
    }

    #[test]
    fn fee_detail_string_is_parsed() {
        let entry = json!({
            "orderId": "77",
            "side": "buy",
            "orderType": "market",
            "status": "filled",
            "size": "0.5",
            "baseVolume": "0.5",
            "priceAvg": "3100",
            "feeDetail": "{\"USDT\":{\"totalFee\":\"-0.93\"}}"
        });
        let order = parse_order("ETHUSDT", &entry).unwrap();
        assert_eq!(order.fee, dec!(0.93));
        assert_eq!(order.fee_currency.as_deref(), Some("USDT"));
        assert_eq!(order.status, OrderStatus::Filled);
    }
}
