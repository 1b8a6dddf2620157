// =============================================================================
// Bybit Adapter — v5 unified API, spot + linear perps
// =============================================================================
//
// v5 signs headers rather than the query string:
//   X-BAPI-SIGN = HMAC_SHA256(timestamp + api_key + recv_window + payload)
// where payload is the query string for GET and the JSON body for POST.
// Responses wrap everything in {retCode, retMsg, result}.
// =============================================================================

use async_trait::async_trait;
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

const BASE: &str = "https://api.bybit.com";
const RECV_WINDOW: &str = "5000";

pub struct BybitExecutor {
    credentials: Credentials,
    client: reqwest::Client,
}

fn category(is_futures: bool) -> &'static str {
    if is_futures {
        "linear"
    } else {
        "spot"
    }
}

fn bybit_side(side: TradeSide) -> &'static str {
    match side {
        TradeSide::Buy => "Buy",
        TradeSide::Sell => "Sell",
    }
}

impl BybitExecutor {
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

    fn sign(&self, timestamp: i64, payload: &str) -> EngineResult<String> {
        let message = format!(
            "{timestamp}{}{RECV_WINDOW}{payload}",
            self.credentials.api_key
        );
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|_| EngineError::Fatal("HMAC rejected key".into()))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Unwrap the v5 envelope, translating retCode failures.
    fn unwrap_envelope(body: &str) -> EngineResult<Value> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| EngineError::Exchange(format!("BYBIT bad JSON: {e}")))?;
        let ret_code = value.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
        if ret_code != 0 {
            let msg = value
                .get("retMsg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            // 10006 / 10018: too many visits.
            if ret_code == 10006 || ret_code == 10018 {
                return Err(EngineError::RateLimited {
                    exchange: "BYBIT".into(),
                    backoff_seconds: 2,
                });
            }
            return Err(EngineError::ExchangeRejected(format!(
                "BYBIT retCode {ret_code}: {msg}"
            )));
        }
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn signed_get(&self, path: &str, query: &str) -> EngineResult<Value> {
        let timestamp = Utc::now().timestamp_millis();
        let sign = self.sign(timestamp, query)?;
        let url = if query.is_empty() {
            format!("{BASE}{path}")
        } else {
            format!("{BASE}{path}?{query}")
        };
        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.credentials.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", sign)
            .send()
            .await
            .map_err(|e| request_error(Exchange::Bybit, e))?;
        let body = resp
            .text()
            .await
            .map_err(|e| request_error(Exchange::Bybit, e))?;
        Self::unwrap_envelope(&body)
    }

    async fn signed_post(&self, path: &str, payload: &Value) -> EngineResult<Value> {
        let timestamp = Utc::now().timestamp_millis();
        let body_str = payload.to_string();
        let sign = self.sign(timestamp, &body_str)?;
        let resp = self
            .client
            .post(format!("{BASE}{path}"))
            .header("X-BAPI-API-KEY", &self.credentials.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", sign)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| request_error(Exchange::Bybit, e))?;
        let body = resp
            .text()
            .await
            .map_err(|e| request_error(Exchange::Bybit, e))?;
        Self::unwrap_envelope(&body)
    }

    async fn public_get(&self, path_and_query: &str) -> EngineResult<Value> {
        let resp = self
            .client
            .get(format!("{BASE}{path_and_query}"))
            .send()
            .await
            .map_err(|e| request_error(Exchange::Bybit, e))?;
        let body = resp
            .text()
            .await
            .map_err(|e| request_error(Exchange::Bybit, e))?;
        Self::unwrap_envelope(&body)
    }

    async fn create_order(
        &self,
        is_futures: bool,
        symbol: &str,
        side: TradeSide,
        order_type: &str,
        quantity: Decimal,
        price: Option<Decimal>,
        trigger_price: Option<Decimal>,
        reduce_only: bool,
    ) -> EngineResult<OrderResult> {
        let link_id = format!("cch-{}", Uuid::new_v4().simple());
        let mut payload = json!({
            "category": category(is_futures),
            "symbol": symbol,
            "side": bybit_side(side),
            "orderType": order_type,
            "qty": quantity.normalize().to_string(),
            "orderLinkId": link_id,
        });
        let map = payload.as_object_mut().expect("literal object");
        if let Some(price) = price {
            map.insert("price".into(), json!(price.normalize().to_string()));
            map.insert("timeInForce".into(), json!("GTC"));
        }
        if let Some(trigger) = trigger_price {
            map.insert("triggerPrice".into(), json!(trigger.normalize().to_string()));
            // Direction 2 = trigger when price falls to it, 1 = rises to it.
            let direction = if side == TradeSide::Sell { 2 } else { 1 };
            map.insert("triggerDirection".into(), json!(direction));
        }
        if reduce_only {
            map.insert("reduceOnly".into(), json!(true));
        }

        let result = self.signed_post("/v5/order/create", &payload).await?;
        let order_id = result
            .get("orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Exchange("BYBIT create: missing orderId".into()))?
            .to_string();

        // The create response carries ids only; fetch the fill from history.
        self.get_order(symbol, &order_id, is_futures).await
    }
}

#[async_trait]
impl ExchangePort for BybitExecutor {
    fn name(&self) -> Exchange {
        Exchange::Bybit
    }

    #[instrument(skip(self), name = "bybit::initialize")]
    async fn initialize(&self) -> EngineResult<()> {
        self.signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        debug!("bybit executor initialised");
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }

    // -- Spot -----------------------------------------------------------------

    async fn spot_market_buy(&self, symbol: &str, quantity: Decimal) -> EngineResult<OrderResult> {
        self.create_order(false, symbol, TradeSide::Buy, "Market", quantity, None, None, false)
            .await
    }

    async fn spot_market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.create_order(false, symbol, TradeSide::Sell, "Market", quantity, None, None, false)
            .await
    }

    async fn spot_limit_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult> {
        self.create_order(
            false,
            symbol,
            TradeSide::Buy,
            "Limit",
            quantity,
            Some(price),
            None,
            false,
        )
        .await
    }

    async fn spot_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult> {
        self.create_order(
            false,
            symbol,
            TradeSide::Sell,
            "Limit",
            quantity,
            Some(price),
            None,
            false,
        )
        .await
    }

    // -- Futures --------------------------------------------------------------

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let payload = json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.signed_post("/v5/position/set-leverage", &payload).await {
            Ok(_) => Ok(()),
            // 110043: leverage not modified. Harmless.
            Err(EngineError::ExchangeRejected(msg)) if msg.contains("110043") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn futures_market_long(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.create_order(true, symbol, TradeSide::Buy, "Market", quantity, None, None, false)
            .await
    }

    async fn futures_market_short(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.create_order(true, symbol, TradeSide::Sell, "Market", quantity, None, None, false)
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
                // Look up the live position size for a full close.
                let result = self
                    .signed_get(
                        "/v5/position/list",
                        &format!("category=linear&symbol={symbol}"),
                    )
                    .await?;
                result
                    .get("list")
                    .and_then(|v| v.as_array())
                    .and_then(|l| l.first())
                    .map(|p| json_decimal_or(p, "size", Decimal::ZERO))
                    .unwrap_or(Decimal::ZERO)
            }
        };
        if qty.is_zero() {
            return Err(EngineError::Validation(format!(
                "no open {symbol} position on BYBIT to close"
            )));
        }
        self.create_order(
            true,
            symbol,
            side.closing_side(),
            "Market",
            qty,
            None,
            None,
            true,
        )
        .await
    }

    // -- Account --------------------------------------------------------------

    async fn get_account_balance(&self) -> EngineResult<AccountBalance> {
        let result = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let account = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .ok_or_else(|| EngineError::Exchange("BYBIT balance: empty list".into()))?;
        Ok(AccountBalance {
            total_usdt: json_decimal_or(account, "totalEquity", Decimal::ZERO),
            available_usdt: json_decimal_or(account, "totalAvailableBalance", Decimal::ZERO),
        })
    }

    async fn get_asset_balance(&self, asset: &str) -> EngineResult<AssetBalance> {
        let result = self
            .signed_get(
                "/v5/account/wallet-balance",
                &format!("accountType=UNIFIED&coin={asset}"),
            )
            .await?;
        let coin = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .and_then(|a| a.get("coin"))
            .and_then(|v| v.as_array())
            .and_then(|c| c.first());
        match coin {
            Some(coin) => Ok(AssetBalance {
                asset: asset.to_string(),
                free: json_decimal_or(coin, "availableToWithdraw", Decimal::ZERO),
                locked: json_decimal_or(coin, "locked", Decimal::ZERO),
            }),
            None => Ok(AssetBalance {
                asset: asset.to_string(),
                free: Decimal::ZERO,
                locked: Decimal::ZERO,
            }),
        }
    }

    async fn get_futures_balance(&self) -> EngineResult<AccountBalance> {
        // Unified account: derivatives draw from the same wallet.
        self.get_account_balance().await
    }

    async fn transfer_to_futures(&self, asset: &str, amount: Decimal) -> EngineResult<()> {
        let payload = json!({
            "transferId": Uuid::new_v4().to_string(),
            "coin": asset,
            "amount": amount.normalize().to_string(),
            "fromAccountType": "SPOT",
            "toAccountType": "CONTRACT",
        });
        self.signed_post("/v5/asset/transfer/inter-transfer", &payload)
            .await?;
        Ok(())
    }

    async fn transfer_to_spot(&self, asset: &str, amount: Decimal) -> EngineResult<()> {
        let payload = json!({
            "transferId": Uuid::new_v4().to_string(),
            "coin": asset,
            "amount": amount.normalize().to_string(),
            "fromAccountType": "CONTRACT",
            "toAccountType": "SPOT",
        });
        self.signed_post("/v5/asset/transfer/inter-transfer", &payload)
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
        // History covers filled orders; realtime covers the still-open ones.
        for path in ["/v5/order/history", "/v5/order/realtime"] {
            let result = self
                .signed_get(
                    path,
                    &format!(
                        "category={}&symbol={symbol}&orderId={order_id}",
                        category(is_futures)
                    ),
                )
                .await?;
            if let Some(entry) = result
                .get("list")
                .and_then(|v| v.as_array())
                .and_then(|l| l.first())
            {
                return parse_order(entry);
            }
        }
        Err(EngineError::Exchange(format!(
            "BYBIT order {order_id} not found for {symbol}"
        )))
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        is_futures: bool,
    ) -> EngineResult<()> {
        let payload = json!({
            "category": category(is_futures),
            "symbol": symbol,
            "orderId": order_id,
        });
        self.signed_post("/v5/order/cancel", &payload).await?;
        Ok(())
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        is_futures: bool,
    ) -> EngineResult<Vec<OrderResult>> {
        let mut query = format!("category={}", category(is_futures));
        if let Some(symbol) = symbol {
            query.push_str(&format!("&symbol={symbol}"));
        } else {
            query.push_str("&settleCoin=USDT");
        }
        let result = self.signed_get("/v5/order/realtime", &query).await?;
        let list = result
            .get("list")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        list.iter().map(parse_order).collect()
    }

    async fn get_ticker_price(&self, symbol: &str) -> EngineResult<Decimal> {
        let result = self
            .public_get(&format!("/v5/market/tickers?category=spot&symbol={symbol}"))
            .await?;
        let entry = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .ok_or_else(|| EngineError::Exchange(format!("BYBIT no ticker for {symbol}")))?;
        let price = json_decimal_or(entry, "lastPrice", Decimal::ZERO);
        if price.is_zero() {
            return Err(EngineError::Exchange(format!(
                "BYBIT zero ticker price for {symbol}"
            )));
        }
        Ok(price)
    }

    async fn get_symbol_info(&self, symbol: &str, is_futures: bool) -> EngineResult<SymbolInfo> {
        let result = self
            .public_get(&format!(
                "/v5/market/instruments-info?category={}&symbol={symbol}",
                category(is_futures)
            ))
            .await?;
        let entry = result
            .get("list")
            .and_then(|v| v.as_array())
            .and_then(|l| l.first())
            .ok_or_else(|| {
                EngineError::Validation(format!("unknown symbol {symbol} on BYBIT"))
            })?;

        let lot = entry.get("lotSizeFilter").cloned().unwrap_or(Value::Null);
        let price_filter = entry.get("priceFilter").cloned().unwrap_or(Value::Null);
        let min_notional = if is_futures {
            json_decimal_or(&lot, "minNotionalValue", Decimal::ZERO)
        } else {
            json_decimal_or(&lot, "minOrderAmt", Decimal::ZERO)
        };

        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            step_size: json_decimal_or(&lot, "qtyStep", json_decimal_or(&lot, "basePrecision", Decimal::ZERO)),
            tick_size: json_decimal_or(&price_filter, "tickSize", Decimal::ZERO),
            min_qty: json_decimal_or(&lot, "minOrderQty", Decimal::ZERO),
            min_notional,
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
        self.create_order(
            is_futures,
            symbol,
            side.closing_side(),
            "Market",
            quantity,
            None,
            Some(stop_price),
            is_futures,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn map_status(raw: &str) -> OrderStatus {
    match raw {
        "New" | "Untriggered" | "Triggered" => OrderStatus::New,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Canceled,
        "Rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

fn parse_order(entry: &Value) -> EngineResult<OrderResult> {
    let order_id = entry
        .get("orderId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::Exchange("BYBIT order: missing orderId".into()))?
        .to_string();
    let side = match entry.get("side").and_then(|v| v.as_str()) {
        Some("Sell") => TradeSide::Sell,
        _ => TradeSide::Buy,
    };
    let filled = json_decimal_or(entry, "cumExecQty", Decimal::ZERO);
    let avg_price = json_decimal_or(entry, "avgPrice", Decimal::ZERO);

    Ok(OrderResult {
        order_id,
        client_order_id: entry
            .get("orderLinkId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from),
        symbol: entry
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        side,
        order_type: entry
            .get("orderType")
            .and_then(|v| v.as_str())
            .unwrap_or("Market")
            .to_ascii_uppercase(),
        status: map_status(entry.get("orderStatus").and_then(|v| v.as_str()).unwrap_or("")),
        quantity: json_decimal_or(entry, "qty", filled),
        filled_quantity: filled,
        price: entry
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()),
        avg_fill_price: if avg_price.is_zero() { None } else { Some(avg_price) },
        fee: json_decimal_or(entry, "cumExecFee", Decimal::ZERO),
        fee_currency: Some("USDT".to_string()),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn envelope_unwraps_result_and_maps_ret_codes() {
        let ok = r#"{"retCode":0,"retMsg":"OK","result":{"orderId":"abc"}}"#;
        let result = BybitExecutor::unwrap_envelope(ok).unwrap();
        assert_eq!(result.get("orderId").unwrap(), "abc");

        let rate_limited = r#"{"retCode":10006,"retMsg":"Too many visits"}"#;
        assert!(matches!(
            BybitExecutor::unwrap_envelope(rate_limited),
            Err(EngineError::RateLimited { .. })
        ));

        let rejected = r#"{"retCode":110007,"retMsg":"insufficient balance"}"#;
        assert!(matches!(
            BybitExecutor::unwrap_envelope(rejected),
            Err(EngineError::ExchangeRejected(_))
        ));
    }

    #[test]
    fn order_parsing_normalizes_fields() {
        let entry = json!({
            "orderId": "1321003749386327552",
            "orderLinkId": "cch-xyz",
            "symbol": "BTCUSDT",
            "side": "Sell",
            "orderType": "Market",
            "orderStatus": "Filled",
            "qty": "0.01",
            "cumExecQty": "0.01",
            "avgPrice": "64210.5",
            "cumExecFee": "0.353"
        });
        let order = parse_order(&entry).unwrap();
        assert_eq!(order.side, TradeSide::Sell);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(64210.5)));
        assert_eq!(order.fee, dec!(0.353));
        assert_eq!(order.order_type, "MARKET");
    }
}
