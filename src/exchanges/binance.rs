// =============================================================================
// Binance Adapter — spot + USDT-M futures, HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::exchanges::{
    classify_response_error, json_decimal, json_decimal_or, request_error, AccountBalance,
    AssetBalance, Credentials, ExchangePort, OrderResult, OrderStatus, SymbolInfo,
};
use crate::types::{Exchange, PositionSide, TradeSide};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const SPOT_BASE: &str = "https://api.binance.com";
const FUTURES_BASE: &str = "https://fapi.binance.com";

pub struct BinanceExecutor {
    credentials: Credentials,
    client: reqwest::Client,
}

impl BinanceExecutor {
    pub fn new(credentials: Credentials) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&credentials.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(15))
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(20)
            .build()
            .unwrap_or_default();

        Self {
            credentials,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> EngineResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|_| EngineError::Fatal("HMAC rejected key".into()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_query(&self, params: &[(&str, String)]) -> EngineResult<String> {
        let ts = Utc::now().timestamp_millis();
        let mut base: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !base.is_empty() {
            base.push('&');
        }
        base.push_str(&format!("timestamp={ts}&recvWindow={RECV_WINDOW}"));
        let sig = self.sign(&base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    async fn signed_request(
        &self,
        method: Method,
        base: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> EngineResult<Value> {
        let qs = self.signed_query(params)?;
        let url = format!("{base}{path}?{qs}");

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| request_error(Exchange::Binance, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| request_error(Exchange::Binance, e))?;

        if !status.is_success() {
            return Err(classify_response_error(Exchange::Binance, status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| EngineError::Exchange(format!("BINANCE bad JSON: {e}")))
    }

    async fn public_request(&self, base: &str, path: &str) -> EngineResult<Value> {
        let url = format!("{base}{path}");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(Exchange::Binance, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| request_error(Exchange::Binance, e))?;
        if !status.is_success() {
            return Err(classify_response_error(Exchange::Binance, status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| EngineError::Exchange(format!("BINANCE bad JSON: {e}")))
    }

    // -------------------------------------------------------------------------
    // Order helpers
    // -------------------------------------------------------------------------

    async fn place_spot_order(
        &self,
        symbol: &str,
        side: TradeSide,
        order_type: &str,
        quantity: Decimal,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
    ) -> EngineResult<OrderResult> {
        let client_order_id = format!("cch-{}", Uuid::new_v4().simple());
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", order_type.to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newClientOrderId", client_order_id),
            ("newOrderRespType", "FULL".to_string()),
        ];
        if let Some(price) = price {
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(stop) = stop_price {
            params.push(("stopPrice", stop.normalize().to_string()));
        }

        let body = self
            .signed_request(Method::POST, SPOT_BASE, "/api/v3/order", &params)
            .await?;
        parse_spot_order(&body, side)
    }

    async fn place_futures_order(
        &self,
        symbol: &str,
        side: TradeSide,
        order_type: &str,
        quantity: Decimal,
        stop_price: Option<Decimal>,
        reduce_only: bool,
    ) -> EngineResult<OrderResult> {
        let client_order_id = format!("cch-{}", Uuid::new_v4().simple());
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", order_type.to_string()),
            ("newClientOrderId", client_order_id),
        ];
        if !quantity.is_zero() {
            params.push(("quantity", quantity.normalize().to_string()));
        }
        if let Some(stop) = stop_price {
            params.push(("stopPrice", stop.normalize().to_string()));
        }
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        // closePosition closes the whole side when no quantity was given.
        if quantity.is_zero() {
            params.push(("closePosition", "true".to_string()));
        }

        let body = self
            .signed_request(Method::POST, FUTURES_BASE, "/fapi/v1/order", &params)
            .await?;
        parse_futures_order(&body, side)
    }
}

#[async_trait]
impl ExchangePort for BinanceExecutor {
    fn name(&self) -> Exchange {
        Exchange::Binance
    }

    /// Signed account call proves both connectivity and credentials.
    #[instrument(skip(self), name = "binance::initialize")]
    async fn initialize(&self) -> EngineResult<()> {
        self.signed_request(Method::GET, SPOT_BASE, "/api/v3/account", &[])
            .await?;
        debug!("binance executor initialised");
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }

    // -- Spot -----------------------------------------------------------------

    async fn spot_market_buy(&self, symbol: &str, quantity: Decimal) -> EngineResult<OrderResult> {
        self.place_spot_order(symbol, TradeSide::Buy, "MARKET", quantity, None, None)
            .await
    }

    async fn spot_market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_spot_order(symbol, TradeSide::Sell, "MARKET", quantity, None, None)
            .await
    }

    async fn spot_limit_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_spot_order(symbol, TradeSide::Buy, "LIMIT", quantity, Some(price), None)
            .await
    }

    async fn spot_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_spot_order(symbol, TradeSide::Sell, "LIMIT", quantity, Some(price), None)
            .await
    }

    // -- Futures --------------------------------------------------------------

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        self.signed_request(
            Method::POST,
            FUTURES_BASE,
            "/fapi/v1/leverage",
            &[
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn futures_market_long(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_futures_order(symbol, TradeSide::Buy, "MARKET", quantity, None, false)
            .await
    }

    async fn futures_market_short(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> EngineResult<OrderResult> {
        self.place_futures_order(symbol, TradeSide::Sell, "MARKET", quantity, None, false)
            .await
    }

    async fn futures_close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Option<Decimal>,
    ) -> EngineResult<OrderResult> {
        self.place_futures_order(
            symbol,
            side.closing_side(),
            "MARKET",
            quantity.unwrap_or(Decimal::ZERO),
            None,
            true,
        )
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
        let body = self
            .signed_request(Method::GET, SPOT_BASE, "/api/v3/account", &[])
            .await?;
        let balances = body
            .get("balances")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EngineError::Exchange("BINANCE account: no balances".into()))?;
        for entry in balances {
            if entry.get("asset").and_then(|v| v.as_str()) == Some(asset) {
                return Ok(AssetBalance {
                    asset: asset.to_string(),
                    free: json_decimal(entry, "free")?,
                    locked: json_decimal(entry, "locked")?,
                });
            }
        }
        Ok(AssetBalance {
            asset: asset.to_string(),
            free: Decimal::ZERO,
            locked: Decimal::ZERO,
        })
    }

    async fn get_futures_balance(&self) -> EngineResult<AccountBalance> {
        let body = self
            .signed_request(Method::GET, FUTURES_BASE, "/fapi/v2/balance", &[])
            .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| EngineError::Exchange("BINANCE futures balance: not a list".into()))?;
        for entry in entries {
            if entry.get("asset").and_then(|v| v.as_str()) == Some("USDT") {
                return Ok(AccountBalance {
                    total_usdt: json_decimal(entry, "balance")?,
                    available_usdt: json_decimal(entry, "availableBalance")?,
                });
            }
        }
        Ok(AccountBalance {
            total_usdt: Decimal::ZERO,
            available_usdt: Decimal::ZERO,
        })
    }

    async fn transfer_to_futures(&self, asset: &str, amount: Decimal) -> EngineResult<()> {
        self.signed_request(
            Method::POST,
            SPOT_BASE,
            "/sapi/v1/asset/transfer",
            &[
                ("type", "MAIN_UMFUTURE".to_string()),
                ("asset", asset.to_string()),
                ("amount", amount.normalize().to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn transfer_to_spot(&self, asset: &str, amount: Decimal) -> EngineResult<()> {
        self.signed_request(
            Method::POST,
            SPOT_BASE,
            "/sapi/v1/asset/transfer",
            &[
                ("type", "UMFUTURE_MAIN".to_string()),
                ("asset", asset.to_string()),
                ("amount", amount.normalize().to_string()),
            ],
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
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        if is_futures {
            let body = self
                .signed_request(Method::GET, FUTURES_BASE, "/fapi/v1/order", &params)
                .await?;
            let side = side_from_response(&body);
            parse_futures_order(&body, side)
        } else {
            let body = self
                .signed_request(Method::GET, SPOT_BASE, "/api/v3/order", &params)
                .await?;
            let side = side_from_response(&body);
            parse_spot_order(&body, side)
        }
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        is_futures: bool,
    ) -> EngineResult<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let (base, path) = if is_futures {
            (FUTURES_BASE, "/fapi/v1/order")
        } else {
            (SPOT_BASE, "/api/v3/order")
        };
        self.signed_request(Method::DELETE, base, path, &params)
            .await?;
        Ok(())
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        is_futures: bool,
    ) -> EngineResult<Vec<OrderResult>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol.to_string()));
        }
        let (base, path) = if is_futures {
            (FUTURES_BASE, "/fapi/v1/openOrders")
        } else {
            (SPOT_BASE, "/api/v3/openOrders")
        };
        let body = self.signed_request(Method::GET, base, path, &params).await?;
        let orders = body
            .as_array()
            .ok_or_else(|| EngineError::Exchange("BINANCE openOrders: not a list".into()))?;
        orders
            .iter()
            .map(|o| {
                let side = side_from_response(o);
                if is_futures {
                    parse_futures_order(o, side)
                } else {
                    parse_spot_order(o, side)
                }
            })
            .collect()
    }

    async fn get_ticker_price(&self, symbol: &str) -> EngineResult<Decimal> {
        let body = self
            .public_request(SPOT_BASE, &format!("/api/v3/ticker/price?symbol={symbol}"))
            .await?;
        json_decimal(&body, "price")
    }

    async fn get_symbol_info(&self, symbol: &str, is_futures: bool) -> EngineResult<SymbolInfo> {
        let (base, path) = if is_futures {
            (FUTURES_BASE, "/fapi/v1/exchangeInfo".to_string())
        } else {
            (SPOT_BASE, format!("/api/v3/exchangeInfo?symbol={symbol}"))
        };
        let body = self.public_request(base, &path).await?;
        let symbols = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EngineError::Exchange("BINANCE exchangeInfo: no symbols".into()))?;
        let entry = symbols
            .iter()
            .find(|s| s.get("symbol").and_then(|v| v.as_str()) == Some(symbol))
            .ok_or_else(|| {
                EngineError::Validation(format!("unknown symbol {symbol} on BINANCE"))
            })?;
        parse_symbol_filters(symbol, entry)
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
        let order_side = side.closing_side();
        if is_futures {
            self.place_futures_order(
                symbol,
                order_side,
                "STOP_MARKET",
                quantity,
                Some(stop_price),
                true,
            )
            .await
        } else {
            // Spot stop-loss-limit with the limit at the stop; fine for an
            // optimisation-only exchange-side stop.
            self.place_spot_order(
                symbol,
                order_side,
                "STOP_LOSS_LIMIT",
                quantity,
                Some(stop_price),
                Some(stop_price),
            )
            .await
        }
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn map_status(raw: &str) -> OrderStatus {
    match raw {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "PENDING_CANCEL" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        _ => OrderStatus::Pending,
    }
}

fn side_from_response(body: &Value) -> TradeSide {
    body.get("side")
        .and_then(|v| v.as_str())
        .and_then(TradeSide::parse)
        .unwrap_or(TradeSide::Buy)
}

fn parse_spot_order(body: &Value, side: TradeSide) -> EngineResult<OrderResult> {
    let order_id = body
        .get("orderId")
        .map(|v| v.to_string())
        .ok_or_else(|| EngineError::Exchange("BINANCE order: missing orderId".into()))?;
    let executed_qty = json_decimal_or(body, "executedQty", Decimal::ZERO);
    let quote_qty = json_decimal_or(body, "cummulativeQuoteQty", Decimal::ZERO);

    // Market responses carry fills; aggregate fee and the weighted avg price.
    let mut fee = Decimal::ZERO;
    let mut fee_currency = None;
    if let Some(fills) = body.get("fills").and_then(|v| v.as_array()) {
        for fill in fills {
            fee += json_decimal_or(fill, "commission", Decimal::ZERO);
            if fee_currency.is_none() {
                fee_currency = fill
                    .get("commissionAsset")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
        }
    }
    let avg_fill_price = if !executed_qty.is_zero() && !quote_qty.is_zero() {
        Some(quote_qty / executed_qty)
    } else {
        None
    };

    Ok(OrderResult {
        order_id,
        client_order_id: body
            .get("clientOrderId")
            .and_then(|v| v.as_str())
            .map(String::from),
        symbol: body
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        side,
        order_type: body
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("MARKET")
            .to_string(),
        status: map_status(body.get("status").and_then(|v| v.as_str()).unwrap_or("")),
        quantity: json_decimal_or(body, "origQty", executed_qty),
        filled_quantity: executed_qty,
        price: body.get("price").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
        avg_fill_price,
        fee,
        fee_currency,
        timestamp: Utc::now(),
    })
}

fn parse_futures_order(body: &Value, side: TradeSide) -> EngineResult<OrderResult> {
    let order_id = body
        .get("orderId")
        .map(|v| v.to_string())
        .ok_or_else(|| EngineError::Exchange("BINANCE order: missing orderId".into()))?;
    let executed_qty = json_decimal_or(body, "executedQty", Decimal::ZERO);
    let avg_price = json_decimal_or(body, "avgPrice", Decimal::ZERO);
    let cum_quote = json_decimal_or(body, "cumQuote", Decimal::ZERO);

    let avg_fill_price = if !avg_price.is_zero() {
        Some(avg_price)
    } else if !executed_qty.is_zero() && !cum_quote.is_zero() {
        Some(cum_quote / executed_qty)
    } else {
        None
    };

    Ok(OrderResult {
        order_id,
        client_order_id: body
            .get("clientOrderId")
            .and_then(|v| v.as_str())
            .map(String::from),
        symbol: body
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        side,
        order_type: body
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("MARKET")
            .to_string(),
        status: map_status(body.get("status").and_then(|v| v.as_str()).unwrap_or("")),
        quantity: json_decimal_or(body, "origQty", executed_qty),
        filled_quantity: executed_qty,
        price: None,
        avg_fill_price,
        // USDT-M futures fees arrive via the income endpoint, not the order
        // response; the engine treats them as zero at fill time.
        fee: Decimal::ZERO,
        fee_currency: Some("USDT".to_string()),
        timestamp: Utc::now(),
    })
}

fn parse_symbol_filters(symbol: &str, entry: &Value) -> EngineResult<SymbolInfo> {
    let filters = entry
        .get("filters")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EngineError::Exchange("BINANCE exchangeInfo: no filters".into()))?;

    let mut step_size = Decimal::ZERO;
    let mut tick_size = Decimal::ZERO;
    let mut min_qty = Decimal::ZERO;
    let mut min_notional = Decimal::ZERO;

    for filter in filters {
        match filter.get("filterType").and_then(|v| v.as_str()) {
            Some("LOT_SIZE") => {
                step_size = json_decimal_or(filter, "stepSize", Decimal::ZERO);
                min_qty = json_decimal_or(filter, "minQty", Decimal::ZERO);
            }
            Some("PRICE_FILTER") => {
                tick_size = json_decimal_or(filter, "tickSize", Decimal::ZERO);
            }
            // Spot uses NOTIONAL, futures MIN_NOTIONAL with a different key.
            Some("NOTIONAL") => {
                min_notional = json_decimal_or(filter, "minNotional", Decimal::ZERO);
            }
            Some("MIN_NOTIONAL") => {
                min_notional = json_decimal_or(filter, "notional", min_notional);
            }
            _ => {}
        }
    }

    Ok(SymbolInfo {
        symbol: symbol.to_string(),
        step_size,
        tick_size,
        min_qty,
        min_notional,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn spot_fill_aggregates_fees_and_average_price() {
        let body = json!({
            "orderId": 123456,
            "clientOrderId": "cch-abc",
            "symbol": "BTCUSDT",
            "type": "MARKET",
            "status": "FILLED",
            "origQty": "0.002",
            "executedQty": "0.002",
            "cummulativeQuoteQty": "100.0",
            "fills": [
                {"price": "50000", "qty": "0.001", "commission": "0.05", "commissionAsset": "USDT"},
                {"price": "50000", "qty": "0.001", "commission": "0.05", "commissionAsset": "USDT"}
            ]
        });

        let order = parse_spot_order(&body, TradeSide::Buy).unwrap();
        assert_eq!(order.order_id, "123456");
        assert!(order.is_filled());
        assert_eq!(order.filled_quantity, dec!(0.002));
        assert_eq!(order.avg_fill_price, Some(dec!(50000)));
        assert_eq!(order.fee, dec!(0.10));
        assert_eq!(order.fee_currency.as_deref(), Some("USDT"));
    }

    #[test]
    fn futures_fill_falls_back_to_cum_quote() {
        let body = json!({
            "orderId": 9,
            "symbol": "ETHUSDT",
            "type": "MARKET",
            "status": "FILLED",
            "origQty": "1",
            "executedQty": "1",
            "avgPrice": "0",
            "cumQuote": "3000"
        });

        let order = parse_futures_order(&body, TradeSide::Sell).unwrap();
        assert_eq!(order.avg_fill_price, Some(dec!(3000)));
    }

    #[test]
    fn symbol_filters_cover_both_notional_spellings() {
        let spot = json!({
            "symbol": "BTCUSDT",
            "filters": [
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                {"filterType": "PRICE_FILTER", "tickSize": "0.01"},
                {"filterType": "NOTIONAL", "minNotional": "5"}
            ]
        });
        let info = parse_symbol_filters("BTCUSDT", &spot).unwrap();
        assert_eq!(info.step_size, dec!(0.001));
        assert_eq!(info.tick_size, dec!(0.01));
        assert_eq!(info.min_notional, dec!(5));

        let futures = json!({
            "symbol": "BTCUSDT",
            "filters": [
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                {"filterType": "MIN_NOTIONAL", "notional": "100"}
            ]
        });
        let info = parse_symbol_filters("BTCUSDT", &futures).unwrap();
        assert_eq!(info.min_notional, dec!(100));
    }

    #[test]
    fn unknown_status_maps_to_pending() {
        assert_eq!(map_status("SOMETHING_NEW"), OrderStatus::Pending);
        assert_eq!(map_status("EXPIRED_IN_MATCH"), OrderStatus::Expired);
    }
}
