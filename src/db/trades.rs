// =============================================================================
// Trades Repository
// =============================================================================
//
// Status writes are explicit, one function per transition, so every 2PC step
// maps to exactly one statement. `version` bumps on every status write; the
// reconciliation worker uses it to detect concurrent finalisation.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::db::parse_enum;
use crate::error::EngineResult;
use crate::types::{Exchange, Trade, TradeSide, TradeStatus, TradeType};

/// Fields of a Phase-1 reservation insert.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub user_id: i64,
    pub signal_id: Option<i64>,
    pub whale_id: Option<i64>,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: TradeSide,
    pub trade_type: TradeType,
    pub size_usdt: Decimal,
    pub quantity: Decimal,
    pub leverage: i32,
}

/// Exchange results applied on Phase-2A confirm.
#[derive(Debug, Clone)]
pub struct TradeFill {
    pub exchange_order_id: String,
    pub executed_price: Decimal,
    pub filled_quantity: Decimal,
    pub fee_amount: Decimal,
    pub fee_currency: Option<String>,
    pub fully_filled: bool,
}

const TRADE_COLUMNS: &str = "id, user_id, signal_id, whale_id, exchange, symbol, side, \
    trade_type, size_usdt, quantity, leverage, status, exchange_order_id, executed_price, \
    filled_quantity, fee_amount, fee_currency, created_at, executed_at, error_message, version";

fn trade_from_row(row: &PgRow) -> EngineResult<Trade> {
    let exchange_raw: String = row.try_get("exchange")?;
    let side_raw: String = row.try_get("side")?;
    let type_raw: String = row.try_get("trade_type")?;
    let status_raw: String = row.try_get("status")?;
    Ok(Trade {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        signal_id: row.try_get("signal_id")?,
        whale_id: row.try_get("whale_id")?,
        exchange: parse_enum("exchange", &exchange_raw, Exchange::parse)?,
        symbol: row.try_get("symbol")?,
        side: parse_enum("side", &side_raw, TradeSide::parse)?,
        trade_type: parse_enum("trade_type", &type_raw, TradeType::parse)?,
        size_usdt: row.try_get("size_usdt")?,
        quantity: row.try_get("quantity")?,
        leverage: row.try_get("leverage")?,
        status: parse_enum("status", &status_raw, TradeStatus::parse)?,
        exchange_order_id: row.try_get("exchange_order_id")?,
        executed_price: row.try_get("executed_price")?,
        filled_quantity: row.try_get("filled_quantity")?,
        fee_amount: row.try_get("fee_amount")?,
        fee_currency: row.try_get("fee_currency")?,
        created_at: row.try_get("created_at")?,
        executed_at: row.try_get("executed_at")?,
        error_message: row.try_get("error_message")?,
        version: row.try_get("version")?,
    })
}

/// Insert the PENDING reservation row. `exchange_order_id` stays NULL until
/// the exchange call is dispatched.
pub async fn insert(conn: &mut PgConnection, new: &NewTrade) -> EngineResult<i64> {
    let row = sqlx::query(
        "INSERT INTO trades (user_id, signal_id, whale_id, exchange, symbol, side, trade_type, \
         size_usdt, quantity, leverage, status, filled_quantity, fee_amount, created_at, version) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, 0, now(), 0) \
         RETURNING id",
    )
    .bind(new.user_id)
    .bind(new.signal_id)
    .bind(new.whale_id)
    .bind(new.exchange.as_str())
    .bind(&new.symbol)
    .bind(new.side.as_str())
    .bind(new.trade_type.as_str())
    .bind(new.size_usdt)
    .bind(new.quantity)
    .bind(new.leverage)
    .bind(TradeStatus::Pending.as_str())
    .fetch_one(conn)
    .await?;
    Ok(row.try_get("id")?)
}

pub async fn get(conn: &mut PgConnection, trade_id: i64) -> EngineResult<Option<Trade>> {
    let row = sqlx::query(&format!("SELECT {TRADE_COLUMNS} FROM trades WHERE id = $1"))
        .bind(trade_id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(trade_from_row).transpose()
}

pub async fn set_status(
    conn: &mut PgConnection,
    trade_id: i64,
    status: TradeStatus,
) -> EngineResult<()> {
    sqlx::query("UPDATE trades SET status = $2, version = version + 1 WHERE id = $1")
        .bind(trade_id)
        .bind(status.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

/// Phase-2A: apply the exchange fill.
pub async fn confirm_fill(
    conn: &mut PgConnection,
    trade_id: i64,
    fill: &TradeFill,
) -> EngineResult<()> {
    let status = if fill.fully_filled {
        TradeStatus::Filled
    } else {
        TradeStatus::PartiallyFilled
    };
    sqlx::query(
        "UPDATE trades SET status = $2, exchange_order_id = $3, executed_price = $4, \
         filled_quantity = $5, fee_amount = $6, fee_currency = $7, executed_at = now(), \
         version = version + 1 WHERE id = $1",
    )
    .bind(trade_id)
    .bind(status.as_str())
    .bind(&fill.exchange_order_id)
    .bind(fill.executed_price)
    .bind(fill.filled_quantity)
    .bind(fill.fee_amount)
    .bind(&fill.fee_currency)
    .execute(conn)
    .await?;
    Ok(())
}

/// Phase-2B: terminal failure with the venue's error string.
pub async fn fail(
    conn: &mut PgConnection,
    trade_id: i64,
    error_message: &str,
) -> EngineResult<()> {
    sqlx::query(
        "UPDATE trades SET status = $2, error_message = $3, version = version + 1 WHERE id = $1",
    )
    .bind(trade_id)
    .bind(TradeStatus::Failed.as_str())
    .bind(error_message)
    .execute(conn)
    .await?;
    Ok(())
}

/// Phase-2C: hand the trade to the reconciliation worker. Only PENDING and
/// EXECUTING trades are eligible; a concurrently finalised trade is left
/// alone.
pub async fn mark_needs_reconciliation(
    conn: &mut PgConnection,
    trade_id: i64,
    error_message: &str,
    exchange_order_id: Option<&str>,
) -> EngineResult<bool> {
    let result = sqlx::query(
        "UPDATE trades SET status = $2, error_message = $3, \
         exchange_order_id = COALESCE($4, exchange_order_id), version = version + 1 \
         WHERE id = $1 AND status IN ($5, $6)",
    )
    .bind(trade_id)
    .bind(TradeStatus::NeedsReconciliation.as_str())
    .bind(error_message)
    .bind(exchange_order_id)
    .bind(TradeStatus::Pending.as_str())
    .bind(TradeStatus::Executing.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Trades waiting on the reconciliation worker.
pub async fn needing_reconciliation(
    conn: &mut PgConnection,
    limit: i64,
) -> EngineResult<Vec<Trade>> {
    let rows = sqlx::query(&format!(
        "SELECT {TRADE_COLUMNS} FROM trades WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
    ))
    .bind(TradeStatus::NeedsReconciliation.as_str())
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(trade_from_row).collect()
}

/// PENDING trades that never reached the exchange (no order id) and are older
/// than the grace window; their reservation is safe to release.
pub async fn stale_pending(
    conn: &mut PgConnection,
    older_than: DateTime<Utc>,
    limit: i64,
) -> EngineResult<Vec<Trade>> {
    let rows = sqlx::query(&format!(
        "SELECT {TRADE_COLUMNS} FROM trades \
         WHERE status = $1 AND exchange_order_id IS NULL AND created_at < $2 \
         ORDER BY created_at ASC LIMIT $3"
    ))
    .bind(TradeStatus::Pending.as_str())
    .bind(older_than)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(trade_from_row).collect()
}
