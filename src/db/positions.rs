// =============================================================================
// Positions Repository
// =============================================================================
//
// Merge candidates are always looked up by the full (user_id, symbol,
// whale_id) triple; two whales trading the same symbol for the same user
// yield two distinct rows.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::db::parse_enum;
use crate::error::EngineResult;
use crate::types::{
    CloseReason, Exchange, Position, PositionSide, PositionStatus, PositionType,
};

#[derive(Debug, Clone)]
pub struct NewPosition {
    pub user_id: i64,
    pub whale_id: Option<i64>,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: PositionSide,
    pub position_type: PositionType,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_value_usdt: Decimal,
    pub leverage: i32,
    pub liquidation_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub entry_trade_id: i64,
}

const POSITION_COLUMNS: &str = "id, user_id, whale_id, exchange, symbol, side, position_type, \
    quantity, remaining_quantity, entry_price, current_price, exit_price, entry_value_usdt, \
    current_value_usdt, leverage, liquidation_price, stop_loss_price, take_profit_price, \
    unrealized_pnl, unrealized_pnl_percent, realized_pnl, status, close_reason, entry_trade_id, \
    exit_trade_id, opened_at, closed_at";

fn position_from_row(row: &PgRow) -> EngineResult<Position> {
    let exchange_raw: String = row.try_get("exchange")?;
    let side_raw: String = row.try_get("side")?;
    let type_raw: String = row.try_get("position_type")?;
    let status_raw: String = row.try_get("status")?;
    let close_reason_raw: Option<String> = row.try_get("close_reason")?;
    Ok(Position {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        whale_id: row.try_get("whale_id")?,
        exchange: parse_enum("exchange", &exchange_raw, Exchange::parse)?,
        symbol: row.try_get("symbol")?,
        side: parse_enum("side", &side_raw, PositionSide::parse)?,
        position_type: parse_enum("position_type", &type_raw, PositionType::parse)?,
        quantity: row.try_get("quantity")?,
        remaining_quantity: row.try_get("remaining_quantity")?,
        entry_price: row.try_get("entry_price")?,
        current_price: row.try_get("current_price")?,
        exit_price: row.try_get("exit_price")?,
        entry_value_usdt: row.try_get("entry_value_usdt")?,
        current_value_usdt: row.try_get("current_value_usdt")?,
        leverage: row.try_get("leverage")?,
        liquidation_price: row.try_get("liquidation_price")?,
        stop_loss_price: row.try_get("stop_loss_price")?,
        take_profit_price: row.try_get("take_profit_price")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        unrealized_pnl_percent: row.try_get("unrealized_pnl_percent")?,
        realized_pnl: row.try_get("realized_pnl")?,
        status: parse_enum("status", &status_raw, PositionStatus::parse)?,
        close_reason: match close_reason_raw {
            Some(raw) => Some(parse_enum("close_reason", &raw, CloseReason::parse)?),
            None => None,
        },
        entry_trade_id: row.try_get("entry_trade_id")?,
        exit_trade_id: row.try_get("exit_trade_id")?,
        opened_at: row.try_get("opened_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, new: &NewPosition) -> EngineResult<i64> {
    let row = sqlx::query(
        "INSERT INTO positions (user_id, whale_id, exchange, symbol, side, position_type, \
         quantity, remaining_quantity, entry_price, current_price, entry_value_usdt, \
         current_value_usdt, leverage, liquidation_price, stop_loss_price, take_profit_price, \
         unrealized_pnl, unrealized_pnl_percent, status, entry_trade_id, opened_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8, $8, $9, $9, $10, $11, $12, $13, 0, 0, \
         $14, $15, now()) RETURNING id",
    )
    .bind(new.user_id)
    .bind(new.whale_id)
    .bind(new.exchange.as_str())
    .bind(&new.symbol)
    .bind(new.side.as_str())
    .bind(new.position_type.as_str())
    .bind(new.quantity)
    .bind(new.entry_price)
    .bind(new.entry_value_usdt)
    .bind(new.leverage)
    .bind(new.liquidation_price)
    .bind(new.stop_loss_price)
    .bind(new.take_profit_price)
    .bind(PositionStatus::Open.as_str())
    .bind(new.entry_trade_id)
    .fetch_one(conn)
    .await?;
    Ok(row.try_get("id")?)
}

pub async fn get(conn: &mut PgConnection, position_id: i64) -> EngineResult<Option<Position>> {
    let row = sqlx::query(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1"
    ))
    .bind(position_id)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(position_from_row).transpose()
}

/// The merge lookup: an OPEN position for the same (user, symbol, whale)
/// triple, locked so a concurrent fill for the same triple waits.
pub async fn find_open_for_merge(
    conn: &mut PgConnection,
    user_id: i64,
    symbol: &str,
    whale_id: Option<i64>,
) -> EngineResult<Option<Position>> {
    let row = sqlx::query(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions \
         WHERE user_id = $1 AND symbol = $2 AND whale_id IS NOT DISTINCT FROM $3 \
         AND status = $4 FOR UPDATE"
    ))
    .bind(user_id)
    .bind(symbol)
    .bind(whale_id)
    .bind(PositionStatus::Open.as_str())
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(position_from_row).transpose()
}

/// Fold an additional fill into an existing position (averaged entry).
#[allow(clippy::too_many_arguments)]
pub async fn merge_fill(
    conn: &mut PgConnection,
    position_id: i64,
    entry_price: Decimal,
    quantity: Decimal,
    remaining_quantity: Decimal,
    current_price: Decimal,
    added_value_usdt: Decimal,
    current_value_usdt: Decimal,
) -> EngineResult<()> {
    sqlx::query(
        "UPDATE positions SET entry_price = $2, quantity = $3, remaining_quantity = $4, \
         current_price = $5, entry_value_usdt = entry_value_usdt + $6, \
         current_value_usdt = $7 WHERE id = $1",
    )
    .bind(position_id)
    .bind(entry_price)
    .bind(quantity)
    .bind(remaining_quantity)
    .bind(current_price)
    .bind(added_value_usdt)
    .bind(current_value_usdt)
    .execute(conn)
    .await?;
    Ok(())
}

/// OPEN positions that a close signal from `whale_id` on `symbol` targets.
pub async fn open_for_whale_symbol(
    conn: &mut PgConnection,
    whale_id: i64,
    symbol: &str,
) -> EngineResult<Vec<Position>> {
    let rows = sqlx::query(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions \
         WHERE whale_id = $1 AND symbol = $2 AND status = $3"
    ))
    .bind(whale_id)
    .bind(symbol)
    .bind(PositionStatus::Open.as_str())
    .fetch_all(conn)
    .await?;
    rows.iter().map(position_from_row).collect()
}

pub async fn open_count_for_user(conn: &mut PgConnection, user_id: i64) -> EngineResult<i64> {
    let row = sqlx::query("SELECT count(*) AS n FROM positions WHERE user_id = $1 AND status = $2")
        .bind(user_id)
        .bind(PositionStatus::Open.as_str())
        .fetch_one(conn)
        .await?;
    Ok(row.try_get("n")?)
}

/// Every OPEN position, for the mark-to-market sweep.
pub async fn all_open(conn: &mut PgConnection, limit: i64) -> EngineResult<Vec<Position>> {
    let rows = sqlx::query(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions WHERE status = $1 ORDER BY id ASC LIMIT $2"
    ))
    .bind(PositionStatus::Open.as_str())
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(position_from_row).collect()
}

pub async fn update_mark(
    conn: &mut PgConnection,
    position_id: i64,
    current_price: Decimal,
    current_value_usdt: Decimal,
    unrealized_pnl: Decimal,
    unrealized_pnl_percent: Decimal,
) -> EngineResult<()> {
    sqlx::query(
        "UPDATE positions SET current_price = $2, current_value_usdt = $3, \
         unrealized_pnl = $4, unrealized_pnl_percent = $5 WHERE id = $1 AND status = $6",
    )
    .bind(position_id)
    .bind(current_price)
    .bind(current_value_usdt)
    .bind(unrealized_pnl)
    .bind(unrealized_pnl_percent)
    .bind(PositionStatus::Open.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

/// Terminal transition. `status` is CLOSED or LIQUIDATED; `realized_pnl` is
/// set here and never again.
#[allow(clippy::too_many_arguments)]
pub async fn close(
    conn: &mut PgConnection,
    position_id: i64,
    status: PositionStatus,
    close_reason: CloseReason,
    exit_price: Decimal,
    exit_trade_id: Option<i64>,
    realized_pnl: Decimal,
) -> EngineResult<()> {
    sqlx::query(
        "UPDATE positions SET status = $2, close_reason = $3, exit_price = $4, \
         exit_trade_id = $5, realized_pnl = $6, remaining_quantity = 0, unrealized_pnl = 0, \
         unrealized_pnl_percent = 0, closed_at = now() WHERE id = $1",
    )
    .bind(position_id)
    .bind(status.as_str())
    .bind(close_reason.as_str())
    .bind(exit_price)
    .bind(exit_trade_id)
    .bind(realized_pnl)
    .execute(conn)
    .await?;
    Ok(())
}

/// Partial close: the position stays OPEN with the reduced quantity.
pub async fn reduce(
    conn: &mut PgConnection,
    position_id: i64,
    remaining_quantity: Decimal,
) -> EngineResult<()> {
    sqlx::query("UPDATE positions SET remaining_quantity = $2 WHERE id = $1")
        .bind(position_id)
        .bind(remaining_quantity)
        .execute(conn)
        .await?;
    Ok(())
}

/// Sum of today's realized losses (absolute value) for the risk gate.
pub async fn daily_realized_loss(
    conn: &mut PgConnection,
    user_id: i64,
    day_start: DateTime<Utc>,
) -> EngineResult<Decimal> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(ABS(realized_pnl)), 0) AS loss FROM positions \
         WHERE user_id = $1 AND status IN ($2, $3) AND realized_pnl < 0 AND closed_at >= $4",
    )
    .bind(user_id)
    .bind(PositionStatus::Closed.as_str())
    .bind(PositionStatus::Liquidated.as_str())
    .bind(day_start)
    .fetch_one(conn)
    .await?;
    Ok(row.try_get("loss")?)
}
