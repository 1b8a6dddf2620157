// =============================================================================
// Signals Repository — queue storage with optimistic claiming
// =============================================================================
//
// Ordering is (priority rank, detected_at): HIGH before MEDIUM before LOW,
// oldest first within a priority. Claims are version-checked so two workers
// can never both move the same signal to PROCESSING.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::db::parse_enum;
use crate::error::EngineResult;
use crate::types::{
    Signal, SignalPriority, SignalSource, SignalStatus, TradeSide, TradeType,
};

#[derive(Debug, Clone)]
pub struct NewSignal {
    pub whale_id: i64,
    pub source: SignalSource,
    pub symbol: String,
    pub side: TradeSide,
    pub trade_type: TradeType,
    pub price: Decimal,
    pub size_usd: Decimal,
    pub is_close: bool,
    pub reduce_only: bool,
    pub priority: SignalPriority,
    pub dedup_token: String,
}

const SIGNAL_COLUMNS: &str = "id, whale_id, source, symbol, side, trade_type, price, size_usd, \
    is_close, reduce_only, priority, status, dedup_token, detected_at, processing_started_at, \
    processed_at, trades_executed, error_message, version";

fn signal_from_row(row: &PgRow) -> EngineResult<Signal> {
    let source_raw: String = row.try_get("source")?;
    let side_raw: String = row.try_get("side")?;
    let type_raw: String = row.try_get("trade_type")?;
    let priority_raw: String = row.try_get("priority")?;
    let status_raw: String = row.try_get("status")?;
    Ok(Signal {
        id: row.try_get("id")?,
        whale_id: row.try_get("whale_id")?,
        source: parse_enum("source", &source_raw, SignalSource::parse)?,
        symbol: row.try_get("symbol")?,
        side: parse_enum("side", &side_raw, TradeSide::parse)?,
        trade_type: parse_enum("trade_type", &type_raw, TradeType::parse)?,
        price: row.try_get("price")?,
        size_usd: row.try_get("size_usd")?,
        is_close: row.try_get("is_close")?,
        reduce_only: row.try_get("reduce_only")?,
        priority: parse_enum("priority", &priority_raw, SignalPriority::parse)?,
        status: parse_enum("status", &status_raw, SignalStatus::parse)?,
        dedup_token: row.try_get("dedup_token")?,
        detected_at: row.try_get("detected_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        processed_at: row.try_get("processed_at")?,
        trades_executed: row.try_get("trades_executed")?,
        error_message: row.try_get("error_message")?,
        version: row.try_get("version")?,
    })
}

pub async fn insert(conn: &mut PgConnection, new: &NewSignal) -> EngineResult<i64> {
    let row = sqlx::query(
        "INSERT INTO signals (whale_id, source, symbol, side, trade_type, price, size_usd, \
         is_close, reduce_only, priority, status, dedup_token, detected_at, trades_executed, \
         version) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now(), 0, 0) RETURNING id",
    )
    .bind(new.whale_id)
    .bind(new.source.as_str())
    .bind(&new.symbol)
    .bind(new.side.as_str())
    .bind(new.trade_type.as_str())
    .bind(new.price)
    .bind(new.size_usd)
    .bind(new.is_close)
    .bind(new.reduce_only)
    .bind(new.priority.as_str())
    .bind(SignalStatus::Pending.as_str())
    .bind(&new.dedup_token)
    .fetch_one(conn)
    .await?;
    Ok(row.try_get("id")?)
}

pub async fn get(conn: &mut PgConnection, signal_id: i64) -> EngineResult<Option<Signal>> {
    let row = sqlx::query(&format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = $1"))
        .bind(signal_id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(signal_from_row).transpose()
}

/// The top PENDING candidates in queue order, not yet expired and at or above
/// `min_priority`. The caller claims them one at a time with `try_claim`.
pub async fn pending_candidates(
    conn: &mut PgConnection,
    min_priority: SignalPriority,
    detected_after: DateTime<Utc>,
    limit: i64,
) -> EngineResult<Vec<Signal>> {
    let rows = sqlx::query(&format!(
        "SELECT {SIGNAL_COLUMNS} FROM signals \
         WHERE status = $1 AND detected_at >= $2 \
         AND CASE priority WHEN 'HIGH' THEN 0 WHEN 'MEDIUM' THEN 1 ELSE 2 END <= $3 \
         ORDER BY CASE priority WHEN 'HIGH' THEN 0 WHEN 'MEDIUM' THEN 1 ELSE 2 END ASC, \
         detected_at ASC LIMIT $4"
    ))
    .bind(SignalStatus::Pending.as_str())
    .bind(detected_after)
    .bind(min_priority.rank())
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(signal_from_row).collect()
}

/// Version-checked PENDING -> PROCESSING transition. Returns false when
/// another worker claimed the signal first.
pub async fn try_claim(
    conn: &mut PgConnection,
    signal_id: i64,
    version: i32,
) -> EngineResult<bool> {
    let result = sqlx::query(
        "UPDATE signals SET status = $2, processing_started_at = now(), version = version + 1 \
         WHERE id = $1 AND version = $3 AND status = $4",
    )
    .bind(signal_id)
    .bind(SignalStatus::Processing.as_str())
    .bind(version)
    .bind(SignalStatus::Pending.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// PROCESSING -> PROCESSED. `processed_at` is set exactly here.
pub async fn mark_processed(
    conn: &mut PgConnection,
    signal_id: i64,
    trades_executed: i32,
) -> EngineResult<()> {
    sqlx::query(
        "UPDATE signals SET status = $2, trades_executed = $3, processed_at = now(), \
         version = version + 1 WHERE id = $1",
    )
    .bind(signal_id)
    .bind(SignalStatus::Processed.as_str())
    .bind(trades_executed)
    .execute(conn)
    .await?;
    Ok(())
}

/// Terminal failure, valid from both PENDING (validation) and PROCESSING.
pub async fn mark_failed(
    conn: &mut PgConnection,
    signal_id: i64,
    error_message: &str,
) -> EngineResult<()> {
    sqlx::query(
        "UPDATE signals SET status = $2, error_message = $3, processed_at = now(), \
         version = version + 1 WHERE id = $1",
    )
    .bind(signal_id)
    .bind(SignalStatus::Failed.as_str())
    .bind(error_message)
    .execute(conn)
    .await?;
    Ok(())
}

/// Batch-expire over-age PENDING signals. Returns the number transitioned.
pub async fn expire_overdue(
    conn: &mut PgConnection,
    detected_before: DateTime<Utc>,
) -> EngineResult<u64> {
    let result = sqlx::query(
        "UPDATE signals SET status = $2, processed_at = now(), version = version + 1 \
         WHERE status = $1 AND detected_at < $3",
    )
    .bind(SignalStatus::Pending.as_str())
    .bind(SignalStatus::Expired.as_str())
    .bind(detected_before)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn pending_depth(conn: &mut PgConnection) -> EngineResult<i64> {
    let row = sqlx::query("SELECT count(*) AS n FROM signals WHERE status = $1")
        .bind(SignalStatus::Pending.as_str())
        .fetch_one(conn)
        .await?;
    Ok(row.try_get("n")?)
}
