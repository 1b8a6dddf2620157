// =============================================================================
// Whales Repository — tier selection queries and data-status decay
// =============================================================================

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::db::parse_enum;
use crate::error::EngineResult;
use crate::types::{DataStatus, Exchange, Whale};

const WHALE_COLUMNS: &str = "id, name, exchange, exchange_uid, is_active, data_status, \
    priority_score, score, win_rate, avg_profit_percent, last_position_found, \
    consecutive_empty_polls";

fn whale_from_row(row: &PgRow) -> EngineResult<Whale> {
    let exchange_raw: String = row.try_get("exchange")?;
    let status_raw: String = row.try_get("data_status")?;
    Ok(Whale {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        exchange: parse_enum("exchange", &exchange_raw, Exchange::parse)?,
        exchange_uid: row.try_get("exchange_uid")?,
        is_active: row.try_get("is_active")?,
        data_status: parse_enum("data_status", &status_raw, DataStatus::parse)?,
        priority_score: row.try_get("priority_score")?,
        score: row.try_get("score")?,
        win_rate: row.try_get("win_rate")?,
        avg_profit_percent: row.try_get("avg_profit_percent")?,
        last_position_found: row.try_get("last_position_found")?,
        consecutive_empty_polls: row.try_get("consecutive_empty_polls")?,
    })
}

pub async fn get(conn: &mut PgConnection, whale_id: i64) -> EngineResult<Option<Whale>> {
    let row = sqlx::query(&format!("SELECT {WHALE_COLUMNS} FROM whales WHERE id = $1"))
        .bind(whale_id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(whale_from_row).transpose()
}

pub async fn active_whales(conn: &mut PgConnection) -> EngineResult<Vec<Whale>> {
    let rows = sqlx::query(&format!(
        "SELECT {WHALE_COLUMNS} FROM whales WHERE is_active ORDER BY id ASC"
    ))
    .fetch_all(conn)
    .await?;
    rows.iter().map(whale_from_row).collect()
}

/// CRITICAL tier: followed whales with ACTIVE data and recent activity (or
/// never checked), most recently active first.
pub async fn critical_whales(
    conn: &mut PgConnection,
    followed_ids: &[i64],
    limit: i64,
) -> EngineResult<Vec<Whale>> {
    if followed_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(&format!(
        "SELECT {WHALE_COLUMNS} FROM whales \
         WHERE is_active AND data_status = $1 AND id = ANY($2) \
         AND (last_position_found >= now() - interval '1 hour' OR last_position_found IS NULL) \
         ORDER BY last_position_found DESC NULLS LAST, priority_score DESC LIMIT $3"
    ))
    .bind(DataStatus::Active.as_str())
    .bind(followed_ids)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(whale_from_row).collect()
}

/// HIGH tier: Bitget whales (positions always public) plus priority_score of
/// 70 and above, excluding the CRITICAL set.
pub async fn high_priority_whales(
    conn: &mut PgConnection,
    exclude_ids: &[i64],
    limit: i64,
) -> EngineResult<Vec<Whale>> {
    let rows = sqlx::query(&format!(
        "SELECT {WHALE_COLUMNS} FROM whales \
         WHERE is_active AND data_status = $1 \
         AND (exchange = $2 OR priority_score >= 70) \
         AND NOT (id = ANY($3)) \
         ORDER BY (exchange = $2) DESC, priority_score DESC LIMIT $4"
    ))
    .bind(DataStatus::Active.as_str())
    .bind(Exchange::Bitget.as_str())
    .bind(exclude_ids)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(whale_from_row).collect()
}

/// NORMAL tier: priority_score in [40, 70), not Bitget, not excluded.
pub async fn normal_whales(
    conn: &mut PgConnection,
    exclude_ids: &[i64],
    limit: i64,
) -> EngineResult<Vec<Whale>> {
    let rows = sqlx::query(&format!(
        "SELECT {WHALE_COLUMNS} FROM whales \
         WHERE is_active AND data_status = $1 \
         AND priority_score >= 40 AND priority_score < 70 AND exchange <> $2 \
         AND NOT (id = ANY($3)) \
         ORDER BY priority_score DESC LIMIT $4"
    ))
    .bind(DataStatus::Active.as_str())
    .bind(Exchange::Bitget.as_str())
    .bind(exclude_ids)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(whale_from_row).collect()
}

/// LOW tier: priority_score below 40, not excluded.
pub async fn low_priority_whales(
    conn: &mut PgConnection,
    exclude_ids: &[i64],
    limit: i64,
) -> EngineResult<Vec<Whale>> {
    let rows = sqlx::query(&format!(
        "SELECT {WHALE_COLUMNS} FROM whales \
         WHERE is_active AND data_status = $1 AND priority_score < 40 \
         AND NOT (id = ANY($2)) \
         ORDER BY priority_score DESC LIMIT $3"
    ))
    .bind(DataStatus::Active.as_str())
    .bind(exclude_ids)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(whale_from_row).collect()
}

pub async fn update_priority_score(
    conn: &mut PgConnection,
    whale_id: i64,
    score: i32,
) -> EngineResult<()> {
    sqlx::query("UPDATE whales SET priority_score = $2 WHERE id = $1")
        .bind(whale_id)
        .bind(score)
        .execute(conn)
        .await?;
    Ok(())
}

/// A poll found live positions: record the timestamp and clear the decay
/// counter.
pub async fn mark_position_found(conn: &mut PgConnection, whale_id: i64) -> EngineResult<()> {
    sqlx::query(
        "UPDATE whales SET last_position_found = now(), consecutive_empty_polls = 0, \
         data_status = $2 WHERE id = $1",
    )
    .bind(whale_id)
    .bind(DataStatus::Active.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

/// A poll failed outright. Returns the new consecutive count so the caller
/// can apply the STALE/DEAD decay rule.
pub async fn record_failed_poll(conn: &mut PgConnection, whale_id: i64) -> EngineResult<i32> {
    let row = sqlx::query(
        "UPDATE whales SET consecutive_empty_polls = consecutive_empty_polls + 1 \
         WHERE id = $1 RETURNING consecutive_empty_polls",
    )
    .bind(whale_id)
    .fetch_one(conn)
    .await?;
    Ok(row.try_get("consecutive_empty_polls")?)
}

pub async fn set_data_status(
    conn: &mut PgConnection,
    whale_id: i64,
    status: DataStatus,
) -> EngineResult<()> {
    sqlx::query("UPDATE whales SET data_status = $2 WHERE id = $1")
        .bind(whale_id)
        .bind(status.as_str())
        .execute(conn)
        .await?;
    Ok(())
}
