// =============================================================================
// Whale Follows Repository
// =============================================================================

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::db::{parse_enum, users};
use crate::error::EngineResult;
use crate::types::{
    SizingStrategy, TradingMode, UserAccount, UserSettings, WhaleFollow,
};

const FOLLOW_COLUMNS: &str = "id, user_id, whale_id, auto_copy_enabled, notify_on_trade, \
    trade_size_usdt, trade_size_percent, max_trade_size_usdt, trading_mode_override, \
    sizing_strategy_override, kelly_fraction_override, trades_copied";

fn follow_from_row(row: &PgRow) -> EngineResult<WhaleFollow> {
    let mode_raw: Option<String> = row.try_get("trading_mode_override")?;
    let sizing_raw: Option<String> = row.try_get("sizing_strategy_override")?;
    Ok(WhaleFollow {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        whale_id: row.try_get("whale_id")?,
        auto_copy_enabled: row.try_get("auto_copy_enabled")?,
        notify_on_trade: row.try_get("notify_on_trade")?,
        trade_size_usdt: row.try_get("trade_size_usdt")?,
        trade_size_percent: row.try_get("trade_size_percent")?,
        max_trade_size_usdt: row.try_get("max_trade_size_usdt")?,
        trading_mode_override: match mode_raw {
            Some(raw) => Some(parse_enum("trading_mode_override", &raw, TradingMode::parse)?),
            None => None,
        },
        sizing_strategy_override: match sizing_raw {
            Some(raw) => Some(parse_enum(
                "sizing_strategy_override",
                &raw,
                SizingStrategy::parse,
            )?),
            None => None,
        },
        kelly_fraction_override: row.try_get("kelly_fraction_override")?,
        trades_copied: row.try_get("trades_copied")?,
    })
}

/// A follower resolved for copy execution: the follow row plus the user
/// projection and their optional settings.
#[derive(Debug, Clone)]
pub struct ResolvedFollower {
    pub follow: WhaleFollow,
    pub user: UserAccount,
    pub settings: Option<UserSettings>,
}

/// Every active, unbanned user auto-copying `whale_id`.
pub async fn auto_copy_followers(
    conn: &mut PgConnection,
    whale_id: i64,
) -> EngineResult<Vec<ResolvedFollower>> {
    let rows = sqlx::query(
        "SELECT f.id, f.user_id, f.whale_id, f.auto_copy_enabled, f.notify_on_trade, \
         f.trade_size_usdt, f.trade_size_percent, f.max_trade_size_usdt, \
         f.trading_mode_override, f.sizing_strategy_override, f.kelly_fraction_override, \
         f.trades_copied \
         FROM whale_follows f \
         JOIN users u ON u.id = f.user_id \
         WHERE f.whale_id = $1 AND f.auto_copy_enabled \
         AND u.is_active AND NOT u.is_banned \
         ORDER BY f.id ASC",
    )
    .bind(whale_id)
    .fetch_all(&mut *conn)
    .await?;

    let follows: Vec<WhaleFollow> = rows
        .iter()
        .map(follow_from_row)
        .collect::<EngineResult<_>>()?;

    let mut resolved = Vec::with_capacity(follows.len());
    for follow in follows {
        let Some(user) = users::get(&mut *conn, follow.user_id).await? else {
            continue;
        };
        let settings = users::get_settings(&mut *conn, follow.user_id).await?;
        resolved.push(ResolvedFollower {
            follow,
            user,
            settings,
        });
    }
    Ok(resolved)
}

pub async fn find(
    conn: &mut PgConnection,
    user_id: i64,
    whale_id: i64,
) -> EngineResult<Option<WhaleFollow>> {
    let row = sqlx::query(&format!(
        "SELECT {FOLLOW_COLUMNS} FROM whale_follows WHERE user_id = $1 AND whale_id = $2"
    ))
    .bind(user_id)
    .bind(whale_id)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(follow_from_row).transpose()
}

pub async fn increment_trades_copied(
    conn: &mut PgConnection,
    follow_id: i64,
) -> EngineResult<()> {
    sqlx::query("UPDATE whale_follows SET trades_copied = trades_copied + 1 WHERE id = $1")
        .bind(follow_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn follower_count(conn: &mut PgConnection, whale_id: i64) -> EngineResult<i64> {
    let row = sqlx::query("SELECT count(*) AS n FROM whale_follows WHERE whale_id = $1")
        .bind(whale_id)
        .fetch_one(conn)
        .await?;
    Ok(row.try_get("n")?)
}

/// Whale ids with at least one follower who wants trade notifications; these
/// whales poll in the CRITICAL tier.
pub async fn followed_whale_ids(conn: &mut PgConnection) -> EngineResult<Vec<i64>> {
    let rows = sqlx::query(
        "SELECT DISTINCT whale_id FROM whale_follows WHERE notify_on_trade",
    )
    .fetch_all(conn)
    .await?;
    rows.iter()
        .map(|r| Ok(r.try_get::<i64, _>("whale_id")?))
        .collect()
}
