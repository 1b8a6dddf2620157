// =============================================================================
// Users Repository — trading projection of the user row
// =============================================================================
//
// The engine writes exactly one user field, `available_balance`, and always
// under `SELECT ... FOR UPDATE` acquired by the trade executing for that
// user. That row lock is the only lock the engine ever holds across
// statements.
// =============================================================================

use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::db::parse_enum;
use crate::error::EngineResult;
use crate::types::{Exchange, SizingStrategy, SubscriptionTier, TradingMode, UserAccount, UserSettings};

fn user_from_row(row: &PgRow) -> EngineResult<UserAccount> {
    let tier_raw: String = row.try_get("subscription_tier")?;
    Ok(UserAccount {
        id: row.try_get("id")?,
        is_active: row.try_get("is_active")?,
        is_banned: row.try_get("is_banned")?,
        available_balance: row.try_get("available_balance")?,
        subscription_tier: parse_enum("subscription_tier", &tier_raw, SubscriptionTier::parse)?,
    })
}

fn settings_from_row(row: &PgRow) -> EngineResult<UserSettings> {
    let exchange_raw: String = row.try_get("preferred_exchange")?;
    let mode_raw: String = row.try_get("trading_mode")?;
    let sizing_raw: Option<String> = row.try_get("sizing_strategy")?;
    Ok(UserSettings {
        user_id: row.try_get("user_id")?,
        default_trade_size_usdt: row.try_get("default_trade_size_usdt")?,
        trade_size_percent: row.try_get("trade_size_percent")?,
        max_trade_size_usdt: row.try_get("max_trade_size_usdt")?,
        daily_loss_limit_usdt: row.try_get("daily_loss_limit_usdt")?,
        stop_loss_percent: row.try_get("stop_loss_percent")?,
        take_profit_percent: row.try_get("take_profit_percent")?,
        default_leverage: row.try_get("default_leverage")?,
        max_leverage: row.try_get("max_leverage")?,
        preferred_exchange: parse_enum("preferred_exchange", &exchange_raw, Exchange::parse)?,
        trading_mode: parse_enum("trading_mode", &mode_raw, TradingMode::parse)?,
        sizing_strategy: match sizing_raw {
            Some(raw) => Some(parse_enum("sizing_strategy", &raw, SizingStrategy::parse)?),
            None => None,
        },
        kelly_fraction: row.try_get("kelly_fraction")?,
        notify_trade_executed: row.try_get("notify_trade_executed")?,
    })
}

const USER_COLUMNS: &str = "id, is_active, is_banned, available_balance, subscription_tier";

pub async fn get(conn: &mut PgConnection, user_id: i64) -> EngineResult<Option<UserAccount>> {
    let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(user_id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

/// Acquire the per-user row lock. Waits for any concurrent holder; this is
/// what serialises two trades racing for the same balance.
pub async fn lock_for_update(
    conn: &mut PgConnection,
    user_id: i64,
) -> EngineResult<Option<UserAccount>> {
    let row = sqlx::query(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
    ))
    .bind(user_id)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(user_from_row).transpose()
}

/// Apply a signed delta to `available_balance`. Callers must hold the row
/// lock in the same transaction.
pub async fn adjust_balance(
    conn: &mut PgConnection,
    user_id: i64,
    delta: Decimal,
) -> EngineResult<()> {
    sqlx::query("UPDATE users SET available_balance = available_balance + $2 WHERE id = $1")
        .bind(user_id)
        .bind(delta)
        .execute(conn)
        .await?;
    Ok(())
}

/// Active API credentials for a venue. Key material is stored by the
/// out-of-scope credential service; this projection only reads it.
pub async fn get_api_credentials(
    conn: &mut PgConnection,
    user_id: i64,
    exchange: Exchange,
) -> EngineResult<Option<crate::exchanges::Credentials>> {
    let row = sqlx::query(
        "SELECT api_key, api_secret, passphrase FROM user_api_keys \
         WHERE user_id = $1 AND exchange = $2 AND is_active",
    )
    .bind(user_id)
    .bind(exchange.as_str())
    .fetch_optional(conn)
    .await?;
    match row {
        Some(row) => Ok(Some(crate::exchanges::Credentials {
            api_key: row.try_get("api_key")?,
            api_secret: row.try_get("api_secret")?,
            passphrase: row.try_get("passphrase")?,
        })),
        None => Ok(None),
    }
}

pub async fn get_settings(
    conn: &mut PgConnection,
    user_id: i64,
) -> EngineResult<Option<UserSettings>> {
    let row = sqlx::query(
        "SELECT user_id, default_trade_size_usdt, trade_size_percent, max_trade_size_usdt, \
         daily_loss_limit_usdt, stop_loss_percent, take_profit_percent, default_leverage, \
         max_leverage, preferred_exchange, trading_mode, sizing_strategy, kelly_fraction, \
         notify_trade_executed \
         FROM user_settings WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(settings_from_row).transpose()
}
