// =============================================================================
// Database Layer — Postgres pool, transactions, and aggregate repositories
// =============================================================================
//
// Aggregates are reached only through their repository module; cross-aggregate
// writes share one transaction obtained from `Db::begin`. Repository functions
// take `&mut PgConnection` so the same code serves both pooled one-shot calls
// and multi-statement transactions (`&mut *tx`).
//
// Enum columns are TEXT; conversion goes through `types::*::{as_str, parse}`
// and nowhere else.
// =============================================================================

pub mod follows;
pub mod positions;
pub mod signals;
pub mod trades;
pub mod users;
pub mod whales;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// Upper bound on pooled connections; polling loops and trade workers share it.
const MAX_CONNECTIONS: u32 = 20;

#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(url)
            .await?;
        info!("database pool connected");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction; commit it explicitly, drop rolls back.
    pub async fn begin(&self) -> EngineResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Acquire a single pooled connection for repository calls outside a
    /// transaction.
    pub async fn acquire(&self) -> EngineResult<sqlx::pool::PoolConnection<Postgres>> {
        Ok(self.pool.acquire().await?)
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish()
    }
}

/// Decode a TEXT enum column, failing loudly on values this binary does not
/// know (schema drift, not user input).
pub(crate) fn parse_enum<T>(
    what: &str,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> EngineResult<T> {
    parse(raw)
        .ok_or_else(|| EngineError::Fatal(format!("unknown {what} value in database: {raw}")))
}
