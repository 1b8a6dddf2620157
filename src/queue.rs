// =============================================================================
// Signal Queue — priority-ordered pickup with exactly-once claiming
// =============================================================================
//
// Backed by the signals table. `pick_next` reads the top PENDING candidates
// in (priority, detected_at) order and claims one with a version-checked
// update; losing a claim race just moves on to the next candidate. Expired
// signals are never dispatched and a background sweep moves them to EXPIRED.
// =============================================================================

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::db::{signals, Db};
use crate::error::EngineResult;
use crate::types::{Signal, SignalPriority};

/// How many PENDING candidates one pick inspects before giving up.
const CLAIM_CANDIDATES: i64 = 10;

pub struct SignalQueue {
    db: Db,
    expiry_seconds: i64,
}

impl SignalQueue {
    pub fn new(db: Db, expiry_seconds: i64) -> Self {
        Self { db, expiry_seconds }
    }

    /// Claim the highest-priority, oldest PENDING signal that has not
    /// expired. Returns None when the queue is empty (or every candidate was
    /// claimed by faster workers).
    pub async fn pick_next(
        &self,
        min_priority: SignalPriority,
    ) -> EngineResult<Option<Signal>> {
        let mut conn = self.db.acquire().await?;
        let cutoff = Utc::now() - ChronoDuration::seconds(self.expiry_seconds);
        let candidates =
            signals::pending_candidates(&mut conn, min_priority, cutoff, CLAIM_CANDIDATES)
                .await?;

        for candidate in candidates {
            if signals::try_claim(&mut conn, candidate.id, candidate.version).await? {
                debug!(
                    signal_id = candidate.id,
                    symbol = %candidate.symbol,
                    priority = %candidate.priority,
                    "signal claimed"
                );
                return signals::get(&mut conn, candidate.id).await;
            }
            // Version moved: another worker claimed it first.
            debug!(signal_id = candidate.id, "claim race lost, trying next");
        }
        Ok(None)
    }

    pub async fn mark_processed(&self, signal_id: i64, trades_executed: i32) -> EngineResult<()> {
        let mut conn = self.db.acquire().await?;
        signals::mark_processed(&mut conn, signal_id, trades_executed).await?;
        info!(signal_id, trades_executed, "signal processed");
        Ok(())
    }

    pub async fn mark_failed(&self, signal_id: i64, error: &str) -> EngineResult<()> {
        let mut conn = self.db.acquire().await?;
        signals::mark_failed(&mut conn, signal_id, error).await?;
        warn!(signal_id, error, "signal failed");
        Ok(())
    }

    /// Sweep over-age PENDING signals to EXPIRED. Returns the count.
    pub async fn cleanup_expired(&self) -> EngineResult<u64> {
        let mut conn = self.db.acquire().await?;
        let cutoff = Utc::now() - ChronoDuration::seconds(self.expiry_seconds);
        let expired = signals::expire_overdue(&mut conn, cutoff).await?;
        if expired > 0 {
            info!(expired, "expired signals swept");
        }
        Ok(expired)
    }

    pub async fn depth(&self) -> EngineResult<i64> {
        let mut conn = self.db.acquire().await?;
        signals::pending_depth(&mut conn).await
    }
}
