// =============================================================================
// Adaptive Scheduler — priority tiers deciding which whales each tick polls
// =============================================================================
//
// Tier table:
//   CRITICAL  2 s / 10   followed whales with fresh (or never-checked) data
//   HIGH      5 s / 50   Bitget (positions always public) or score >= 70
//   NORMAL   15 s / 100  score in [40, 70), not Bitget
//   LOW      60 s / 200  everything else still worth watching
//
// Priority scores are recomputed periodically from exchange, follower count,
// recency and whale ROI; see `priority_score`.
// =============================================================================

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{PollingConfig, TierConfig};
use crate::db::{follows, whales, Db};
use crate::error::EngineResult;
use crate::types::{Exchange, Whale};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollingTier {
    Critical,
    High,
    Normal,
    Low,
}

impl PollingTier {
    pub fn all() -> [PollingTier; 4] {
        [Self::Critical, Self::High, Self::Normal, Self::Low]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
        }
    }

    pub fn config(&self, polling: &PollingConfig) -> TierConfig {
        match self {
            Self::Critical => polling.critical,
            Self::High => polling.high,
            Self::Normal => polling.normal,
            Self::Low => polling.low,
        }
    }
}

impl std::fmt::Display for PollingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one tier for the ops API.
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: PollingTier,
    pub count: usize,
    pub max: i64,
    pub interval_seconds: u64,
}

pub struct AdaptiveScheduler {
    db: Db,
    polling: PollingConfig,
}

impl AdaptiveScheduler {
    pub fn new(db: Db, polling: PollingConfig) -> Self {
        Self { db, polling }
    }

    /// The whales one tick of `tier` should hand to the fetcher.
    pub async fn whales_for_tier(&self, tier: PollingTier) -> EngineResult<Vec<Whale>> {
        let mut conn = self.db.acquire().await?;
        let followed = follows::followed_whale_ids(&mut conn).await?;
        let limit = tier.config(&self.polling).max_whales;

        let batch = match tier {
            PollingTier::Critical => whales::critical_whales(&mut conn, &followed, limit).await?,
            PollingTier::High => {
                whales::high_priority_whales(&mut conn, &followed, limit).await?
            }
            PollingTier::Normal => whales::normal_whales(&mut conn, &followed, limit).await?,
            PollingTier::Low => whales::low_priority_whales(&mut conn, &followed, limit).await?,
        };
        debug!(tier = %tier, count = batch.len(), "tier batch selected");
        Ok(batch)
    }

    /// Recompute `priority_score` for every active whale. Returns how many
    /// changed.
    pub async fn recalculate_priorities(&self) -> EngineResult<usize> {
        let mut conn = self.db.acquire().await?;
        let all = whales::active_whales(&mut conn).await?;

        let mut updated = 0usize;
        for whale in &all {
            let follower_count = follows::follower_count(&mut conn, whale.id).await?;
            let hours_since = whale
                .last_position_found
                .map(|at| (Utc::now() - at).num_seconds() as f64 / 3600.0);
            let score = priority_score(whale.exchange, follower_count, hours_since, whale.score);
            if score != whale.priority_score {
                whales::update_priority_score(&mut conn, whale.id, score).await?;
                updated += 1;
            }
        }
        info!(total = all.len(), updated, "whale priorities recalculated");
        Ok(updated)
    }

    pub async fn tier_statistics(&self) -> EngineResult<Vec<TierStats>> {
        let mut stats = Vec::with_capacity(4);
        for tier in PollingTier::all() {
            let batch = self.whales_for_tier(tier).await?;
            let config = tier.config(&self.polling);
            stats.push(TierStats {
                tier,
                count: batch.len(),
                max: config.max_whales,
                interval_seconds: config.interval_seconds,
            });
        }
        Ok(stats)
    }
}

/// Base 50, exchange bonus (Bitget +30, OKX +20, Bybit +10), follower bonus
/// (>=10 -> +15, >=5 -> +10, >=1 -> +5), recency bonus (<1 h -> +15,
/// <6 h -> +10, <24 h -> +5), ROI contribution up to +10. Clamped to [1, 100].
pub fn priority_score(
    exchange: Exchange,
    follower_count: i64,
    hours_since_activity: Option<f64>,
    roi_score: Option<Decimal>,
) -> i32 {
    let mut score = 50i32;

    score += match exchange {
        Exchange::Bitget => 30,
        Exchange::Okx => 20,
        Exchange::Bybit => 10,
        // Binance leaderboards are 40-60% private; no bonus. Hyperliquid is
        // cheap to poll but carries no visibility edge.
        Exchange::Binance | Exchange::Hyperliquid => 0,
    };

    score += if follower_count >= 10 {
        15
    } else if follower_count >= 5 {
        10
    } else if follower_count >= 1 {
        5
    } else {
        0
    };

    if let Some(hours) = hours_since_activity {
        score += if hours < 1.0 {
            15
        } else if hours < 6.0 {
            10
        } else if hours < 24.0 {
            5
        } else {
            0
        };
    }

    if let Some(roi) = roi_score {
        let contribution = (roi * Decimal::new(1, 1)).to_i32().unwrap_or(0);
        score += contribution.clamp(0, 10);
    }

    score.clamp(1, 100)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn score_adds_all_bonuses_and_caps_at_100() {
        // Bitget +30, 12 followers +15, active 30 min ago +15, ROI 100 +10:
        // 50 + 70 = 120 -> capped.
        assert_eq!(
            priority_score(Exchange::Bitget, 12, Some(0.5), Some(dec!(100))),
            100
        );
    }

    #[test]
    fn score_for_quiet_binance_whale_is_base() {
        assert_eq!(priority_score(Exchange::Binance, 0, None, None), 50);
    }

    #[test]
    fn follower_and_recency_brackets() {
        assert_eq!(priority_score(Exchange::Bybit, 5, Some(5.0), None), 80);
        assert_eq!(priority_score(Exchange::Okx, 1, Some(23.0), None), 80);
        assert_eq!(priority_score(Exchange::Binance, 0, Some(48.0), None), 50);
    }

    #[test]
    fn roi_contribution_is_clamped() {
        // ROI 55 -> +5 (55 * 0.1 rounded down).
        assert_eq!(
            priority_score(Exchange::Binance, 0, None, Some(dec!(55))),
            55
        );
        // Negative ROI contributes nothing rather than subtracting.
        assert_eq!(
            priority_score(Exchange::Binance, 0, None, Some(dec!(-40))),
            50
        );
    }
}
