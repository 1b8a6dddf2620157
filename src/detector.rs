// =============================================================================
// Signal Detector — diffs whale snapshots into normalized trade signals
// =============================================================================
//
// Rules, applied per whale against the last stored snapshot:
//   - new symbol            -> OPEN signal in the position's direction
//   - symbol gone           -> CLOSE signal (is_close)
//   - quantity up > 5% and the added notional clears the venue minimum
//                           -> ADD signal, same direction
//   - quantity down, nonzero -> PARTIAL_CLOSE signal (reduce-only)
//
// The first observation of a whale only seeds the baseline; replaying a full
// book as "opens" on startup would fire a signal storm.
//
// Idempotency: every candidate carries a dedup token (whale/symbol/kind
// folded into a 60 s time bucket for CEX, the transaction hash for DEX) that
// is claimed in the shared store before a signal is emitted.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::db::signals::NewSignal;
use crate::store::KvStore;
use crate::types::{
    SignalPriority, SignalSource, TradeSide, TradeType, TraderPosition, Whale,
};

/// Material-add threshold: quantity must grow by more than this fraction.
const ADD_THRESHOLD: Decimal = dec!(0.05);
/// DEX swaps below this USD value are noise.
const DEX_MIN_AMOUNT_USD: Decimal = dec!(10000);
/// Dedup token retention.
const DEDUP_TTL_SECONDS: u64 = 300;
/// CEX dedup tokens bucket time into windows of this many seconds.
const DEDUP_BUCKET_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Open,
    Close,
    Add,
    PartialClose,
}

impl ChangeKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::Add => "ADD",
            Self::PartialClose => "PARTIAL_CLOSE",
        }
    }
}

/// One meaningful difference between two snapshots of a whale's book.
#[derive(Debug, Clone)]
pub struct PositionChange {
    pub kind: ChangeKind,
    pub symbol: String,
    /// Position side of the whale (not the order side followers will send).
    pub side: TradeSide,
    pub trade_type: TradeType,
    pub price: Decimal,
    /// Notional affected by the change (added, removed, or full size).
    pub size_usd: Decimal,
    pub quantity: Decimal,
}

/// Pure diff of two snapshots, keyed by symbol.
pub fn diff_snapshots(
    previous: &HashMap<String, TraderPosition>,
    current: &HashMap<String, TraderPosition>,
    min_add_notional: Decimal,
) -> Vec<PositionChange> {
    let mut changes = Vec::new();

    for (symbol, position) in current {
        match previous.get(symbol) {
            None => changes.push(PositionChange {
                kind: ChangeKind::Open,
                symbol: symbol.clone(),
                side: position.side,
                trade_type: position.trade_type,
                price: position.entry_price,
                size_usd: position.size_usd,
                quantity: position.quantity,
            }),
            Some(old) => {
                if position.quantity > old.quantity {
                    let delta = position.quantity - old.quantity;
                    let threshold = old.quantity * ADD_THRESHOLD;
                    let added_notional = delta * position.entry_price;
                    if delta > threshold && added_notional >= min_add_notional {
                        changes.push(PositionChange {
                            kind: ChangeKind::Add,
                            symbol: symbol.clone(),
                            side: position.side,
                            trade_type: position.trade_type,
                            price: position.entry_price,
                            size_usd: added_notional,
                            quantity: delta,
                        });
                    }
                } else if position.quantity < old.quantity && !position.quantity.is_zero() {
                    let delta = old.quantity - position.quantity;
                    changes.push(PositionChange {
                        kind: ChangeKind::PartialClose,
                        symbol: symbol.clone(),
                        side: old.side,
                        trade_type: old.trade_type,
                        price: position.entry_price,
                        size_usd: delta * position.entry_price,
                        quantity: delta,
                    });
                }
            }
        }
    }

    for (symbol, old) in previous {
        let gone = match current.get(symbol) {
            None => true,
            Some(now) => now.quantity.is_zero(),
        };
        if gone {
            changes.push(PositionChange {
                kind: ChangeKind::Close,
                symbol: symbol.clone(),
                side: old.side,
                trade_type: old.trade_type,
                price: old.entry_price,
                size_usd: old.size_usd,
                quantity: old.quantity,
            });
        }
    }

    changes
}

/// Priority from whale standing and trade size: big money or top whales jump
/// the queue.
pub fn derive_priority(whale_priority_score: i32, size_usd: Decimal) -> SignalPriority {
    if whale_priority_score >= 70 || size_usd >= dec!(100000) {
        SignalPriority::High
    } else if whale_priority_score >= 40 || size_usd >= dec!(10000) {
        SignalPriority::Medium
    } else {
        SignalPriority::Low
    }
}

pub struct SignalDetector {
    store: Arc<dyn KvStore>,
    config: Arc<EngineConfig>,
    snapshots: RwLock<HashMap<i64, HashMap<String, TraderPosition>>>,
}

impl SignalDetector {
    pub fn new(store: Arc<dyn KvStore>, config: Arc<EngineConfig>) -> Self {
        Self {
            store,
            config,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Compare freshly fetched positions against the stored snapshot and
    /// return deduplicated signal candidates. The snapshot is replaced either
    /// way.
    pub async fn process_fetch(
        &self,
        whale: &Whale,
        positions: &[TraderPosition],
    ) -> Vec<NewSignal> {
        let current: HashMap<String, TraderPosition> = positions
            .iter()
            .map(|p| (p.symbol.clone(), p.clone()))
            .collect();

        let previous = {
            let mut snapshots = self.snapshots.write();
            snapshots.insert(whale.id, current.clone())
        };

        let Some(previous) = previous else {
            debug!(whale = %whale.name, positions = current.len(), "snapshot baseline seeded");
            return Vec::new();
        };

        let min_add = self.config.min_notional(whale.exchange, true);
        let changes = diff_snapshots(&previous, &current, min_add);
        if changes.is_empty() {
            return Vec::new();
        }

        let mut signals = Vec::new();
        for change in changes {
            let token = cex_dedup_token(whale.id, &change);
            if !self.claim_token(&token).await {
                debug!(whale = %whale.name, token, "duplicate change suppressed");
                continue;
            }

            info!(
                whale = %whale.name,
                symbol = %change.symbol,
                kind = change.kind.as_str(),
                size_usd = %change.size_usd,
                "whale activity detected"
            );
            signals.push(self.signal_from_change(whale, &change, token));
        }
        signals
    }

    /// A parsed DEX swap from the external transaction parser. Emits a signal
    /// when the swap is large enough and maps to a CEX symbol.
    pub async fn process_dex_swap(
        &self,
        whale: &Whale,
        tx_hash: &str,
        cex_symbol: Option<String>,
        side: TradeSide,
        amount_usd: Decimal,
        price: Decimal,
    ) -> Option<NewSignal> {
        let symbol = cex_symbol?;
        if amount_usd < DEX_MIN_AMOUNT_USD {
            return None;
        }
        let token = format!("sig:dex:{tx_hash}");
        if !self.claim_token(&token).await {
            return None;
        }

        Some(NewSignal {
            whale_id: whale.id,
            source: SignalSource::Whale,
            symbol,
            side,
            trade_type: TradeType::Spot,
            price,
            size_usd: amount_usd,
            is_close: false,
            reduce_only: false,
            priority: derive_priority(whale.priority_score, amount_usd),
            dedup_token: token,
        })
    }

    async fn claim_token(&self, token: &str) -> bool {
        self.store
            .set_nx_ex(token, "1", DEDUP_TTL_SECONDS)
            .await
            .unwrap_or(true)
    }

    fn signal_from_change(&self, whale: &Whale, change: &PositionChange, token: String) -> NewSignal {
        let (side, is_close, reduce_only) = match change.kind {
            ChangeKind::Open | ChangeKind::Add => (change.side, false, false),
            ChangeKind::Close => (change.side.opposite(), true, false),
            ChangeKind::PartialClose => (change.side.opposite(), false, true),
        };
        NewSignal {
            whale_id: whale.id,
            source: SignalSource::Whale,
            symbol: change.symbol.clone(),
            side,
            trade_type: change.trade_type,
            price: change.price,
            size_usd: change.size_usd,
            is_close,
            reduce_only,
            priority: derive_priority(whale.priority_score, change.size_usd),
            dedup_token: token,
        }
    }

    /// Drop a whale's snapshot (operator action after re-seeding a feed).
    pub fn forget_whale(&self, whale_id: i64) {
        self.snapshots.write().remove(&whale_id);
    }
}

fn cex_dedup_token(whale_id: i64, change: &PositionChange) -> String {
    let bucket = Utc::now().timestamp() / DEDUP_BUCKET_SECONDS;
    format!(
        "sig:{whale_id}:{}:{}:{bucket}",
        change.symbol,
        change.kind.as_str()
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(symbol: &str, side: TradeSide, qty: Decimal, entry: Decimal) -> TraderPosition {
        TraderPosition {
            symbol: symbol.to_string(),
            side,
            trade_type: if side == TradeSide::Buy {
                TradeType::FuturesLong
            } else {
                TradeType::FuturesShort
            },
            quantity: qty,
            entry_price: entry,
            size_usd: qty * entry,
            leverage: dec!(10),
        }
    }

    fn book(positions: &[TraderPosition]) -> HashMap<String, TraderPosition> {
        positions
            .iter()
            .map(|p| (p.symbol.clone(), p.clone()))
            .collect()
    }

    #[test]
    fn new_symbol_is_an_open() {
        let old = book(&[]);
        let new = book(&[pos("BTCUSDT", TradeSide::Buy, dec!(1), dec!(50000))]);

        let changes = diff_snapshots(&old, &new, dec!(5));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Open);
        assert_eq!(changes[0].size_usd, dec!(50000));
    }

    #[test]
    fn vanished_symbol_is_a_close() {
        let old = book(&[pos("ETHUSDT", TradeSide::Sell, dec!(10), dec!(3000))]);
        let new = book(&[]);

        let changes = diff_snapshots(&old, &new, dec!(5));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Close);
        assert_eq!(changes[0].side, TradeSide::Sell);
    }

    #[test]
    fn small_adds_are_ignored() {
        let old = book(&[pos("BTCUSDT", TradeSide::Buy, dec!(1), dec!(50000))]);
        // 4% increase: below the 5% threshold.
        let new = book(&[pos("BTCUSDT", TradeSide::Buy, dec!(1.04), dec!(50000))]);
        assert!(diff_snapshots(&old, &new, dec!(5)).is_empty());

        // 10% increase but added notional below the venue minimum.
        let old = book(&[pos("PEPEUSDT", TradeSide::Buy, dec!(100), dec!(0.01))]);
        let new = book(&[pos("PEPEUSDT", TradeSide::Buy, dec!(110), dec!(0.01))]);
        assert!(diff_snapshots(&old, &new, dec!(5)).is_empty());
    }

    #[test]
    fn material_add_carries_the_delta() {
        let old = book(&[pos("BTCUSDT", TradeSide::Buy, dec!(1), dec!(50000))]);
        let new = book(&[pos("BTCUSDT", TradeSide::Buy, dec!(1.5), dec!(50000))]);

        let changes = diff_snapshots(&old, &new, dec!(5));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Add);
        assert_eq!(changes[0].quantity, dec!(0.5));
        assert_eq!(changes[0].size_usd, dec!(25000));
    }

    #[test]
    fn reduction_is_a_partial_close() {
        let old = book(&[pos("BTCUSDT", TradeSide::Buy, dec!(2), dec!(50000))]);
        let new = book(&[pos("BTCUSDT", TradeSide::Buy, dec!(1.5), dec!(50000))]);

        let changes = diff_snapshots(&old, &new, dec!(5));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::PartialClose);
        assert_eq!(changes[0].quantity, dec!(0.5));
    }

    #[test]
    fn zeroed_quantity_counts_as_close() {
        let old = book(&[pos("BTCUSDT", TradeSide::Buy, dec!(2), dec!(50000))]);
        let new = book(&[pos("BTCUSDT", TradeSide::Buy, dec!(0), dec!(50000))]);

        let changes = diff_snapshots(&old, &new, dec!(5));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Close);
    }

    #[test]
    fn priority_tracks_whale_standing_and_size() {
        assert_eq!(derive_priority(80, dec!(500)), SignalPriority::High);
        assert_eq!(derive_priority(10, dec!(250000)), SignalPriority::High);
        assert_eq!(derive_priority(50, dec!(500)), SignalPriority::Medium);
        assert_eq!(derive_priority(10, dec!(20000)), SignalPriority::Medium);
        assert_eq!(derive_priority(10, dec!(500)), SignalPriority::Low);
    }
}
