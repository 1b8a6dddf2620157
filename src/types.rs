// =============================================================================
// Domain Types — whales, signals, trades, positions and their enums
// =============================================================================
//
// Every monetary figure is a `rust_decimal::Decimal`. Binary floats never
// touch prices, sizes, fees or PnL.
//
// Enum round-tripping to/from TEXT lives here (`as_str` / `parse`) and is the
// single place the persistence and adapter layers convert through.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Exchanges
// ---------------------------------------------------------------------------

/// Venues the engine understands, both for polling whales and for executing
/// follower trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
    Bitget,
    /// On-chain perps; polled for whale positions, never used for execution.
    Hyperliquid,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "BINANCE",
            Self::Bybit => "BYBIT",
            Self::Okx => "OKX",
            Self::Bitget => "BITGET",
            Self::Hyperliquid => "HYPERLIQUID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BINANCE" => Some(Self::Binance),
            "BYBIT" => Some(Self::Bybit),
            "OKX" => Some(Self::Okx),
            "BITGET" => Some(Self::Bitget),
            "HYPERLIQUID" => Some(Self::Hyperliquid),
            _ => None,
        }
    }

    /// All venues, in polling-priority order.
    pub fn all() -> [Exchange; 5] {
        [
            Self::Binance,
            Self::Bybit,
            Self::Okx,
            Self::Bitget,
            Self::Hyperliquid,
        ]
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Trade-level enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Market segment of a signal or trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeType {
    Spot,
    FuturesLong,
    FuturesShort,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "SPOT",
            Self::FuturesLong => "FUTURES_LONG",
            Self::FuturesShort => "FUTURES_SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SPOT" => Some(Self::Spot),
            "FUTURES_LONG" => Some(Self::FuturesLong),
            "FUTURES_SHORT" => Some(Self::FuturesShort),
            _ => None,
        }
    }

    pub fn is_futures(&self) -> bool {
        !matches!(self, Self::Spot)
    }
}

impl std::fmt::Display for TradeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Executing,
    Filled,
    PartiallyFilled,
    Failed,
    NeedsReconciliation,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Executing => "EXECUTING",
            Self::Filled => "FILLED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Failed => "FAILED",
            Self::NeedsReconciliation => "NEEDS_RECONCILIATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "EXECUTING" => Some(Self::Executing),
            "FILLED" => Some(Self::Filled),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FAILED" => Some(Self::Failed),
            "NEEDS_RECONCILIATION" => Some(Self::NeedsReconciliation),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::PartiallyFilled | Self::Failed)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Signal enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSource {
    Whale,
    Indicator,
    Manual,
    Bot,
    Webhook,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whale => "WHALE",
            Self::Indicator => "INDICATOR",
            Self::Manual => "MANUAL",
            Self::Bot => "BOT",
            Self::Webhook => "WEBHOOK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "WHALE" => Some(Self::Whale),
            "INDICATOR" => Some(Self::Indicator),
            "MANUAL" => Some(Self::Manual),
            "BOT" => Some(Self::Bot),
            "WEBHOOK" => Some(Self::Webhook),
            _ => None,
        }
    }
}

/// Queue ordering: High before Medium before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalPriority {
    High,
    Medium,
    Low,
}

impl SignalPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }

    /// Numeric rank used by the queue's ORDER BY (lower sorts first).
    pub fn rank(&self) -> i32 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl std::fmt::Display for SignalPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Expired,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "PROCESSED" => Some(Self::Processed),
            "FAILED" => Some(Self::Failed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Expired)
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Position enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }

    /// The order side that closes a position of this side.
    pub fn closing_side(&self) -> TradeSide {
        match self {
            Self::Long => TradeSide::Sell,
            Self::Short => TradeSide::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionType {
    Spot,
    Futures,
}

impl PositionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "SPOT",
            Self::Futures => "FUTURES",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SPOT" => Some(Self::Spot),
            "FUTURES" => Some(Self::Futures),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Liquidated => "LIQUIDATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            "LIQUIDATED" => Some(Self::Liquidated),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    WhaleExit,
    Liquidation,
    AutoClose,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::StopLoss => "STOP_LOSS",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::WhaleExit => "WHALE_EXIT",
            Self::Liquidation => "LIQUIDATION",
            Self::AutoClose => "AUTO_CLOSE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MANUAL" => Some(Self::Manual),
            "STOP_LOSS" => Some(Self::StopLoss),
            "TAKE_PROFIT" => Some(Self::TakeProfit),
            "WHALE_EXIT" => Some(Self::WhaleExit),
            "LIQUIDATION" => Some(Self::Liquidation),
            "AUTO_CLOSE" => Some(Self::AutoClose),
            _ => None,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Whale enums
// ---------------------------------------------------------------------------

/// Health of the data feed behind a whale, not of the whale's trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataStatus {
    Active,
    Stale,
    Dead,
}

impl DataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Stale => "STALE",
            Self::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(Self::Active),
            "STALE" => Some(Self::Stale),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// User-side enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionTier {
    Free,
    Pro,
    Premium,
}

/// Per-tier trading limits consulted by the risk gate.
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub futures_enabled: bool,
    pub max_positions: u32,
    pub whales_limit: u32,
    pub auto_copy: bool,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Pro => "PRO",
            Self::Premium => "PREMIUM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FREE" => Some(Self::Free),
            "PRO" => Some(Self::Pro),
            "PREMIUM" => Some(Self::Premium),
            _ => None,
        }
    }

    pub fn limits(&self) -> TierLimits {
        match self {
            Self::Free => TierLimits {
                futures_enabled: false,
                max_positions: 3,
                whales_limit: 3,
                auto_copy: false,
            },
            Self::Pro => TierLimits {
                futures_enabled: true,
                max_positions: 10,
                whales_limit: 10,
                auto_copy: true,
            },
            Self::Premium => TierLimits {
                futures_enabled: true,
                max_positions: 50,
                whales_limit: 50,
                auto_copy: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Spot,
    Futures,
    Mixed,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "SPOT",
            Self::Futures => "FUTURES",
            Self::Mixed => "MIXED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SPOT" => Some(Self::Spot),
            "FUTURES" => Some(Self::Futures),
            "MIXED" => Some(Self::Mixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingStrategy {
    Fixed,
    PercentBalance,
    Kelly,
}

impl SizingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "FIXED",
            Self::PercentBalance => "PERCENT_BALANCE",
            Self::Kelly => "KELLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FIXED" => Some(Self::Fixed),
            "PERCENT_BALANCE" => Some(Self::PercentBalance),
            "KELLY" => Some(Self::Kelly),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// A tracked account whose trades the engine imitates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Whale {
    pub id: i64,
    pub name: String,
    pub exchange: Exchange,
    /// Leaderboard UID on CEX venues, wallet address on Hyperliquid.
    pub exchange_uid: String,
    pub is_active: bool,
    pub data_status: DataStatus,
    /// 1..=100, recomputed periodically by the scheduler.
    pub priority_score: i32,
    /// ROI score 0..=100 from whale statistics, feeds the priority score.
    pub score: Option<Decimal>,
    /// Win rate in percent (0..=100), feeds Kelly sizing.
    pub win_rate: Option<Decimal>,
    /// Average profit percent per winning trade, feeds Kelly sizing.
    pub avg_profit_percent: Option<Decimal>,
    pub last_position_found: Option<DateTime<Utc>>,
    /// All-failed polling cycles in a row; drives STALE/DEAD decay.
    pub consecutive_empty_polls: i32,
}

/// A normalized whale action awaiting copy execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub whale_id: i64,
    pub source: SignalSource,
    pub symbol: String,
    pub side: TradeSide,
    pub trade_type: TradeType,
    pub price: Decimal,
    pub size_usd: Decimal,
    /// Whale exited the symbol entirely; followers close instead of open.
    pub is_close: bool,
    /// Whale reduced but kept the position; follower orders are reduce-only.
    pub reduce_only: bool,
    pub priority: SignalPriority,
    pub status: SignalStatus,
    /// Idempotency token: `whale:symbol:kind:bucket` for CEX, tx hash for DEX.
    pub dedup_token: String,
    pub detected_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub trades_executed: i32,
    pub error_message: Option<String>,
    /// Optimistic lock for queue pickup.
    pub version: i32,
}

impl Signal {
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.detected_at).num_seconds()
    }

    pub fn is_expired(&self, now: DateTime<Utc>, expiry_seconds: i64) -> bool {
        self.age_seconds(now) > expiry_seconds
    }
}

/// A single follower order sent (or about to be sent) to an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub user_id: i64,
    /// None for manual trades without a driving signal.
    pub signal_id: Option<i64>,
    pub whale_id: Option<i64>,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: TradeSide,
    pub trade_type: TradeType,
    /// Reserved margin in USDT, deducted from the user's available balance.
    pub size_usdt: Decimal,
    pub quantity: Decimal,
    pub leverage: i32,
    pub status: TradeStatus,
    /// Set exactly when the exchange call was dispatched.
    pub exchange_order_id: Option<String>,
    pub executed_price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub fee_amount: Decimal,
    pub fee_currency: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Optimistic lock.
    pub version: i32,
}

/// A follower's open or closed exposure, scoped to the whale that caused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub user_id: i64,
    /// Source whale; positions from different whales never merge.
    pub whale_id: Option<i64>,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: PositionSide,
    pub position_type: PositionType,
    pub quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub entry_value_usdt: Decimal,
    pub current_value_usdt: Decimal,
    pub leverage: i32,
    pub liquidation_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_percent: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub entry_trade_id: i64,
    pub exit_trade_id: Option<i64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// A user's follow of a whale, with per-whale copy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleFollow {
    pub id: i64,
    pub user_id: i64,
    pub whale_id: i64,
    pub auto_copy_enabled: bool,
    pub notify_on_trade: bool,
    pub trade_size_usdt: Option<Decimal>,
    pub trade_size_percent: Option<Decimal>,
    pub max_trade_size_usdt: Option<Decimal>,
    pub trading_mode_override: Option<TradingMode>,
    pub sizing_strategy_override: Option<SizingStrategy>,
    pub kelly_fraction_override: Option<Decimal>,
    pub trades_copied: i32,
}

/// Trading-relevant projection of a user row. The engine writes only
/// `available_balance`, and only under a row lock during Phase 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    pub is_active: bool,
    pub is_banned: bool,
    pub available_balance: Decimal,
    pub subscription_tier: SubscriptionTier,
}

/// User-level trading preferences, read-mostly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: i64,
    pub default_trade_size_usdt: Option<Decimal>,
    pub trade_size_percent: Option<Decimal>,
    pub max_trade_size_usdt: Decimal,
    pub daily_loss_limit_usdt: Decimal,
    pub stop_loss_percent: Option<Decimal>,
    pub take_profit_percent: Option<Decimal>,
    pub default_leverage: i32,
    pub max_leverage: i32,
    pub preferred_exchange: Exchange,
    pub trading_mode: TradingMode,
    pub sizing_strategy: Option<SizingStrategy>,
    pub kelly_fraction: Option<Decimal>,
    pub notify_trade_executed: bool,
}

// ---------------------------------------------------------------------------
// Fetched whale state
// ---------------------------------------------------------------------------

/// One open position observed on a whale's account, as fetched from a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderPosition {
    pub symbol: String,
    pub side: TradeSide,
    pub trade_type: TradeType,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub size_usd: Decimal,
    pub leverage: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_text_round_trips() {
        for status in [
            TradeStatus::Pending,
            TradeStatus::Executing,
            TradeStatus::Filled,
            TradeStatus::PartiallyFilled,
            TradeStatus::Failed,
            TradeStatus::NeedsReconciliation,
        ] {
            assert_eq!(TradeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(Exchange::parse("binance"), Some(Exchange::Binance));
        assert_eq!(Exchange::parse("SOLEX"), None);
    }

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(SignalPriority::High.rank() < SignalPriority::Medium.rank());
        assert!(SignalPriority::Medium.rank() < SignalPriority::Low.rank());
    }

    #[test]
    fn closing_side_inverts_position_side() {
        assert_eq!(PositionSide::Long.closing_side(), TradeSide::Sell);
        assert_eq!(PositionSide::Short.closing_side(), TradeSide::Buy);
    }

    #[test]
    fn free_tier_blocks_futures() {
        assert!(!SubscriptionTier::Free.limits().futures_enabled);
        assert!(SubscriptionTier::Pro.limits().futures_enabled);
    }
}
