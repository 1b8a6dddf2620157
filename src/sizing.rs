// =============================================================================
// Position Sizing — FIXED, PERCENT_BALANCE and KELLY strategies
// =============================================================================
//
// Strategy selection: per-whale override, then user default, then FIXED.
// A strategy with no configured inputs aborts with "no sizing configured";
// this engine never invents a size for someone else's money.
//
// Kelly: f = (W - (1 - W) / R) * kelly_fraction
//   W = whale win rate, clamped to [0.1, 0.9]
//   R = win/loss ratio derived from avg profit, clamped to [0.5, 3.0]
//   kelly_fraction in [0.1, 1.0], default 0.5 (half Kelly)
// Non-positive f falls back to the minimum; f is capped at 0.25 before it
// meets the balance.
// =============================================================================

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::{SizingStrategy, UserSettings, Whale, WhaleFollow};

const MIN_PERCENT: Decimal = dec!(0.5);
const MAX_PERCENT: Decimal = dec!(25);
const MIN_KELLY_FRACTION: Decimal = dec!(0.1);
const MAX_KELLY_FRACTION: Decimal = dec!(1.0);
const DEFAULT_KELLY_FRACTION: Decimal = dec!(0.5);
const KELLY_CAP: Decimal = dec!(0.25);

const DEFAULT_WIN_RATE: Decimal = dec!(0.55);
const DEFAULT_WIN_LOSS_RATIO: Decimal = dec!(1.2);

/// Bounds applied after every strategy.
#[derive(Debug, Clone, Copy)]
pub struct SizingBounds {
    pub min_trade_size: Decimal,
    pub max_trade_size: Decimal,
}

/// Pick the strategy: per-whale override wins, then user settings, then FIXED.
fn select_strategy(follow: &WhaleFollow, settings: Option<&UserSettings>) -> SizingStrategy {
    follow
        .sizing_strategy_override
        .or_else(|| settings.and_then(|s| s.sizing_strategy))
        .unwrap_or(SizingStrategy::Fixed)
}

/// Compute the trade size in USDT for one follower of one signal.
pub fn calculate_size(
    follow: &WhaleFollow,
    settings: Option<&UserSettings>,
    whale: &Whale,
    available_balance: Decimal,
    bounds: SizingBounds,
) -> EngineResult<Decimal> {
    let strategy = select_strategy(follow, settings);

    let raw = match strategy {
        SizingStrategy::Fixed => fixed_size(follow, settings)?,
        SizingStrategy::PercentBalance => percent_size(follow, settings, available_balance)?,
        SizingStrategy::Kelly => kelly_size(follow, settings, whale, available_balance, bounds),
    };

    let mut size = raw;

    // Per-whale and user-level maximums.
    if let Some(max) = follow.max_trade_size_usdt {
        size = size.min(max);
    }
    if let Some(settings) = settings {
        size = size.min(settings.max_trade_size_usdt);
    }

    // Global bounds and the balance itself.
    size = size
        .min(bounds.max_trade_size)
        .min(available_balance)
        .max(Decimal::ZERO);

    let size = size.round_dp(2);
    debug!(
        strategy = strategy.as_str(),
        whale = %whale.name,
        raw = %raw,
        size = %size,
        "trade size calculated"
    );

    if size < bounds.min_trade_size {
        return Err(EngineError::Validation(format!(
            "trade size {size} below minimum {} after bounds",
            bounds.min_trade_size
        )));
    }
    Ok(size)
}

fn fixed_size(
    follow: &WhaleFollow,
    settings: Option<&UserSettings>,
) -> EngineResult<Decimal> {
    follow
        .trade_size_usdt
        .or_else(|| settings.and_then(|s| s.default_trade_size_usdt))
        .ok_or_else(|| EngineError::Validation("no sizing configured".into()))
}

fn percent_size(
    follow: &WhaleFollow,
    settings: Option<&UserSettings>,
    available_balance: Decimal,
) -> EngineResult<Decimal> {
    let percent = follow
        .trade_size_percent
        .or_else(|| settings.and_then(|s| s.trade_size_percent))
        .ok_or_else(|| EngineError::Validation("no sizing configured".into()))?;
    let percent = percent.clamp(MIN_PERCENT, MAX_PERCENT);
    Ok(available_balance * percent / dec!(100))
}

fn kelly_size(
    follow: &WhaleFollow,
    settings: Option<&UserSettings>,
    whale: &Whale,
    available_balance: Decimal,
    bounds: SizingBounds,
) -> Decimal {
    let fraction = follow
        .kelly_fraction_override
        .or_else(|| settings.and_then(|s| s.kelly_fraction))
        .unwrap_or(DEFAULT_KELLY_FRACTION)
        .clamp(MIN_KELLY_FRACTION, MAX_KELLY_FRACTION);

    let win_rate = whale
        .win_rate
        .map(|w| w / dec!(100))
        .unwrap_or(DEFAULT_WIN_RATE)
        .clamp(dec!(0.1), dec!(0.9));

    let ratio = whale
        .avg_profit_percent
        .map(|p| Decimal::ONE + p / dec!(10))
        .unwrap_or(DEFAULT_WIN_LOSS_RATIO)
        .clamp(dec!(0.5), dec!(3.0));

    let kelly = (win_rate - (Decimal::ONE - win_rate) / ratio) * fraction;
    if kelly <= Decimal::ZERO {
        // No measured edge: trade the minimum, not zero.
        debug!(whale = %whale.name, "kelly non-positive, using minimum size");
        return bounds.min_trade_size;
    }

    available_balance * kelly.min(KELLY_CAP)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataStatus, Exchange, TradingMode};

    fn follow() -> WhaleFollow {
        WhaleFollow {
            id: 1,
            user_id: 1,
            whale_id: 7,
            auto_copy_enabled: true,
            notify_on_trade: true,
            trade_size_usdt: None,
            trade_size_percent: None,
            max_trade_size_usdt: None,
            trading_mode_override: None,
            sizing_strategy_override: None,
            kelly_fraction_override: None,
            trades_copied: 0,
        }
    }

    fn whale() -> Whale {
        Whale {
            id: 7,
            name: "poseidon".into(),
            exchange: Exchange::Bitget,
            exchange_uid: "u1".into(),
            is_active: true,
            data_status: DataStatus::Active,
            priority_score: 80,
            score: None,
            win_rate: None,
            avg_profit_percent: None,
            last_position_found: None,
            consecutive_empty_polls: 0,
        }
    }

    fn settings() -> UserSettings {
        UserSettings {
            user_id: 1,
            default_trade_size_usdt: None,
            trade_size_percent: None,
            max_trade_size_usdt: dec!(10000),
            daily_loss_limit_usdt: dec!(1000),
            stop_loss_percent: None,
            take_profit_percent: None,
            default_leverage: 5,
            max_leverage: 20,
            preferred_exchange: Exchange::Binance,
            trading_mode: TradingMode::Futures,
            sizing_strategy: None,
            kelly_fraction: None,
            notify_trade_executed: true,
        }
    }

    fn bounds() -> SizingBounds {
        SizingBounds {
            min_trade_size: dec!(5),
            max_trade_size: dec!(10000),
        }
    }

    #[test]
    fn unconfigured_sizing_is_an_error_not_a_default() {
        let result = calculate_size(&follow(), None, &whale(), dec!(1000), bounds());
        match result {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("no sizing configured")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn fixed_prefers_follow_over_settings() {
        let mut f = follow();
        f.trade_size_usdt = Some(dec!(50));
        let mut s = settings();
        s.default_trade_size_usdt = Some(dec!(25));

        let size = calculate_size(&f, Some(&s), &whale(), dec!(1000), bounds()).unwrap();
        assert_eq!(size, dec!(50));
    }

    #[test]
    fn percent_is_clamped_to_range() {
        let mut f = follow();
        f.sizing_strategy_override = Some(SizingStrategy::PercentBalance);
        f.trade_size_percent = Some(dec!(40));

        // 40% clamps to 25% of 1000.
        let size = calculate_size(&f, Some(&settings()), &whale(), dec!(1000), bounds()).unwrap();
        assert_eq!(size, dec!(250));
    }

    #[test]
    fn kelly_matches_the_reference_figures() {
        let mut f = follow();
        f.sizing_strategy_override = Some(SizingStrategy::Kelly);
        f.kelly_fraction_override = Some(dec!(0.5));
        let mut w = whale();
        // W = 0.6, R = 1.5 (avg profit 5 -> 1 + 0.5).
        w.win_rate = Some(dec!(60));
        w.avg_profit_percent = Some(dec!(5));

        let size = calculate_size(&f, Some(&settings()), &w, dec!(10000), bounds()).unwrap();
        // 0.5 * (0.6 - 0.4 / 1.5) * 10000 = 1666.67.
        assert_eq!(size, dec!(1666.67));
    }

    #[test]
    fn kelly_without_edge_uses_minimum() {
        let mut f = follow();
        f.sizing_strategy_override = Some(SizingStrategy::Kelly);
        let mut w = whale();
        // W = 0.1 with R = 0.5: f is negative.
        w.win_rate = Some(dec!(10));
        w.avg_profit_percent = Some(dec!(-20));

        let size = calculate_size(&f, Some(&settings()), &w, dec!(10000), bounds()).unwrap();
        assert_eq!(size, dec!(5));
    }

    #[test]
    fn kelly_is_capped_at_a_quarter_of_balance() {
        let mut f = follow();
        f.sizing_strategy_override = Some(SizingStrategy::Kelly);
        f.kelly_fraction_override = Some(dec!(1.0));
        let mut w = whale();
        w.win_rate = Some(dec!(90));
        w.avg_profit_percent = Some(dec!(30));

        let size = calculate_size(&f, Some(&settings()), &w, dec!(10000), bounds()).unwrap();
        assert_eq!(size, dec!(2500));
    }

    #[test]
    fn size_never_exceeds_balance() {
        let mut f = follow();
        f.trade_size_usdt = Some(dec!(500));

        let size = calculate_size(&f, Some(&settings()), &whale(), dec!(120), bounds()).unwrap();
        assert_eq!(size, dec!(120));
    }
}
