// =============================================================================
// Risk Manager — the pre-trade gate every copy trade passes before Phase 1
// =============================================================================
//
// Checks, in order:
//   1. account active and not banned
//   2. balance above the trading floor
//   3. size above the global minimum and the venue's margin minimum
//   4. futures permitted by subscription tier
//   5. size within the user's max (clamp, warn)
//   6. daily loss limit not reached; remaining allowance clamps size
//   7. open-position count under the tier cap
//   8. leverage within the user's max (clamp, warn)
//
// A clamp that pushes the size below the minimum rejects the trade instead
// of silently trading dust.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::EngineConfig;
use crate::db::{positions, Db};
use crate::error::EngineResult;
use crate::types::{Exchange, UserAccount, UserSettings};

/// Outcome of the gate: either a rejection reason or the (possibly clamped)
/// size and leverage to trade with.
#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub adjusted_size: Decimal,
    pub adjusted_leverage: i32,
    pub warnings: Vec<String>,
}

impl RiskCheck {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            adjusted_size: Decimal::ZERO,
            adjusted_leverage: 1,
            warnings: Vec::new(),
        }
    }
}

/// Everything the pure gate needs, gathered by the async wrapper.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub user: &'a UserAccount,
    pub settings: Option<&'a UserSettings>,
    pub size_usdt: Decimal,
    pub is_futures: bool,
    pub leverage: i32,
    pub min_trading_balance: Decimal,
    pub min_trade_size: Decimal,
    /// Venue minimum notional for this market type (pre-buffer).
    pub exchange_min_notional: Decimal,
    pub buffer_percent: Decimal,
    pub daily_realized_loss: Decimal,
    pub open_positions: i64,
}

/// The gate itself, free of I/O.
pub fn evaluate_gate(input: &GateInput) -> RiskCheck {
    let mut warnings = Vec::new();
    let mut size = input.size_usdt;
    let mut leverage = input.leverage.max(1);

    if !input.user.is_active || input.user.is_banned {
        return RiskCheck::reject("user account is not active");
    }

    if input.user.available_balance < input.min_trading_balance {
        return RiskCheck::reject(format!(
            "balance {} below trading minimum {}",
            input.user.available_balance, input.min_trading_balance
        ));
    }

    let tier = input.user.subscription_tier.limits();
    if input.is_futures && !tier.futures_enabled {
        return RiskCheck::reject("futures trading requires a higher subscription tier");
    }

    // Leverage clamp happens before the margin minimum, which depends on it.
    if let Some(settings) = input.settings {
        if leverage > settings.max_leverage {
            warnings.push(format!("leverage reduced to max {}x", settings.max_leverage));
            leverage = settings.max_leverage.max(1);
        }
    }

    // Venue margin minimum: notional / leverage, padded for fees + slippage.
    let effective_leverage = if input.is_futures { leverage } else { 1 };
    let buffer = Decimal::ONE + input.buffer_percent / dec!(100);
    let margin_minimum = (input.exchange_min_notional / Decimal::from(effective_leverage))
        * buffer;
    let floor = input.min_trade_size.max(margin_minimum);
    if size < floor {
        return RiskCheck::reject(format!(
            "trade size {size} below minimum {floor}"
        ));
    }

    if let Some(settings) = input.settings {
        if size > settings.max_trade_size_usdt {
            warnings.push(format!(
                "trade size reduced to max limit {}",
                settings.max_trade_size_usdt
            ));
            size = settings.max_trade_size_usdt;
        }

        if input.daily_realized_loss >= settings.daily_loss_limit_usdt {
            return RiskCheck::reject(format!(
                "daily loss limit reached ({})",
                settings.daily_loss_limit_usdt
            ));
        }
        let remaining = settings.daily_loss_limit_usdt - input.daily_realized_loss;
        if size > remaining {
            warnings.push(format!("trade size reduced by daily loss allowance to {remaining}"));
            size = remaining;
        }
    }

    if input.open_positions >= i64::from(tier.max_positions) {
        return RiskCheck::reject(format!(
            "maximum open positions reached ({})",
            tier.max_positions
        ));
    }

    if input.user.available_balance < size {
        return RiskCheck::reject(format!(
            "insufficient balance: {} available, {size} required",
            input.user.available_balance
        ));
    }

    // Clamps can only shrink the size; re-check the floor.
    if size < floor {
        return RiskCheck::reject(format!("adjusted trade size {size} below minimum {floor}"));
    }

    RiskCheck {
        allowed: true,
        reason: None,
        adjusted_size: size,
        adjusted_leverage: leverage,
        warnings,
    }
}

pub struct RiskManager {
    db: Db,
    config: Arc<EngineConfig>,
}

impl RiskManager {
    pub fn new(db: Db, config: Arc<EngineConfig>) -> Self {
        Self { db, config }
    }

    /// Gather today's loss and open-position count, then run the gate.
    pub async fn check_trade(
        &self,
        user: &UserAccount,
        settings: Option<&UserSettings>,
        exchange: Exchange,
        size_usdt: Decimal,
        is_futures: bool,
        leverage: i32,
    ) -> EngineResult<RiskCheck> {
        let mut conn = self.db.acquire().await?;
        let day_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);
        let daily_loss = positions::daily_realized_loss(&mut conn, user.id, day_start).await?;
        let open_positions = positions::open_count_for_user(&mut conn, user.id).await?;

        let check = evaluate_gate(&GateInput {
            user,
            settings,
            size_usdt,
            is_futures,
            leverage,
            min_trading_balance: self.config.min_trading_balance_usdt,
            min_trade_size: self.config.min_trade_size_usdt,
            exchange_min_notional: self.config.min_notional(exchange, is_futures),
            buffer_percent: self.config.trade_size_buffer_percent,
            daily_realized_loss: daily_loss,
            open_positions,
        });

        debug!(
            user_id = user.id,
            allowed = check.allowed,
            size = %check.adjusted_size,
            reason = check.reason.as_deref().unwrap_or(""),
            "risk gate evaluated"
        );
        Ok(check)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SubscriptionTier, TradingMode};

    fn user(balance: Decimal, tier: SubscriptionTier) -> UserAccount {
        UserAccount {
            id: 1,
            is_active: true,
            is_banned: false,
            available_balance: balance,
            subscription_tier: tier,
        }
    }

    fn settings() -> UserSettings {
        UserSettings {
            user_id: 1,
            default_trade_size_usdt: Some(dec!(100)),
            trade_size_percent: None,
            max_trade_size_usdt: dec!(500),
            daily_loss_limit_usdt: dec!(200),
            stop_loss_percent: Some(dec!(5)),
            take_profit_percent: None,
            default_leverage: 5,
            max_leverage: 10,
            preferred_exchange: Exchange::Binance,
            trading_mode: TradingMode::Futures,
            sizing_strategy: None,
            kelly_fraction: None,
            notify_trade_executed: true,
        }
    }

    fn input<'a>(
        user: &'a UserAccount,
        settings: Option<&'a UserSettings>,
        size: Decimal,
    ) -> GateInput<'a> {
        GateInput {
            user,
            settings,
            size_usdt: size,
            is_futures: true,
            leverage: 5,
            min_trading_balance: dec!(10),
            min_trade_size: dec!(5),
            exchange_min_notional: dec!(5),
            buffer_percent: dec!(5),
            daily_realized_loss: Decimal::ZERO,
            open_positions: 0,
        }
    }

    #[test]
    fn banned_user_is_rejected() {
        let mut u = user(dec!(1000), SubscriptionTier::Pro);
        u.is_banned = true;
        let s = settings();
        let check = evaluate_gate(&input(&u, Some(&s), dec!(100)));
        assert!(!check.allowed);
    }

    #[test]
    fn free_tier_cannot_trade_futures() {
        let u = user(dec!(1000), SubscriptionTier::Free);
        let s = settings();
        let check = evaluate_gate(&input(&u, Some(&s), dec!(100)));
        assert!(!check.allowed);
        assert!(check.reason.as_deref().unwrap_or("").contains("tier"));
    }

    #[test]
    fn oversized_trade_is_clamped_with_warning() {
        let u = user(dec!(5000), SubscriptionTier::Pro);
        let s = settings();
        let check = evaluate_gate(&input(&u, Some(&s), dec!(900)));
        assert!(check.allowed);
        assert_eq!(check.adjusted_size, dec!(500));
        assert_eq!(check.warnings.len(), 1);
    }

    #[test]
    fn daily_loss_limit_blocks_and_clamps() {
        let u = user(dec!(5000), SubscriptionTier::Pro);
        let s = settings();

        let mut blocked = input(&u, Some(&s), dec!(100));
        blocked.daily_realized_loss = dec!(200);
        assert!(!evaluate_gate(&blocked).allowed);

        let mut clamped = input(&u, Some(&s), dec!(150));
        clamped.daily_realized_loss = dec!(120);
        let check = evaluate_gate(&clamped);
        assert!(check.allowed);
        assert_eq!(check.adjusted_size, dec!(80));
    }

    #[test]
    fn position_cap_by_tier() {
        let u = user(dec!(5000), SubscriptionTier::Pro);
        let s = settings();
        let mut i = input(&u, Some(&s), dec!(100));
        i.open_positions = 10;
        assert!(!evaluate_gate(&i).allowed);
    }

    #[test]
    fn leverage_is_clamped_before_margin_minimum() {
        let u = user(dec!(5000), SubscriptionTier::Pro);
        let s = settings();
        let mut i = input(&u, Some(&s), dec!(100));
        i.leverage = 50;
        let check = evaluate_gate(&i);
        assert!(check.allowed);
        assert_eq!(check.adjusted_leverage, 10);
        assert!(check.warnings[0].contains("leverage"));
    }

    #[test]
    fn dust_after_clamping_is_rejected() {
        let u = user(dec!(5000), SubscriptionTier::Pro);
        let mut s = settings();
        s.daily_loss_limit_usdt = dec!(101);
        let mut i = input(&u, Some(&s), dec!(100));
        i.daily_realized_loss = dec!(100);
        // Remaining allowance is 1 USDT, below the 5 USDT floor.
        let check = evaluate_gate(&i);
        assert!(!check.allowed);
    }

    #[test]
    fn insufficient_balance_is_rejected_with_amounts() {
        let u = user(dec!(50), SubscriptionTier::Pro);
        let s = settings();
        let check = evaluate_gate(&input(&u, Some(&s), dec!(100)));
        assert!(!check.allowed);
        assert!(check.reason.as_deref().unwrap_or("").contains("insufficient"));
    }
}
