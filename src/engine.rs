// =============================================================================
// Copy-Trade Engine — per-follower two-phase-commit trade execution
// =============================================================================
//
// For every PROCESSING signal the engine resolves followers and runs each one
// through the strict protocol:
//
//   PHASE 1 (RESERVE):  lock user row -> re-verify balance -> insert PENDING
//                       trade -> deduct balance -> COMMIT
//   EXCHANGE CALL:      mark EXECUTING -> breaker check -> market order
//   PHASE 2A (CONFIRM): apply fill -> merge/create position -> bump follow
//                       stats -> COMMIT -> publish events
//   PHASE 2B (ROLLBACK): mark FAILED -> restore balance -> COMMIT
//   PHASE 2C (RECONCILE): anything undecidable after the exchange call flips
//                       the trade to NEEDS_RECONCILIATION in a fresh
//                       transaction for the reconciliation worker
//
// Position merge is scoped to (user_id, symbol, whale_id): two whales in the
// same symbol never share a position.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::breaker::BreakerRegistry;
use crate::config::EngineConfig;
use crate::db::follows::ResolvedFollower;
use crate::db::trades::{NewTrade, TradeFill};
use crate::db::{follows, positions, trades, users, whales, Db};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::exchanges::{
    build_executor, guarded_call, normalize_symbol, Credentials, ExchangePort, OrderResult,
};
use crate::position_engine::CloseRequest;
use crate::ratelimit::RateLimitManager;
use crate::risk::RiskManager;
use crate::sizing::{calculate_size, SizingBounds};
use crate::types::{
    CloseReason, Exchange, PositionSide, PositionType, Signal, SubscriptionTier, TradeSide,
    TradeType, TradingMode, UserSettings, WhaleFollow,
};

/// Outcome of one follower's copy attempt.
#[derive(Debug, Clone, Serialize)]
pub struct CopyTradeResult {
    pub user_id: i64,
    pub success: bool,
    pub trade_id: Option<i64>,
    pub position_id: Option<i64>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl CopyTradeResult {
    fn failure(user_id: i64, error: impl Into<String>) -> Self {
        Self {
            user_id,
            success: false,
            trade_id: None,
            position_id: None,
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }
}

/// Manual-copy overrides from the ops surface.
#[derive(Debug, Clone, Default)]
pub struct CopyOverrides {
    pub size_usdt: Option<Decimal>,
    pub exchange: Option<Exchange>,
}

pub struct CopyTradeEngine {
    db: Db,
    config: Arc<EngineConfig>,
    breakers: Arc<BreakerRegistry>,
    rate_limits: Arc<RateLimitManager>,
    risk: RiskManager,
    events: Arc<EventBus>,
    close_tx: mpsc::Sender<CloseRequest>,
}

impl CopyTradeEngine {
    pub fn new(
        db: Db,
        config: Arc<EngineConfig>,
        breakers: Arc<BreakerRegistry>,
        rate_limits: Arc<RateLimitManager>,
        events: Arc<EventBus>,
        close_tx: mpsc::Sender<CloseRequest>,
    ) -> Self {
        let risk = RiskManager::new(db.clone(), config.clone());
        Self {
            db,
            config,
            breakers,
            rate_limits,
            risk,
            events,
            close_tx,
        }
    }

    // -------------------------------------------------------------------------
    // Signal processing
    // -------------------------------------------------------------------------

    /// Execute a claimed (PROCESSING) signal for every resolved follower.
    /// Returns one result per follower; the caller finalises the signal.
    pub async fn process_signal(&self, signal: &Signal) -> EngineResult<Vec<CopyTradeResult>> {
        // Full exits and partial reductions both act on existing positions,
        // never open new ones.
        if signal.is_close || signal.reduce_only {
            return self.handle_close_signal(signal).await;
        }

        let followers = {
            let mut conn = self.db.acquire().await?;
            follows::auto_copy_followers(&mut conn, signal.whale_id).await?
        };
        // Auto-copy is itself tier-gated; manual copy is not.
        let followers: Vec<ResolvedFollower> = followers
            .into_iter()
            .filter(|f| f.user.subscription_tier.limits().auto_copy)
            .collect();
        if followers.is_empty() {
            info!(signal_id = signal.id, whale_id = signal.whale_id, "no followers to copy");
            return Ok(Vec::new());
        }

        info!(
            signal_id = signal.id,
            followers = followers.len(),
            symbol = %signal.symbol,
            side = %signal.side,
            "processing signal"
        );

        // Followers are independent; execute them concurrently. The per-user
        // row lock serialises any same-user overlap.
        let overrides = CopyOverrides::default();
        let results = join_all(
            followers
                .iter()
                .map(|follower| self.copy_for_follower(signal, follower, &overrides)),
        )
        .await;
        Ok(results)
    }

    /// Manual copy: one user, overrides allowed, auto_copy_enabled ignored.
    pub async fn manual_copy(
        &self,
        signal_id: i64,
        user_id: i64,
        overrides: CopyOverrides,
    ) -> EngineResult<CopyTradeResult> {
        let mut conn = self.db.acquire().await?;
        let signal = crate::db::signals::get(&mut conn, signal_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("signal {signal_id} not found")))?;

        let Some(user) = users::get(&mut conn, user_id).await? else {
            return Ok(CopyTradeResult::failure(user_id, "user not found"));
        };
        if !user.is_active || user.is_banned {
            return Ok(CopyTradeResult::failure(user_id, "user account is not active"));
        }
        let settings = users::get_settings(&mut conn, user_id).await?;
        let follow = follows::find(&mut conn, user_id, signal.whale_id)
            .await?
            .unwrap_or_else(|| synthetic_follow(user_id, signal.whale_id));
        drop(conn);

        let follower = ResolvedFollower {
            follow,
            user,
            settings,
        };
        Ok(self.copy_for_follower(&signal, &follower, &overrides).await)
    }

    /// Close signals bypass sizing and risk entirely: every matching OPEN
    /// position is queued for a reduce-only close.
    async fn handle_close_signal(&self, signal: &Signal) -> EngineResult<Vec<CopyTradeResult>> {
        let mut conn = self.db.acquire().await?;
        let open =
            positions::open_for_whale_symbol(&mut conn, signal.whale_id, &signal.symbol).await?;
        drop(conn);

        if open.is_empty() {
            info!(
                signal_id = signal.id,
                whale_id = signal.whale_id,
                symbol = %signal.symbol,
                "whale exit with no follower positions"
            );
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(open.len());
        for position in open {
            let request = CloseRequest {
                user_id: position.user_id,
                position_id: position.id,
                reason: CloseReason::WhaleExit,
                quantity: if signal.reduce_only {
                    Some(position.remaining_quantity.min(quantity_hint(signal)))
                } else {
                    None
                },
            };
            match self.close_tx.send(request).await {
                Ok(()) => {
                    info!(
                        user_id = position.user_id,
                        position_id = position.id,
                        symbol = %signal.symbol,
                        "whale exit close queued"
                    );
                    results.push(CopyTradeResult {
                        user_id: position.user_id,
                        success: true,
                        trade_id: None,
                        position_id: Some(position.id),
                        error: None,
                        warnings: Vec::new(),
                    });
                }
                Err(_) => {
                    results.push(CopyTradeResult::failure(
                        position.user_id,
                        "close worker unavailable",
                    ));
                }
            }
        }
        Ok(results)
    }

    // -------------------------------------------------------------------------
    // Per-follower execution
    // -------------------------------------------------------------------------

    async fn copy_for_follower(
        &self,
        signal: &Signal,
        follower: &ResolvedFollower,
        overrides: &CopyOverrides,
    ) -> CopyTradeResult {
        match self.try_copy(signal, follower, overrides).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    user_id = follower.user.id,
                    signal_id = signal.id,
                    error = %e,
                    "copy trade failed"
                );
                CopyTradeResult::failure(follower.user.id, e.message_for_db())
            }
        }
    }

    async fn try_copy(
        &self,
        signal: &Signal,
        follower: &ResolvedFollower,
        overrides: &CopyOverrides,
    ) -> EngineResult<CopyTradeResult> {
        let user = &follower.user;
        let settings = follower.settings.as_ref();

        let whale = {
            let mut conn = self.db.acquire().await?;
            whales::get(&mut conn, signal.whale_id).await?
        }
        .ok_or_else(|| EngineError::Validation(format!("whale {} not found", signal.whale_id)))?;

        let is_futures = should_use_futures(&follower.follow, settings, user.subscription_tier);
        let leverage = if is_futures {
            settings.map(|s| s.default_leverage).unwrap_or(1).max(1)
        } else {
            1
        };

        // Sizing: explicit override, else the configured strategy.
        let size = match overrides.size_usdt {
            Some(size) => size,
            None => calculate_size(
                &follower.follow,
                settings,
                &whale,
                user.available_balance,
                SizingBounds {
                    min_trade_size: self.config.min_trade_size_usdt,
                    max_trade_size: self.config.max_trade_size_usdt,
                },
            )?,
        };

        let exchange = overrides
            .exchange
            .or(settings.map(|s| s.preferred_exchange))
            .unwrap_or(Exchange::Binance);

        // Risk gate.
        let check = self
            .risk
            .check_trade(user, settings, exchange, size, is_futures, leverage)
            .await?;
        if !check.allowed {
            return Ok(CopyTradeResult::failure(
                user.id,
                check.reason.unwrap_or_else(|| "risk check failed".into()),
            ));
        }
        let size = check.adjusted_size;
        let leverage = check.adjusted_leverage;

        // Exchange session. Initialisation failures happen before Phase 1, so
        // nothing needs rolling back.
        let credentials = {
            let mut conn = self.db.acquire().await?;
            users::get_api_credentials(&mut conn, user.id, exchange).await?
        }
        .ok_or_else(|| {
            EngineError::Validation(format!("no API key configured for {exchange}"))
        })?;
        let executor = build_executor(exchange, credentials)?;
        let result = self
            .execute_with_session(signal, follower, &*executor, exchange, size, leverage, is_futures, check.warnings)
            .await;
        let _ = executor.close().await;
        result
    }

    /// Everything that happens with a live exchange session; `close` is
    /// guaranteed by the caller.
    #[allow(clippy::too_many_arguments)]
    async fn execute_with_session(
        &self,
        signal: &Signal,
        follower: &ResolvedFollower,
        executor: &dyn ExchangePort,
        exchange: Exchange,
        size: Decimal,
        leverage: i32,
        is_futures: bool,
        warnings: Vec<String>,
    ) -> EngineResult<CopyTradeResult> {
        let user = &follower.user;
        let breaker = self.breakers.breaker(exchange.as_str());

        // Symbol normalization and pricing come before the reservation so a
        // bad symbol never locks funds.
        let symbol = normalize_symbol(&signal.symbol);
        let price = guarded_call(&breaker, &self.rate_limits, exchange, || {
            executor.get_ticker_price(&symbol)
        })
        .await?;
        if price.is_zero() {
            return Err(EngineError::Exchange(format!("zero price for {symbol}")));
        }

        let quantity = executor
            .round_quantity(&symbol, size / price, is_futures)
            .await?;

        // ================= PHASE 1: RESERVE =================
        let trade_id = self
            .phase1_reserve(signal, follower, exchange, &symbol, size, quantity, leverage, is_futures)
            .await?;

        // ================= EXCHANGE CALL ====================
        {
            let mut conn = self.db.acquire().await?;
            trades::set_status(&mut conn, trade_id, crate::types::TradeStatus::Executing).await?;
        }

        // Fast-fail on an open circuit, releasing the reservation cleanly.
        if let Err(e) = breaker.guard().await {
            self.rollback_reservation(trade_id, user.id, size, &e.to_string())
                .await?;
            return Ok(CopyTradeResult::failure(user.id, e.message_for_db()));
        }

        if is_futures {
            if let Err(e) = guarded_call(&breaker, &self.rate_limits, exchange, || {
                executor.set_leverage(&symbol, leverage as u32)
            })
            .await
            {
                self.rollback_reservation(trade_id, user.id, size, &e.to_string())
                    .await?;
                self.events.publish(EngineEvent::TradeFailed {
                    at: Utc::now(),
                    trade_id,
                    user_id: user.id,
                    symbol: symbol.clone(),
                    error: e.to_string(),
                });
                return Ok(CopyTradeResult::failure(user.id, e.message_for_db()));
            }
        }

        let order = guarded_call(&breaker, &self.rate_limits, exchange, || {
            dispatch_market_order(executor, signal.side, is_futures, &symbol, quantity)
        })
        .await;

        let order = match order {
            Ok(order) => order,
            Err(EngineError::Timeout(msg)) => {
                // The order may have reached the venue; only reconciliation
                // can decide.
                self.mark_for_reconciliation(trade_id, user.id, &msg, None).await;
                return Ok(CopyTradeResult::failure(
                    user.id,
                    format!("timeout after dispatch: {msg}"),
                ));
            }
            Err(e) => {
                // ============ PHASE 2B: ROLLBACK ============
                self.rollback_reservation(trade_id, user.id, size, &e.message_for_db())
                    .await?;
                self.events.publish(EngineEvent::TradeFailed {
                    at: Utc::now(),
                    trade_id,
                    user_id: user.id,
                    symbol: symbol.clone(),
                    error: e.to_string(),
                });
                return Ok(CopyTradeResult::failure(user.id, e.message_for_db()));
            }
        };

        // ================= PHASE 2A: CONFIRM =================
        match self
            .phase2_confirm(
                signal, follower, trade_id, exchange, &symbol, size, leverage, is_futures, &order,
            )
            .await
        {
            Ok(position_id) => {
                let executed_price = order.avg_fill_price.unwrap_or(price);
                info!(
                    trade_id,
                    user_id = user.id,
                    symbol = %symbol,
                    filled = %order.filled_quantity,
                    price = %executed_price,
                    "copy trade filled"
                );
                self.events.publish(EngineEvent::TradeExecuted {
                    at: Utc::now(),
                    trade_id,
                    user_id: user.id,
                    exchange,
                    symbol: symbol.clone(),
                    side: signal.side,
                    filled_quantity: order.filled_quantity,
                    executed_price,
                    size_usdt: size,
                });
                Ok(CopyTradeResult {
                    user_id: user.id,
                    success: true,
                    trade_id: Some(trade_id),
                    position_id: Some(position_id),
                    error: None,
                    warnings,
                })
            }
            Err(e) => {
                // ============ PHASE 2C: RECONCILIATION ============
                error!(
                    trade_id,
                    user_id = user.id,
                    error = %e,
                    "confirm failed after exchange success"
                );
                self.mark_for_reconciliation(
                    trade_id,
                    user.id,
                    &format!("confirm failed: {e}"),
                    Some(&order.order_id),
                )
                .await;
                Ok(CopyTradeResult::failure(
                    user.id,
                    "trade executed but finalisation deferred to reconciliation",
                ))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Phases
    // -------------------------------------------------------------------------

    /// Lock the user row, re-verify affordability, insert the PENDING trade
    /// and deduct the reservation, all in one transaction.
    #[allow(clippy::too_many_arguments)]
    async fn phase1_reserve(
        &self,
        signal: &Signal,
        follower: &ResolvedFollower,
        exchange: Exchange,
        symbol: &str,
        size: Decimal,
        quantity: Decimal,
        leverage: i32,
        is_futures: bool,
    ) -> EngineResult<i64> {
        let mut tx = self.db.begin().await?;

        let locked = users::lock_for_update(&mut tx, follower.user.id)
            .await?
            .ok_or_else(|| EngineError::Validation("user not found".into()))?;
        if locked.available_balance < size {
            return Err(EngineError::InsufficientBalance {
                available: locked.available_balance,
                required: size,
            });
        }

        let trade_id = trades::insert(
            &mut tx,
            &NewTrade {
                user_id: follower.user.id,
                signal_id: Some(signal.id),
                whale_id: Some(signal.whale_id),
                exchange,
                symbol: symbol.to_string(),
                side: signal.side,
                trade_type: trade_type_for(signal.side, is_futures),
                size_usdt: size,
                quantity,
                leverage,
            },
        )
        .await?;
        users::adjust_balance(&mut tx, follower.user.id, -size).await?;

        tx.commit().await?;
        info!(
            trade_id,
            user_id = follower.user.id,
            size = %size,
            "phase 1 complete, reservation durable"
        );
        Ok(trade_id)
    }

    /// Apply the fill, merge or create the position and bump follow stats in
    /// one transaction.
    #[allow(clippy::too_many_arguments)]
    async fn phase2_confirm(
        &self,
        signal: &Signal,
        follower: &ResolvedFollower,
        trade_id: i64,
        exchange: Exchange,
        symbol: &str,
        size: Decimal,
        leverage: i32,
        is_futures: bool,
        order: &OrderResult,
    ) -> EngineResult<i64> {
        let executed_price = order.avg_fill_price.ok_or_else(|| {
            EngineError::Inconsistent(format!("order {} has no fill price", order.order_id))
        })?;
        let filled = order.filled_quantity;
        if filled.is_zero() {
            return Err(EngineError::Inconsistent(format!(
                "order {} reported zero filled quantity",
                order.order_id
            )));
        }

        let mut tx = self.db.begin().await?;

        trades::confirm_fill(
            &mut tx,
            trade_id,
            &TradeFill {
                exchange_order_id: order.order_id.clone(),
                executed_price,
                filled_quantity: filled,
                fee_amount: order.fee,
                fee_currency: order.fee_currency.clone(),
                fully_filled: order.is_filled(),
            },
        )
        .await?;

        let side = position_side_for(signal.side);
        let existing = positions::find_open_for_merge(
            &mut tx,
            follower.user.id,
            symbol,
            Some(signal.whale_id),
        )
        .await?;
        let opened_new = existing.is_none();

        let position_id = match existing {
            Some(position) => {
                // Weighted-average entry across the old and new fills.
                let total_value =
                    position.entry_price * position.quantity + executed_price * filled;
                let new_quantity = position.quantity + filled;
                let new_entry = total_value / new_quantity;
                positions::merge_fill(
                    &mut tx,
                    position.id,
                    new_entry,
                    new_quantity,
                    position.remaining_quantity + filled,
                    executed_price,
                    size,
                    new_quantity * executed_price,
                )
                .await?;
                position.id
            }
            None => {
                let settings = follower.settings.as_ref();
                let stop_loss_price = settings.and_then(|s| {
                    s.stop_loss_percent
                        .map(|pct| stop_price(executed_price, side, pct, true))
                });
                let take_profit_price = settings.and_then(|s| {
                    s.take_profit_percent
                        .map(|pct| stop_price(executed_price, side, pct, false))
                });
                positions::insert(
                    &mut tx,
                    &positions::NewPosition {
                        user_id: follower.user.id,
                        whale_id: Some(signal.whale_id),
                        exchange,
                        symbol: symbol.to_string(),
                        side,
                        position_type: if is_futures {
                            PositionType::Futures
                        } else {
                            PositionType::Spot
                        },
                        quantity: filled,
                        entry_price: executed_price,
                        entry_value_usdt: size,
                        leverage,
                        liquidation_price: if is_futures {
                            Some(approx_liquidation_price(executed_price, side, leverage))
                        } else {
                            None
                        },
                        stop_loss_price,
                        take_profit_price,
                        entry_trade_id: trade_id,
                    },
                )
                .await?
            }
        };

        follows::increment_trades_copied(&mut tx, follower.follow.id).await?;
        tx.commit().await?;

        if opened_new {
            self.events.publish(EngineEvent::PositionOpened {
                at: Utc::now(),
                position_id,
                user_id: follower.user.id,
                whale_id: Some(signal.whale_id),
                symbol: symbol.to_string(),
                entry_price: executed_price,
                quantity: filled,
            });
        }
        Ok(position_id)
    }

    /// Phase 2B: terminal failure plus balance restoration under the row lock.
    async fn rollback_reservation(
        &self,
        trade_id: i64,
        user_id: i64,
        size: Decimal,
        error: &str,
    ) -> EngineResult<()> {
        let mut tx = self.db.begin().await?;
        trades::fail(&mut tx, trade_id, error).await?;
        users::lock_for_update(&mut tx, user_id).await?;
        users::adjust_balance(&mut tx, user_id, size).await?;
        tx.commit().await?;
        info!(trade_id, user_id, size = %size, "reservation rolled back");
        Ok(())
    }

    /// Phase 2C: flip to NEEDS_RECONCILIATION on a fresh connection; if even
    /// that fails there is nothing left but to scream.
    async fn mark_for_reconciliation(
        &self,
        trade_id: i64,
        user_id: i64,
        error_message: &str,
        exchange_order_id: Option<&str>,
    ) {
        let marked = async {
            let mut conn = self.db.acquire().await?;
            trades::mark_needs_reconciliation(&mut conn, trade_id, error_message, exchange_order_id)
                .await
        }
        .await;

        match marked {
            Ok(true) => {
                warn!(trade_id, user_id, "trade marked for reconciliation");
                self.events.publish(EngineEvent::TradeNeedsReconciliation {
                    at: Utc::now(),
                    trade_id,
                    user_id,
                    exchange_order_id: exchange_order_id.map(String::from),
                });
            }
            Ok(false) => {
                info!(trade_id, "trade already finalised, reconciliation mark skipped");
            }
            Err(e) => {
                error!(trade_id, error = %e, "FAILED to mark trade for reconciliation");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn dispatch_market_order(
    executor: &dyn ExchangePort,
    side: TradeSide,
    is_futures: bool,
    symbol: &str,
    quantity: Decimal,
) -> EngineResult<OrderResult> {
    match (side, is_futures) {
        (TradeSide::Buy, true) => executor.futures_market_long(symbol, quantity).await,
        (TradeSide::Sell, true) => executor.futures_market_short(symbol, quantity).await,
        (TradeSide::Buy, false) => executor.spot_market_buy(symbol, quantity).await,
        (TradeSide::Sell, false) => executor.spot_market_sell(symbol, quantity).await,
    }
}

/// Tier gate first, then per-whale override, then user settings.
fn should_use_futures(
    follow: &WhaleFollow,
    settings: Option<&UserSettings>,
    tier: SubscriptionTier,
) -> bool {
    if !tier.limits().futures_enabled {
        return false;
    }
    if let Some(mode) = follow.trading_mode_override {
        return mode == TradingMode::Futures;
    }
    matches!(
        settings.map(|s| s.trading_mode),
        Some(TradingMode::Futures) | Some(TradingMode::Mixed)
    )
}

fn trade_type_for(side: TradeSide, is_futures: bool) -> TradeType {
    if !is_futures {
        TradeType::Spot
    } else if side == TradeSide::Buy {
        TradeType::FuturesLong
    } else {
        TradeType::FuturesShort
    }
}

fn position_side_for(side: TradeSide) -> PositionSide {
    match side {
        TradeSide::Buy => PositionSide::Long,
        TradeSide::Sell => PositionSide::Short,
    }
}

/// Stop or take-profit price `percent` away from entry. Stops sit against
/// the position, targets with it.
fn stop_price(entry: Decimal, side: PositionSide, percent: Decimal, is_stop: bool) -> Decimal {
    let fraction = percent / Decimal::ONE_HUNDRED;
    let against = matches!(side, PositionSide::Long) == is_stop;
    if against {
        entry * (Decimal::ONE - fraction)
    } else {
        entry * (Decimal::ONE + fraction)
    }
}

/// Cross-margin estimate used until the venue reports the real figure: the
/// full-margin wipeout price at 1/leverage distance.
fn approx_liquidation_price(entry: Decimal, side: PositionSide, leverage: i32) -> Decimal {
    let distance = Decimal::ONE / Decimal::from(leverage.max(1));
    match side {
        PositionSide::Long => entry * (Decimal::ONE - distance),
        PositionSide::Short => entry * (Decimal::ONE + distance),
    }
}

fn quantity_hint(signal: &Signal) -> Decimal {
    if signal.price.is_zero() {
        Decimal::MAX
    } else {
        signal.size_usd / signal.price
    }
}

fn synthetic_follow(user_id: i64, whale_id: i64) -> WhaleFollow {
    WhaleFollow {
        id: 0,
        user_id,
        whale_id,
        auto_copy_enabled: false,
        notify_on_trade: false,
        trade_size_usdt: None,
        trade_size_percent: None,
        max_trade_size_usdt: None,
        trading_mode_override: None,
        sizing_strategy_override: None,
        kelly_fraction_override: None,
        trades_copied: 0,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn futures_mode_respects_tier_then_override_then_settings() {
        let mut follow = synthetic_follow(1, 2);
        let mut settings = UserSettings {
            user_id: 1,
            default_trade_size_usdt: None,
            trade_size_percent: None,
            max_trade_size_usdt: dec!(1000),
            daily_loss_limit_usdt: dec!(100),
            stop_loss_percent: None,
            take_profit_percent: None,
            default_leverage: 5,
            max_leverage: 20,
            preferred_exchange: Exchange::Binance,
            trading_mode: TradingMode::Futures,
            sizing_strategy: None,
            kelly_fraction: None,
            notify_trade_executed: false,
        };

        // Free tier blocks futures outright.
        assert!(!should_use_futures(
            &follow,
            Some(&settings),
            SubscriptionTier::Free
        ));
        // Pro tier follows settings.
        assert!(should_use_futures(
            &follow,
            Some(&settings),
            SubscriptionTier::Pro
        ));
        // A spot override wins over futures settings.
        follow.trading_mode_override = Some(TradingMode::Spot);
        assert!(!should_use_futures(
            &follow,
            Some(&settings),
            SubscriptionTier::Pro
        ));
        // Mixed mode counts as futures-capable.
        follow.trading_mode_override = None;
        settings.trading_mode = TradingMode::Mixed;
        assert!(should_use_futures(
            &follow,
            Some(&settings),
            SubscriptionTier::Premium
        ));
    }

    #[test]
    fn stop_and_target_prices_sit_on_the_right_sides() {
        // Long: stop below entry, target above.
        assert_eq!(
            stop_price(dec!(50000), PositionSide::Long, dec!(2), true),
            dec!(49000)
        );
        assert_eq!(
            stop_price(dec!(50000), PositionSide::Long, dec!(2), false),
            dec!(51000)
        );
        // Short: mirrored.
        assert_eq!(
            stop_price(dec!(50000), PositionSide::Short, dec!(2), true),
            dec!(51000)
        );
        assert_eq!(
            stop_price(dec!(50000), PositionSide::Short, dec!(2), false),
            dec!(49000)
        );
    }

    #[test]
    fn liquidation_estimate_scales_with_leverage() {
        assert_eq!(
            approx_liquidation_price(dec!(50000), PositionSide::Long, 10),
            dec!(45000)
        );
        assert_eq!(
            approx_liquidation_price(dec!(50000), PositionSide::Short, 4),
            dec!(62500)
        );
    }

    #[test]
    fn trade_type_mapping() {
        assert_eq!(trade_type_for(TradeSide::Buy, false), TradeType::Spot);
        assert_eq!(trade_type_for(TradeSide::Buy, true), TradeType::FuturesLong);
        assert_eq!(
            trade_type_for(TradeSide::Sell, true),
            TradeType::FuturesShort
        );
    }
}
