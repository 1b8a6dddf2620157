// =============================================================================
// Reconciliation Worker — resolves trades the 2PC could not finalise
// =============================================================================
//
// Two populations, swept on a timer:
//   1. NEEDS_RECONCILIATION trades: the exchange call may or may not have
//      happened. The stored exchange_order_id is checked against the venue's
//      canonical order state; the trade is then confirmed or rolled back.
//   2. stale PENDING trades with no exchange_order_id: the reservation never
//      reached a venue and is released after a grace window.
//
// Each trade is settled in its own transaction; one bad trade never blocks
// the sweep.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::db::trades::TradeFill;
use crate::db::{positions, trades, users, Db};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::exchanges::{build_executor, OrderStatus};
use crate::types::{PositionSide, PositionType, Trade, TradeSide, TradeStatus};

/// PENDING reservations older than this with no order id are released.
const STALE_PENDING_GRACE_SECONDS: i64 = 120;
/// Trades handled per sweep.
const SWEEP_BATCH: i64 = 50;

pub struct Reconciler {
    db: Db,
    events: Arc<EventBus>,
}

impl Reconciler {
    pub fn new(db: Db, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// One full sweep over both populations. Returns how many trades were
    /// settled.
    pub async fn run_sweep(&self) -> EngineResult<usize> {
        let mut settled = 0usize;

        let needing = {
            let mut conn = self.db.acquire().await?;
            trades::needing_reconciliation(&mut conn, SWEEP_BATCH).await?
        };
        for trade in needing {
            match self.reconcile_trade(&trade).await {
                Ok(()) => settled += 1,
                Err(e) => {
                    error!(trade_id = trade.id, error = %e, "reconciliation attempt failed")
                }
            }
        }

        let cutoff = Utc::now() - ChronoDuration::seconds(STALE_PENDING_GRACE_SECONDS);
        let stale = {
            let mut conn = self.db.acquire().await?;
            trades::stale_pending(&mut conn, cutoff, SWEEP_BATCH).await?
        };
        for trade in stale {
            match self.release_reservation(&trade, "stale reservation released").await {
                Ok(()) => settled += 1,
                Err(e) => error!(trade_id = trade.id, error = %e, "stale release failed"),
            }
        }

        if settled > 0 {
            info!(settled, "reconciliation sweep complete");
        }
        Ok(settled)
    }

    async fn reconcile_trade(&self, trade: &Trade) -> EngineResult<()> {
        let Some(order_id) = trade.exchange_order_id.as_deref() else {
            // Never reached a venue: the reservation comes straight back.
            return self
                .release_reservation(trade, "no exchange order, reservation released")
                .await;
        };

        let credentials = {
            let mut conn = self.db.acquire().await?;
            users::get_api_credentials(&mut conn, trade.user_id, trade.exchange).await?
        }
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "no API key for {} while reconciling trade {}",
                trade.exchange, trade.id
            ))
        })?;
        let executor = build_executor(trade.exchange, credentials)?;

        let order = executor
            .get_order(&trade.symbol, order_id, trade.trade_type.is_futures())
            .await;
        let _ = executor.close().await;

        match order {
            Ok(order) if !order.filled_quantity.is_zero() => {
                self.finalize_fill(
                    trade,
                    &TradeFill {
                        exchange_order_id: order.order_id.clone(),
                        executed_price: order
                            .avg_fill_price
                            .unwrap_or(trade.executed_price.unwrap_or(Decimal::ZERO)),
                        filled_quantity: order.filled_quantity,
                        fee_amount: order.fee,
                        fee_currency: order.fee_currency.clone(),
                        fully_filled: order.status == OrderStatus::Filled,
                    },
                )
                .await
            }
            Ok(order) if order.status.is_terminal() => {
                // Canceled / rejected / expired with nothing filled.
                self.release_reservation(trade, "venue order did not fill")
                    .await
            }
            Ok(_) => {
                // Still working on the venue; try again next sweep.
                info!(trade_id = trade.id, order_id, "order still open, deferring");
                Ok(())
            }
            Err(e) => {
                warn!(trade_id = trade.id, error = %e, "venue order lookup failed, deferring");
                Ok(())
            }
        }
    }

    /// The venue says the order filled: confirm the trade and make the
    /// position whole.
    async fn finalize_fill(&self, trade: &Trade, fill: &TradeFill) -> EngineResult<()> {
        let mut tx = self.db.begin().await?;
        trades::confirm_fill(&mut tx, trade.id, fill).await?;

        // Exit trades (no reservation) cannot be auto-settled into a
        // position here; flag them for the operator instead of guessing.
        if trade.size_usdt.is_zero() {
            tx.commit().await?;
            warn!(
                trade_id = trade.id,
                "close trade reconciled as filled; position settlement needs operator review"
            );
            return Ok(());
        }

        let side = if trade.side == TradeSide::Buy {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        let existing = positions::find_open_for_merge(
            &mut tx,
            trade.user_id,
            &trade.symbol,
            trade.whale_id,
        )
        .await?;
        match existing {
            Some(position) => {
                let total_value = position.entry_price * position.quantity
                    + fill.executed_price * fill.filled_quantity;
                let new_quantity = position.quantity + fill.filled_quantity;
                positions::merge_fill(
                    &mut tx,
                    position.id,
                    total_value / new_quantity,
                    new_quantity,
                    position.remaining_quantity + fill.filled_quantity,
                    fill.executed_price,
                    trade.size_usdt,
                    new_quantity * fill.executed_price,
                )
                .await?;
            }
            None => {
                positions::insert(
                    &mut tx,
                    &positions::NewPosition {
                        user_id: trade.user_id,
                        whale_id: trade.whale_id,
                        exchange: trade.exchange,
                        symbol: trade.symbol.clone(),
                        side,
                        position_type: if trade.trade_type.is_futures() {
                            PositionType::Futures
                        } else {
                            PositionType::Spot
                        },
                        quantity: fill.filled_quantity,
                        entry_price: fill.executed_price,
                        entry_value_usdt: trade.size_usdt,
                        leverage: trade.leverage,
                        liquidation_price: None,
                        stop_loss_price: None,
                        take_profit_price: None,
                        entry_trade_id: trade.id,
                    },
                )
                .await?;
            }
        }
        tx.commit().await?;

        info!(
            trade_id = trade.id,
            filled = %fill.filled_quantity,
            price = %fill.executed_price,
            "reconciled trade confirmed"
        );
        self.events.publish(EngineEvent::TradeExecuted {
            at: Utc::now(),
            trade_id: trade.id,
            user_id: trade.user_id,
            exchange: trade.exchange,
            symbol: trade.symbol.clone(),
            side: trade.side,
            filled_quantity: fill.filled_quantity,
            executed_price: fill.executed_price,
            size_usdt: trade.size_usdt,
        });
        Ok(())
    }

    /// Terminal failure plus reservation restoration (entry trades only;
    /// exit trades reserved nothing).
    async fn release_reservation(&self, trade: &Trade, reason: &str) -> EngineResult<()> {
        if trade.status == TradeStatus::Failed {
            return Ok(());
        }
        let mut tx = self.db.begin().await?;
        trades::fail(&mut tx, trade.id, reason).await?;
        if !trade.size_usdt.is_zero() {
            users::lock_for_update(&mut tx, trade.user_id).await?;
            users::adjust_balance(&mut tx, trade.user_id, trade.size_usdt).await?;
        }
        tx.commit().await?;

        info!(trade_id = trade.id, reason, "reservation released");
        self.events.publish(EngineEvent::TradeFailed {
            at: Utc::now(),
            trade_id: trade.id,
            user_id: trade.user_id,
            symbol: trade.symbol.clone(),
            error: reason.to_string(),
        });
        Ok(())
    }
}
