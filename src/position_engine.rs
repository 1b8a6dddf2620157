// =============================================================================
// Position Engine — mark-to-market, SL/TP/liquidation triggers, close path
// =============================================================================
//
// Three responsibilities, each driven by its own loop in main:
//   1. mark-to-market: refresh current_price / unrealized PnL for every OPEN
//      position from live tickers, under the same per-venue concurrency caps
//      as the fetcher
//   2. trigger evaluation: stop-loss, take-profit and liquidation checks on
//      the marked prices, queueing closes with the right reason
//   3. the close worker: drains CloseRequests (whale exits, triggers, manual)
//      and drives each through the same two-phase protocol as entries, with
//      a reduce-only order
//
// PnL formulas (leverage applied at valuation time, identical at mark and
// close):
//   price_change_pct = (exit - entry) / entry * 100      LONG
//                      (entry - exit) / entry * 100      SHORT
//   gross            = size * price_change_pct / 100 * leverage
//   realized         = gross - fees
//   realized_pct     = price_change_pct * leverage - fees / size * 100 * lev
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::breaker::BreakerRegistry;
use crate::db::trades::{NewTrade, TradeFill};
use crate::db::{positions, trades, users, Db};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::exchanges::{build_executor, guarded_call, Credentials, ExchangePort};
use crate::ratelimit::RateLimitManager;
use crate::types::{
    CloseReason, Exchange, Position, PositionSide, PositionStatus, PositionType, TradeType,
};

/// Mark-to-market ticker fetches in flight at once.
const MARK_CONCURRENCY: usize = 10;
/// Cap on OPEN positions handled per sweep.
const SWEEP_LIMIT: i64 = 2000;

/// A queued close, produced by whale-exit handling, trigger evaluation, or
/// the ops surface.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub user_id: i64,
    pub position_id: i64,
    pub reason: CloseReason,
    /// None closes the full remaining quantity.
    pub quantity: Option<Decimal>,
}

pub fn close_channel() -> (mpsc::Sender<CloseRequest>, mpsc::Receiver<CloseRequest>) {
    mpsc::channel(1024)
}

// ---------------------------------------------------------------------------
// PnL math
// ---------------------------------------------------------------------------

/// Signed price change percent in the position's favour.
pub fn price_change_percent(side: PositionSide, entry: Decimal, exit: Decimal) -> Decimal {
    if entry.is_zero() {
        return Decimal::ZERO;
    }
    match side {
        PositionSide::Long => (exit - entry) / entry * Decimal::ONE_HUNDRED,
        PositionSide::Short => (entry - exit) / entry * Decimal::ONE_HUNDRED,
    }
}

/// Unrealized PnL and percent for a marked price.
pub fn unrealized_pnl(
    side: PositionSide,
    entry: Decimal,
    current: Decimal,
    size_usdt: Decimal,
    leverage: i32,
) -> (Decimal, Decimal) {
    let pct = price_change_percent(side, entry, current);
    let lev = Decimal::from(leverage.max(1));
    (size_usdt * pct / Decimal::ONE_HUNDRED * lev, pct * lev)
}

/// Realized PnL and percent at close, net of fees.
pub fn realized_pnl(
    side: PositionSide,
    entry: Decimal,
    exit: Decimal,
    size_usdt: Decimal,
    leverage: i32,
    fees: Decimal,
) -> (Decimal, Decimal) {
    let pct = price_change_percent(side, entry, exit);
    let lev = Decimal::from(leverage.max(1));
    let gross = size_usdt * pct / Decimal::ONE_HUNDRED * lev;
    let pnl = gross - fees;
    let fee_pct = if size_usdt.is_zero() {
        Decimal::ZERO
    } else {
        fees / size_usdt * Decimal::ONE_HUNDRED * lev
    };
    (pnl, pct * lev - fee_pct)
}

// ---------------------------------------------------------------------------
// Trigger evaluation
// ---------------------------------------------------------------------------

pub fn should_trigger_stop_loss(side: PositionSide, price: Decimal, stop: Decimal) -> bool {
    match side {
        PositionSide::Long => price <= stop,
        PositionSide::Short => price >= stop,
    }
}

pub fn should_trigger_take_profit(side: PositionSide, price: Decimal, target: Decimal) -> bool {
    match side {
        PositionSide::Long => price >= target,
        PositionSide::Short => price <= target,
    }
}

pub fn liquidation_crossed(side: PositionSide, price: Decimal, liquidation: Decimal) -> bool {
    match side {
        PositionSide::Long => price <= liquidation,
        PositionSide::Short => price >= liquidation,
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct PositionManager {
    db: Db,
    breakers: Arc<BreakerRegistry>,
    rate_limits: Arc<RateLimitManager>,
    events: Arc<EventBus>,
    close_tx: mpsc::Sender<CloseRequest>,
    /// Credential-free adapters used only for public ticker reads.
    ticker_ports: Mutex<HashMap<Exchange, Arc<dyn ExchangePort>>>,
}

impl PositionManager {
    pub fn new(
        db: Db,
        breakers: Arc<BreakerRegistry>,
        rate_limits: Arc<RateLimitManager>,
        events: Arc<EventBus>,
        close_tx: mpsc::Sender<CloseRequest>,
    ) -> Self {
        Self {
            db,
            breakers,
            rate_limits,
            events,
            close_tx,
            ticker_ports: Mutex::new(HashMap::new()),
        }
    }

    fn ticker_port(&self, exchange: Exchange) -> EngineResult<Arc<dyn ExchangePort>> {
        let mut ports = self.ticker_ports.lock();
        if let Some(port) = ports.get(&exchange) {
            return Ok(port.clone());
        }
        let port: Arc<dyn ExchangePort> = Arc::from(build_executor(
            exchange,
            Credentials {
                api_key: String::new(),
                api_secret: String::new(),
                passphrase: Some(String::new()),
            },
        )?);
        ports.insert(exchange, port.clone());
        Ok(port)
    }

    // -------------------------------------------------------------------------
    // Mark-to-market
    // -------------------------------------------------------------------------

    /// Refresh every OPEN position's valuation from live tickers, then run
    /// the trigger evaluation on the fresh marks.
    pub async fn mark_to_market_sweep(&self) -> EngineResult<()> {
        let open = {
            let mut conn = self.db.acquire().await?;
            positions::all_open(&mut conn, SWEEP_LIMIT).await?
        };
        if open.is_empty() {
            return Ok(());
        }

        // One ticker fetch per distinct (exchange, symbol).
        let mut unique: Vec<(Exchange, String)> = Vec::new();
        for position in &open {
            let key = (position.exchange, position.symbol.clone());
            if !unique.contains(&key) {
                unique.push(key);
            }
        }

        let semaphore = Semaphore::new(MARK_CONCURRENCY);
        let fetches = join_all(unique.iter().map(|(exchange, symbol)| {
            let semaphore = &semaphore;
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return ((*exchange, symbol.clone()), None);
                };
                let price = self.fetch_ticker(*exchange, symbol).await;
                ((*exchange, symbol.clone()), price)
            }
        }))
        .await;

        let prices: HashMap<(Exchange, String), Decimal> = fetches
            .into_iter()
            .filter_map(|(key, price)| price.map(|p| (key, p)))
            .collect();

        let mut marked = 0usize;
        for position in &open {
            let Some(price) = prices.get(&(position.exchange, position.symbol.clone())) else {
                continue;
            };
            let (pnl, pct) = unrealized_pnl(
                position.side,
                position.entry_price,
                *price,
                position.entry_value_usdt,
                position.leverage,
            );
            let mut conn = self.db.acquire().await?;
            positions::update_mark(
                &mut conn,
                position.id,
                *price,
                position.remaining_quantity * *price,
                pnl,
                pct,
            )
            .await?;
            marked += 1;
        }
        debug!(positions = open.len(), marked, "mark-to-market sweep done");

        self.evaluate_triggers(&open, &prices).await;
        Ok(())
    }

    async fn fetch_ticker(&self, exchange: Exchange, symbol: &str) -> Option<Decimal> {
        let port = match self.ticker_port(exchange) {
            Ok(p) => p,
            Err(e) => {
                warn!(exchange = %exchange, error = %e, "no ticker port");
                return None;
            }
        };
        let breaker = self.breakers.breaker(exchange.as_str());
        match guarded_call(&breaker, &self.rate_limits, exchange, || {
            port.get_ticker_price(symbol)
        })
        .await
        {
            Ok(price) => Some(price),
            Err(e) => {
                debug!(symbol, exchange = %exchange, error = %e, "ticker fetch failed");
                None
            }
        }
    }

    /// SL, TP and liquidation checks against fresh marks. Liquidations are
    /// settled directly; SL/TP queue a close through the worker.
    async fn evaluate_triggers(
        &self,
        open: &[Position],
        prices: &HashMap<(Exchange, String), Decimal>,
    ) {
        for position in open {
            let Some(price) = prices.get(&(position.exchange, position.symbol.clone())) else {
                continue;
            };
            let price = *price;

            if let Some(liq) = position.liquidation_price {
                if position.position_type == PositionType::Futures
                    && liquidation_crossed(position.side, price, liq)
                {
                    if let Err(e) = self.settle_liquidation(position, liq).await {
                        error!(position_id = position.id, error = %e, "liquidation settle failed");
                    }
                    continue;
                }
            }

            if let Some(stop) = position.stop_loss_price {
                if should_trigger_stop_loss(position.side, price, stop) {
                    info!(
                        position_id = position.id,
                        price = %price,
                        stop = %stop,
                        "stop-loss triggered"
                    );
                    self.events.publish(EngineEvent::StopLossTriggered {
                        at: Utc::now(),
                        position_id: position.id,
                        user_id: position.user_id,
                        symbol: position.symbol.clone(),
                        trigger_price: price,
                    });
                    self.queue_close(position, CloseReason::StopLoss).await;
                    continue;
                }
            }

            if let Some(target) = position.take_profit_price {
                if should_trigger_take_profit(position.side, price, target) {
                    info!(
                        position_id = position.id,
                        price = %price,
                        target = %target,
                        "take-profit triggered"
                    );
                    self.events.publish(EngineEvent::TakeProfitTriggered {
                        at: Utc::now(),
                        position_id: position.id,
                        user_id: position.user_id,
                        symbol: position.symbol.clone(),
                        trigger_price: price,
                    });
                    self.queue_close(position, CloseReason::TakeProfit).await;
                }
            }
        }
    }

    async fn queue_close(&self, position: &Position, reason: CloseReason) {
        let request = CloseRequest {
            user_id: position.user_id,
            position_id: position.id,
            reason,
            quantity: None,
        };
        if self.close_tx.send(request).await.is_err() {
            error!(position_id = position.id, "close worker unavailable");
        }
    }

    // -------------------------------------------------------------------------
    // Close worker
    // -------------------------------------------------------------------------

    /// Drain close requests until the channel closes (shutdown).
    pub async fn run_close_worker(self: Arc<Self>, mut rx: mpsc::Receiver<CloseRequest>) {
        info!("position close worker running");
        while let Some(request) = rx.recv().await {
            let position_id = request.position_id;
            if let Err(e) = self.close_position(request).await {
                error!(position_id, error = %e, "position close failed");
            }
        }
        info!("position close worker stopped");
    }

    /// Close (or partially close) one position through the two-phase
    /// protocol with a reduce-only order.
    pub async fn close_position(&self, request: CloseRequest) -> EngineResult<()> {
        let position = {
            let mut conn = self.db.acquire().await?;
            positions::get(&mut conn, request.position_id).await?
        }
        .ok_or_else(|| {
            EngineError::Validation(format!("position {} not found", request.position_id))
        })?;

        if position.status != PositionStatus::Open {
            // Close idempotency: a second close for the same position is a
            // no-op, not a second reducing order.
            info!(
                position_id = position.id,
                status = %position.status,
                "close skipped, position not open"
            );
            return Ok(());
        }

        let credentials = {
            let mut conn = self.db.acquire().await?;
            users::get_api_credentials(&mut conn, position.user_id, position.exchange).await?
        }
        .ok_or_else(|| {
            EngineError::Validation(format!("no API key configured for {}", position.exchange))
        })?;
        let executor = build_executor(position.exchange, credentials)?;
        let result = self.close_with_session(&position, &request, &*executor).await;
        let _ = executor.close().await;
        result
    }

    async fn close_with_session(
        &self,
        position: &Position,
        request: &CloseRequest,
        executor: &dyn ExchangePort,
    ) -> EngineResult<()> {
        let exchange = position.exchange;
        let breaker = self.breakers.breaker(exchange.as_str());
        let is_futures = position.position_type == PositionType::Futures;
        let close_side = position.side.closing_side();

        // Spot closes sell what the wallet actually holds, not the DB figure;
        // LOT_SIZE dust between the two is reported and left behind.
        let target_qty = request
            .quantity
            .unwrap_or(position.remaining_quantity)
            .min(position.remaining_quantity);
        let quantity = if is_futures {
            executor
                .round_quantity(&position.symbol, target_qty, true)
                .await?
        } else {
            let base = position
                .symbol
                .strip_suffix("USDT")
                .unwrap_or(&position.symbol);
            let wallet = guarded_call(&breaker, &self.rate_limits, exchange, || {
                executor.get_asset_balance(base)
            })
            .await?;
            let sellable = wallet.free.min(target_qty);
            if wallet.free < target_qty {
                warn!(
                    position_id = position.id,
                    wallet = %wallet.free,
                    expected = %target_qty,
                    "wallet balance below recorded quantity, selling wallet amount"
                );
            }
            let rounded = executor
                .round_quantity(&position.symbol, sellable, false)
                .await?;
            if rounded < sellable {
                debug!(
                    position_id = position.id,
                    dust = %(sellable - rounded),
                    "LOT_SIZE dust remains after close rounding"
                );
            }
            rounded
        };

        // Phase 1: the exit trade row. Closes reserve nothing; margin comes
        // back at confirm time.
        let trade_id = {
            let mut tx = self.db.begin().await?;
            let trade_id = trades::insert(
                &mut tx,
                &NewTrade {
                    user_id: position.user_id,
                    signal_id: None,
                    whale_id: position.whale_id,
                    exchange,
                    symbol: position.symbol.clone(),
                    side: close_side,
                    trade_type: if is_futures {
                        if position.side == PositionSide::Long {
                            TradeType::FuturesShort
                        } else {
                            TradeType::FuturesLong
                        }
                    } else {
                        TradeType::Spot
                    },
                    size_usdt: Decimal::ZERO,
                    quantity,
                    leverage: position.leverage,
                },
            )
            .await?;
            tx.commit().await?;
            trade_id
        };

        {
            let mut conn = self.db.acquire().await?;
            trades::set_status(&mut conn, trade_id, crate::types::TradeStatus::Executing).await?;
        }

        if let Err(e) = breaker.guard().await {
            let mut conn = self.db.acquire().await?;
            trades::fail(&mut conn, trade_id, &e.to_string()).await?;
            return Err(e);
        }

        let order = guarded_call(&breaker, &self.rate_limits, exchange, || async {
            if is_futures {
                executor
                    .futures_close_position(&position.symbol, position.side, Some(quantity))
                    .await
            } else {
                executor.spot_market_sell(&position.symbol, quantity).await
            }
        })
        .await;

        let order = match order {
            Ok(order) => order,
            Err(EngineError::Timeout(msg)) => {
                let mut conn = self.db.acquire().await?;
                trades::mark_needs_reconciliation(&mut conn, trade_id, &msg, None).await?;
                self.events.publish(EngineEvent::TradeNeedsReconciliation {
                    at: Utc::now(),
                    trade_id,
                    user_id: position.user_id,
                    exchange_order_id: None,
                });
                return Err(EngineError::Timeout(msg));
            }
            Err(e) => {
                let mut conn = self.db.acquire().await?;
                trades::fail(&mut conn, trade_id, &e.message_for_db()).await?;
                self.events.publish(EngineEvent::TradeFailed {
                    at: Utc::now(),
                    trade_id,
                    user_id: position.user_id,
                    symbol: position.symbol.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let exit_price = order.avg_fill_price.unwrap_or(position.current_price);
        let filled = order.filled_quantity;

        // Phase 2A.
        let outcome = self
            .confirm_close(position, request, trade_id, &order, exit_price, filled)
            .await;
        if let Err(e) = outcome {
            let mut conn = self.db.acquire().await?;
            let _ = trades::mark_needs_reconciliation(
                &mut conn,
                trade_id,
                &format!("close confirm failed: {e}"),
                Some(&order.order_id),
            )
            .await;
            return Err(e);
        }
        Ok(())
    }

    async fn confirm_close(
        &self,
        position: &Position,
        request: &CloseRequest,
        trade_id: i64,
        order: &crate::exchanges::OrderResult,
        exit_price: Decimal,
        filled: Decimal,
    ) -> EngineResult<()> {
        let mut tx = self.db.begin().await?;

        trades::confirm_fill(
            &mut tx,
            trade_id,
            &TradeFill {
                exchange_order_id: order.order_id.clone(),
                executed_price: exit_price,
                filled_quantity: filled,
                fee_amount: order.fee,
                fee_currency: order.fee_currency.clone(),
                fully_filled: filled >= position.remaining_quantity,
            },
        )
        .await?;

        let remaining = position.remaining_quantity - filled;
        if remaining > Decimal::ZERO && request.quantity.is_none() {
            // Partial fill of a full close: stay OPEN, follow up.
            positions::reduce(&mut tx, position.id, remaining).await?;
            tx.commit().await?;
            warn!(
                position_id = position.id,
                remaining = %remaining,
                "close partially filled, re-enqueueing remainder"
            );
            let _ = self
                .close_tx
                .send(CloseRequest {
                    user_id: request.user_id,
                    position_id: request.position_id,
                    reason: request.reason,
                    quantity: None,
                })
                .await;
            return Ok(());
        }

        if remaining > Decimal::ZERO {
            // Requested partial close completed; position stays OPEN.
            positions::reduce(&mut tx, position.id, remaining).await?;
            tx.commit().await?;
            info!(
                position_id = position.id,
                remaining = %remaining,
                "partial close complete"
            );
            return Ok(());
        }

        // Terminal close: realized PnL and margin release.
        let (pnl, _pct) = realized_pnl(
            position.side,
            position.entry_price,
            exit_price,
            position.entry_value_usdt,
            position.leverage,
            order.fee,
        );
        positions::close(
            &mut tx,
            position.id,
            PositionStatus::Closed,
            request.reason,
            exit_price,
            Some(trade_id),
            pnl,
        )
        .await?;

        users::lock_for_update(&mut tx, position.user_id).await?;
        users::adjust_balance(&mut tx, position.user_id, position.entry_value_usdt + pnl).await?;
        tx.commit().await?;

        info!(
            position_id = position.id,
            reason = %request.reason,
            exit_price = %exit_price,
            realized_pnl = %pnl,
            "position closed"
        );
        self.events.publish(EngineEvent::PositionClosed {
            at: Utc::now(),
            position_id: position.id,
            user_id: position.user_id,
            symbol: position.symbol.clone(),
            close_reason: request.reason,
            realized_pnl: pnl,
        });
        Ok(())
    }

    /// The venue already seized the position at its liquidation price; all
    /// that remains is recording the loss.
    async fn settle_liquidation(&self, position: &Position, liq_price: Decimal) -> EngineResult<()> {
        let (pnl, _pct) = realized_pnl(
            position.side,
            position.entry_price,
            liq_price,
            position.entry_value_usdt,
            position.leverage,
            Decimal::ZERO,
        );

        let mut tx = self.db.begin().await?;
        positions::close(
            &mut tx,
            position.id,
            PositionStatus::Liquidated,
            CloseReason::Liquidation,
            liq_price,
            None,
            pnl,
        )
        .await?;
        users::lock_for_update(&mut tx, position.user_id).await?;
        let residual = (position.entry_value_usdt + pnl).max(Decimal::ZERO);
        users::adjust_balance(&mut tx, position.user_id, residual).await?;
        tx.commit().await?;

        warn!(
            position_id = position.id,
            liquidation_price = %liq_price,
            realized_pnl = %pnl,
            "position liquidated"
        );
        self.events.publish(EngineEvent::PositionLiquidated {
            at: Utc::now(),
            position_id: position.id,
            user_id: position.user_id,
            symbol: position.symbol.clone(),
            liquidation_price: liq_price,
            realized_pnl: pnl,
        });
        Ok(())
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
    fn realized_pnl_reference_case() {
        // LONG, entry 50 000 -> exit 52 000, 1 000 USDT at 5x, 5 USDT fees:
        // 1000 * 4% * 5 - 5 = 195; 4 * 5 - (5/1000 * 100 * 5) = 17.5%.
        let (pnl, pct) = realized_pnl(
            PositionSide::Long,
            dec!(50000),
            dec!(52000),
            dec!(1000),
            5,
            dec!(5),
        );
        assert_eq!(pnl, dec!(195));
        assert_eq!(pct, dec!(17.5));
    }

    #[test]
    fn short_pnl_inverts_the_price_change() {
        let (pnl, _) = realized_pnl(
            PositionSide::Short,
            dec!(3000),
            dec!(2850),
            dec!(600),
            2,
            Decimal::ZERO,
        );
        // 5% in favour at 2x on 600 = 60.
        assert_eq!(pnl, dec!(60));

        let (pnl, _) = realized_pnl(
            PositionSide::Short,
            dec!(3000),
            dec!(3150),
            dec!(600),
            2,
            Decimal::ZERO,
        );
        assert_eq!(pnl, dec!(-60));
    }

    #[test]
    fn unrealized_matches_realized_at_same_price() {
        let (upnl, upct) =
            unrealized_pnl(PositionSide::Long, dec!(50000), dec!(52000), dec!(1000), 5);
        let (rpnl, rpct) = realized_pnl(
            PositionSide::Long,
            dec!(50000),
            dec!(52000),
            dec!(1000),
            5,
            Decimal::ZERO,
        );
        assert_eq!(upnl, rpnl);
        assert_eq!(upct, rpct);
    }

    #[test]
    fn stop_loss_triggers_from_the_third_observation() {
        let stream = [dec!(49500), dec!(49200), dec!(49000), dec!(48800)];
        let fired: Vec<bool> = stream
            .iter()
            .map(|p| should_trigger_stop_loss(PositionSide::Long, *p, dec!(49000)))
            .collect();
        assert_eq!(fired, vec![false, false, true, true]);
    }

    #[test]
    fn short_triggers_mirror_long_ones() {
        assert!(should_trigger_stop_loss(
            PositionSide::Short,
            dec!(51000),
            dec!(50500)
        ));
        assert!(!should_trigger_stop_loss(
            PositionSide::Short,
            dec!(50000),
            dec!(50500)
        ));
        assert!(should_trigger_take_profit(
            PositionSide::Short,
            dec!(48000),
            dec!(48500)
        ));
        assert!(liquidation_crossed(
            PositionSide::Long,
            dec!(44900),
            dec!(45000)
        ));
    }

    #[test]
    fn zero_entry_price_yields_zero_pnl() {
        let (pnl, pct) = unrealized_pnl(PositionSide::Long, Decimal::ZERO, dec!(100), dec!(50), 3);
        assert_eq!(pnl, Decimal::ZERO);
        assert_eq!(pct, Decimal::ZERO);
    }
}
