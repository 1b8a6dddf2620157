// =============================================================================
// Engine Events — immutable notifications for the out-of-process consumers
// =============================================================================
//
// Events are best-effort: publishing never fails a trade, and a full or
// absent subscriber simply drops the message. Each event is timestamped at
// creation and carries its aggregate id plus the semantic payload.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{CloseReason, Exchange, SignalPriority, TradeSide};

/// Capacity of the broadcast channel; slow consumers lose oldest events.
const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum EngineEvent {
    SignalDetected {
        at: DateTime<Utc>,
        signal_id: i64,
        whale_id: i64,
        symbol: String,
        side: TradeSide,
        size_usd: Decimal,
        priority: SignalPriority,
        is_close: bool,
    },
    SignalProcessingStarted {
        at: DateTime<Utc>,
        signal_id: i64,
    },
    SignalProcessed {
        at: DateTime<Utc>,
        signal_id: i64,
        trades_executed: i32,
    },
    SignalFailed {
        at: DateTime<Utc>,
        signal_id: i64,
        error: String,
    },
    TradeExecuted {
        at: DateTime<Utc>,
        trade_id: i64,
        user_id: i64,
        exchange: Exchange,
        symbol: String,
        side: TradeSide,
        filled_quantity: Decimal,
        executed_price: Decimal,
        size_usdt: Decimal,
    },
    TradeFailed {
        at: DateTime<Utc>,
        trade_id: i64,
        user_id: i64,
        symbol: String,
        error: String,
    },
    TradeNeedsReconciliation {
        at: DateTime<Utc>,
        trade_id: i64,
        user_id: i64,
        exchange_order_id: Option<String>,
    },
    PositionOpened {
        at: DateTime<Utc>,
        position_id: i64,
        user_id: i64,
        whale_id: Option<i64>,
        symbol: String,
        entry_price: Decimal,
        quantity: Decimal,
    },
    PositionClosed {
        at: DateTime<Utc>,
        position_id: i64,
        user_id: i64,
        symbol: String,
        close_reason: CloseReason,
        realized_pnl: Decimal,
    },
    PositionLiquidated {
        at: DateTime<Utc>,
        position_id: i64,
        user_id: i64,
        symbol: String,
        liquidation_price: Decimal,
        realized_pnl: Decimal,
    },
    StopLossTriggered {
        at: DateTime<Utc>,
        position_id: i64,
        user_id: i64,
        symbol: String,
        trigger_price: Decimal,
    },
    TakeProfitTriggered {
        at: DateTime<Utc>,
        position_id: i64,
        user_id: i64,
        symbol: String,
        trigger_price: Decimal,
    },
}

/// Broadcast bus the notification layer subscribes to.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Never fails; without subscribers the event is
    /// dropped silently.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            debug!("event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::SignalProcessed {
            at: Utc::now(),
            signal_id: 7,
            trades_executed: 3,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::SignalProcessed {
                signal_id,
                trades_executed,
                ..
            } => {
                assert_eq!(signal_id, 7);
                assert_eq!(trades_executed, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::StopLossTriggered {
            at: Utc::now(),
            position_id: 1,
            user_id: 2,
            symbol: "BTCUSDT".into(),
            trigger_price: dec!(49000),
        });
    }
}
