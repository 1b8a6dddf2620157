// =============================================================================
// Cachalot Copy Nexus — Main Entry Point
// =============================================================================
//
// Whale copy-trading engine: polls whale positions across venues, converts
// detected activity into signals, and executes copy trades for followers
// under per-user risk limits.
//
// Startup wiring lives in AppState; this file owns the long-running loops:
// one poller per priority tier, the signal processor, queue cleanup,
// priority recompute, mark-to-market, reconciliation, the close worker, and
// the operator API.
// =============================================================================

mod api;
mod app_state;
mod breaker;
mod config;
mod db;
mod detector;
mod engine;
mod error;
mod events;
mod exchanges;
mod fetcher;
mod position_engine;
mod proxy;
mod queue;
mod ratelimit;
mod reconcile;
mod risk;
mod scheduler;
mod sizing;
mod store;
mod types;

use std::sync::Arc;

use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::db::{signals, whales};
use crate::events::EngineEvent;
use crate::scheduler::PollingTier;
use crate::types::{DataStatus, SignalPriority, Whale};

/// All-failed polling cycles before a whale's feed is marked STALE.
const STALE_AFTER_FAILED_POLLS: i32 = 3;
/// All-failed polling cycles before a whale's feed is marked DEAD and the
/// whale leaves the rotation until an operator intervenes.
const DEAD_AFTER_FAILED_POLLS: i32 = 20;

/// Signal processor idle pause between drain attempts.
const PROCESSOR_IDLE_MS: u64 = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Cachalot Copy Nexus — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let (state, close_rx) = AppState::initialize(config).await?;

    // ── 1. Tier polling loops ────────────────────────────────────────────
    for tier in PollingTier::all() {
        let state = state.clone();
        let interval_seconds = tier.config(&state.config.polling).interval_seconds;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
            loop {
                interval.tick().await;
                if let Err(e) = poll_tier_once(&state, tier).await {
                    error!(tier = %tier, error = %e, "polling cycle failed");
                }
            }
        });
    }
    info!("tier polling loops launched");

    // ── 2. Signal processor ──────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            info!("signal processor running");
            loop {
                match drain_signal_queue(&state).await {
                    Ok(0) => tokio::time::sleep(Duration::from_millis(PROCESSOR_IDLE_MS)).await,
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "signal processing cycle failed");
                        tokio::time::sleep(Duration::from_millis(PROCESSOR_IDLE_MS)).await;
                    }
                }
            }
        });
    }

    // ── 3. Queue expiry sweep ────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                state.config.queue_cleanup_interval_seconds,
            ));
            loop {
                interval.tick().await;
                if let Err(e) = state.queue.cleanup_expired().await {
                    error!(error = %e, "queue cleanup failed");
                }
            }
        });
    }

    // ── 4. Priority recompute ────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                state.config.priority_recompute_interval_seconds,
            ));
            loop {
                interval.tick().await;
                if let Err(e) = state.scheduler.recalculate_priorities().await {
                    error!(error = %e, "priority recompute failed");
                }
            }
        });
    }

    // ── 5. Mark-to-market + trigger sweep ────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                state.config.mark_to_market_interval_seconds,
            ));
            loop {
                interval.tick().await;
                if let Err(e) = state.position_manager.mark_to_market_sweep().await {
                    error!(error = %e, "mark-to-market sweep failed");
                }
            }
        });
    }

    // ── 6. Reconciliation ────────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                state.config.reconcile_interval_seconds,
            ));
            loop {
                interval.tick().await;
                if let Err(e) = state.reconciler.run_sweep().await {
                    error!(error = %e, "reconciliation sweep failed");
                }
            }
        });
    }

    // ── 7. Close worker ──────────────────────────────────────────────────
    {
        let manager = state.position_manager.clone();
        tokio::spawn(manager.run_close_worker(close_rx));
    }

    // ── 8. Operator API ──────────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let app = api::rest::router(state);
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "operator API listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "operator API server failed");
                    }
                }
                Err(e) => error!(addr = %bind_addr, error = %e, "operator API bind failed"),
            }
        });
    }

    info!("all subsystems running, Ctrl+C to stop");

    // ── 9. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, draining in-flight work");
    // In-flight trades finish or land in NEEDS_RECONCILIATION; PENDING
    // reservations without an order id are released by the next
    // reconciliation sweep after restart.
    tokio::time::sleep(Duration::from_secs(3)).await;
    info!("Cachalot Copy Nexus shut down complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Loop bodies
// ---------------------------------------------------------------------------

/// One polling tick for one tier: select the batch, fetch concurrently,
/// diff into signals, and apply data-status decay for failures.
async fn poll_tier_once(state: &Arc<AppState>, tier: PollingTier) -> anyhow::Result<()> {
    let batch = state.scheduler.whales_for_tier(tier).await?;
    if batch.is_empty() {
        return Ok(());
    }

    let results = state.fetcher.fetch_all(&batch).await;
    for whale in &batch {
        let Some(result) = results.get(&whale.id) else {
            continue;
        };
        if result.success {
            handle_successful_poll(state, whale, &result.positions).await?;
        } else {
            handle_failed_poll(state, whale).await?;
        }
    }
    Ok(())
}

async fn handle_successful_poll(
    state: &Arc<AppState>,
    whale: &Whale,
    positions: &[crate::types::TraderPosition],
) -> anyhow::Result<()> {
    if !positions.is_empty() {
        let mut conn = state.db.acquire().await?;
        whales::mark_position_found(&mut conn, whale.id).await?;
    }

    let detected = state.detector.process_fetch(whale, positions).await;
    for new_signal in detected {
        let mut conn = state.db.acquire().await?;
        let signal_id = signals::insert(&mut conn, &new_signal).await?;
        drop(conn);

        state.events.publish(EngineEvent::SignalDetected {
            at: chrono::Utc::now(),
            signal_id,
            whale_id: new_signal.whale_id,
            symbol: new_signal.symbol.clone(),
            side: new_signal.side,
            size_usd: new_signal.size_usd,
            priority: new_signal.priority,
            is_close: new_signal.is_close,
        });
        state.increment_version();
    }
    Ok(())
}

/// STALE after three all-failed cycles, DEAD after twenty. DEAD whales drop
/// out of every tier query until an operator resets them.
async fn handle_failed_poll(state: &Arc<AppState>, whale: &Whale) -> anyhow::Result<()> {
    let mut conn = state.db.acquire().await?;
    let failures = whales::record_failed_poll(&mut conn, whale.id).await?;

    if failures >= DEAD_AFTER_FAILED_POLLS && whale.data_status != DataStatus::Dead {
        warn!(whale = %whale.name, failures, "whale data feed marked DEAD");
        whales::set_data_status(&mut conn, whale.id, DataStatus::Dead).await?;
    } else if failures >= STALE_AFTER_FAILED_POLLS && whale.data_status == DataStatus::Active {
        warn!(whale = %whale.name, failures, "whale data feed marked STALE");
        whales::set_data_status(&mut conn, whale.id, DataStatus::Stale).await?;
    }
    Ok(())
}

/// Claim and execute signals until the queue runs dry. Returns how many were
/// handled this cycle.
async fn drain_signal_queue(state: &Arc<AppState>) -> anyhow::Result<usize> {
    let mut handled = 0usize;

    while let Some(signal) = state.queue.pick_next(SignalPriority::Low).await? {
        handled += 1;
        state.events.publish(EngineEvent::SignalProcessingStarted {
            at: chrono::Utc::now(),
            signal_id: signal.id,
        });

        match state.engine.process_signal(&signal).await {
            Ok(results) => {
                let trades_executed = results.iter().filter(|r| r.success).count() as i32;
                state.queue.mark_processed(signal.id, trades_executed).await?;
                state.events.publish(EngineEvent::SignalProcessed {
                    at: chrono::Utc::now(),
                    signal_id: signal.id,
                    trades_executed,
                });
            }
            Err(e) => {
                state.queue.mark_failed(signal.id, &e.message_for_db()).await?;
                state.events.publish(EngineEvent::SignalFailed {
                    at: chrono::Utc::now(),
                    signal_id: signal.id,
                    error: e.to_string(),
                });
            }
        }
        state.increment_version();
    }
    Ok(handled)
}
