// =============================================================================
// Central Application State — Cachalot Copy Nexus
// =============================================================================
//
// The single wiring point for the engine. Every subsystem is constructed
// here, holds Arcs to its collaborators, and manages its own interior
// mutability. Loops in main receive an `Arc<AppState>` and nothing else.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::breaker::BreakerRegistry;
use crate::config::EngineConfig;
use crate::db::Db;
use crate::detector::SignalDetector;
use crate::engine::CopyTradeEngine;
use crate::events::EventBus;
use crate::fetcher::ParallelFetcher;
use crate::position_engine::{close_channel, CloseRequest, PositionManager};
use crate::proxy::ProxyPool;
use crate::queue::SignalQueue;
use crate::ratelimit::RateLimitManager;
use crate::reconcile::Reconciler;
use crate::scheduler::AdaptiveScheduler;
use crate::store::{KvStore, MemoryStore, RedisStore};

pub struct AppState {
    /// Monotonically increasing version, bumped on meaningful state changes;
    /// the ops status endpoint reports it.
    pub state_version: AtomicU64,

    pub config: Arc<EngineConfig>,
    pub db: Db,
    pub store: Arc<dyn KvStore>,

    pub proxy_pool: Arc<ProxyPool>,
    pub breakers: Arc<BreakerRegistry>,
    pub rate_limits: Arc<RateLimitManager>,
    pub fetcher: Arc<ParallelFetcher>,
    pub scheduler: Arc<AdaptiveScheduler>,
    pub detector: Arc<SignalDetector>,
    pub queue: Arc<SignalQueue>,
    pub engine: Arc<CopyTradeEngine>,
    pub position_manager: Arc<PositionManager>,
    pub reconciler: Arc<Reconciler>,
    pub events: Arc<EventBus>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build every subsystem. Returns the state plus the close-request
    /// receiver the close worker must drain.
    pub async fn initialize(
        config: EngineConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<CloseRequest>)> {
        let config = Arc::new(config);

        let db = Db::connect(&config.database_url)
            .await
            .context("database connection failed")?;

        let store: Arc<dyn KvStore> = match &config.redis_url {
            Some(url) => Arc::new(
                RedisStore::connect(url)
                    .await
                    .context("redis connection failed")?,
            ),
            None => Arc::new(MemoryStore::new()),
        };

        let proxy_pool = Arc::new(ProxyPool::new(store.clone()));
        if let Some(list) = &config.proxy_list {
            proxy_pool.load_from_list(list);
        }
        if proxy_pool.is_empty() {
            if let Some(path) = &config.proxy_pool_file {
                proxy_pool
                    .load_from_file(path)
                    .with_context(|| format!("loading proxy pool file {path}"))?;
            }
        }
        if proxy_pool.is_empty() {
            warn!(
                "no proxies loaded; set PROXY_LIST or PROXY_POOL_FILE to enable rotation, \
                 polling will go out directly"
            );
        }

        let breakers = Arc::new(BreakerRegistry::new(store.clone(), config.breaker));
        let rate_limits = Arc::new(RateLimitManager::new(store.clone()));
        let fetcher = Arc::new(ParallelFetcher::new(
            proxy_pool.clone(),
            rate_limits.clone(),
            config.fetch,
        ));
        let scheduler = Arc::new(AdaptiveScheduler::new(db.clone(), config.polling));
        let detector = Arc::new(SignalDetector::new(store.clone(), config.clone()));
        let queue = Arc::new(SignalQueue::new(db.clone(), config.signal_expiry_seconds));
        let events = Arc::new(EventBus::new());

        let (close_tx, close_rx) = close_channel();
        let engine = Arc::new(CopyTradeEngine::new(
            db.clone(),
            config.clone(),
            breakers.clone(),
            rate_limits.clone(),
            events.clone(),
            close_tx.clone(),
        ));
        let position_manager = Arc::new(PositionManager::new(
            db.clone(),
            breakers.clone(),
            rate_limits.clone(),
            events.clone(),
            close_tx,
        ));
        let reconciler = Arc::new(Reconciler::new(db.clone(), events.clone()));

        info!("application state initialised");
        Ok((
            Arc::new(Self {
                state_version: AtomicU64::new(0),
                config,
                db,
                store,
                proxy_pool,
                breakers,
                rate_limits,
                fetcher,
                scheduler,
                detector,
                queue,
                engine,
                position_manager,
                reconciler,
                events,
                start_time: std::time::Instant::now(),
            }),
            close_rx,
        ))
    }

    pub fn increment_version(&self) {
        self.state_version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("version", &self.version())
            .field("uptime_seconds", &self.uptime_seconds())
            .finish()
    }
}
