pub mod config;
pub mod tasks;

use std::sync::Arc;

use backtest_engine::{BacktestDb, BacktestEngine, StrategyExecutor};
use chrono::{Duration, Utc};
use indicator_cache::IndicatorCache;
use kline_store::KlineStore;
use market_core::{Interval, MarketDataSource, MarketKind, TimeRange};
use market_data::sources::{AggregatorSource, DbSource, DerivativesApiSource, SpotApiSource};
use market_data::{AggregatorClient, DataManager, ExchangeClient};
use recommendation_cache::{ComputeFn, QueryShape, RecommendationCache};
use smart_scheduler::{
    FallbackStrategy, SchedulerConfig, ShutdownManager, ShutdownPhase, SmartScheduler, TaskType,
};
use sqlx::SqlitePool;
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use tasks::{standard_shapes, CacheWarmupHandler, DataCleanupHandler, DataRefreshHandler};

/// Everything the core is made of, wired once at startup. Lower layers
/// never hold references back up; this struct is the only place the full
/// graph exists.
pub struct Services {
    pub pool: SqlitePool,
    pub store: Arc<KlineStore>,
    pub data_manager: Arc<DataManager>,
    pub indicator_cache: Arc<IndicatorCache>,
    pub backtest_db: Arc<BacktestDb>,
    pub engine: BacktestEngine,
    pub executor: Arc<StrategyExecutor>,
    pub recommendations: Arc<RecommendationCache>,
    pub scheduler: Arc<SmartScheduler>,
    pub fallback: Arc<FallbackStrategy>,
    pub shutdown: Arc<ShutdownManager>,
}

impl Services {
    pub async fn build(config: &ServerConfig) -> anyhow::Result<Self> {
        let pool = SqlitePool::connect(&config.database_url).await?;

        let store = Arc::new(KlineStore::new(pool.clone()));
        store.init_tables().await?;

        let exchange = Arc::new(ExchangeClient::new(config.exchange.clone()));
        let aggregator = Arc::new(AggregatorClient::new(config.aggregator_base.clone()));

        let sources: Vec<Arc<dyn MarketDataSource>> = vec![
            Arc::new(DbSource::new(store.clone())),
            Arc::new(SpotApiSource::new(exchange.clone())),
            Arc::new(DerivativesApiSource::new(exchange.clone())),
            Arc::new(AggregatorSource::new(aggregator)),
        ];
        let data_manager = Arc::new(DataManager::new(sources));

        let indicator_cache = Arc::new(IndicatorCache::new(pool.clone()));
        indicator_cache.init_tables().await?;

        let backtest_db = Arc::new(BacktestDb::new(pool.clone()));
        backtest_db.init_tables().await?;

        let engine = BacktestEngine::new(data_manager.clone());
        let executor =
            Arc::new(StrategyExecutor::new(data_manager.clone()).with_db(backtest_db.clone()));

        let fallback = Arc::new(FallbackStrategy::new());
        let shutdown = Arc::new(ShutdownManager::new());

        let redis = match &config.redis_url {
            Some(url) => recommendation_cache::connect_redis(url, config.cache_db_index).await,
            None => {
                tracing::info!("REDIS_URL not set; recommendation cache runs local-only");
                None
            }
        };

        let compute = recommendation_compute(
            data_manager.clone(),
            indicator_cache.clone(),
            config.symbols.clone(),
        );
        let recommendations =
            Arc::new(RecommendationCache::new(compute).with_redis(redis));

        let scheduler = SmartScheduler::new(SchedulerConfig::default(), &shutdown.root_token());

        Ok(Self {
            pool,
            store,
            data_manager,
            indicator_cache,
            backtest_db,
            engine,
            executor,
            recommendations,
            scheduler,
            fallback,
            shutdown,
        })
    }

    fn register_periodic_tasks(&self, config: &ServerConfig) {
        self.scheduler.set_periodic_handler(
            TaskType::PerformanceUpdate,
            Arc::new(DataRefreshHandler {
                manager: self.data_manager.clone(),
                store: self.store.clone(),
                fallback: self.fallback.clone(),
                symbols: config.symbols.clone(),
            }),
        );
        self.scheduler.set_periodic_handler(
            TaskType::CacheWarmup,
            Arc::new(CacheWarmupHandler {
                recommendations: self.recommendations.clone(),
            }),
        );
        self.scheduler.set_periodic_handler(
            TaskType::DataCleanup,
            Arc::new(DataCleanupHandler {
                store: self.store.clone(),
                indicator_cache: self.indicator_cache.clone(),
                fallback: self.fallback.clone(),
                retention_days: config.retention_days,
            }),
        );
    }

    fn register_cleanups(&self) {
        // Caches flush while request paths are still allowed to finish.
        let indicator_cache = self.indicator_cache.clone();
        self.shutdown
            .register("indicator-cache", 90, ShutdownPhase::PreShutdown, move || {
                let cache = indicator_cache.clone();
                async move { cache.flush().await }
            });

        let scheduler = self.scheduler.clone();
        self.shutdown
            .register("worker-pool", 80, ShutdownPhase::Shutdown, move || {
                let scheduler = scheduler.clone();
                async move { scheduler.stop() }
            });

        let pool = self.pool.clone();
        self.shutdown
            .register("database", 100, ShutdownPhase::PostShutdown, move || {
                let pool = pool.clone();
                async move {
                    pool.close().await;
                    tracing::info!("Database pool closed");
                }
            });
    }
}

/// Builds the recommendation list for one query shape: score each tracked
/// symbol's indicator bundle, filter, sort and trim.
fn recommendation_compute(
    data_manager: Arc<DataManager>,
    indicator_cache: Arc<IndicatorCache>,
    symbols: Vec<String>,
) -> ComputeFn {
    Arc::new(move |shape: QueryShape| {
        let data_manager = data_manager.clone();
        let indicator_cache = indicator_cache.clone();
        let symbols = symbols.clone();

        Box::pin(async move {
            let token = tokio_util::sync::CancellationToken::new();
            let hours = shape.time_range_hours.max(7 * 24) as i64;
            let range = TimeRange::new(Utc::now() - Duration::hours(hours), Utc::now());

            let mut items = Vec::new();
            for symbol in &symbols {
                let bars = match data_manager
                    .get_historical_data(symbol, MarketKind::Spot, Interval::Hour1, range, &token)
                    .await
                {
                    Ok((bars, _)) => bars,
                    Err(e) => {
                        tracing::debug!("Skipping {symbol} in recommendations: {e}");
                        continue;
                    }
                };

                let bundle = indicator_cache
                    .get_indicators(symbol, MarketKind::Spot, Interval::Hour1, bars.len(), &bars)
                    .await;

                if bundle.signal_strength >= shape.min_score {
                    items.push(serde_json::json!({
                        "symbol": symbol,
                        "score": bundle.signal_strength,
                        "trend": bundle.trend,
                        "risk_level": bundle.risk_level,
                        "rsi": bundle.rsi,
                    }));
                }
            }

            items.sort_by(|a, b| {
                let score = |v: &serde_json::Value| v["score"].as_f64().unwrap_or(0.0);
                score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal)
            });
            items.truncate(shape.limit as usize);

            Ok(serde_json::json!({
                "kind": shape.kind,
                "generated_at": Utc::now().to_rfc3339(),
                "items": items,
            }))
        })
    })
}

/// Run the core until a termination signal. Returns the process exit
/// code: 0 on a clean drain, 1 when shutdown overruns its budget.
pub async fn run() -> anyhow::Result<i32> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(
        "Starting analytics core ({} symbols, db {})",
        config.symbols.len(),
        config.database_url
    );

    let services = Services::build(&config).await?;
    services.register_periodic_tasks(&config);
    services.register_cleanups();

    services.scheduler.start();
    let precompute_workers = services
        .recommendations
        .spawn_precompute_workers(2, &services.shutdown.root_token());
    tracing::info!(
        "Core running ({} precompute workers)",
        precompute_workers.len()
    );

    // Initial warmup so the first queries do not all miss.
    services.recommendations.warmup(standard_shapes()).await;

    wait_for_signal().await;

    match services.shutdown.shutdown().await {
        Ok(()) => Ok(0),
        Err(_) => Ok(1),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl-C received");
    }
}
