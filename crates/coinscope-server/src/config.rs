use market_data::ExchangeConfig;

/// Environment-driven configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub symbols: Vec<String>,
    pub exchange: ExchangeConfig,
    pub aggregator_base: String,
    pub redis_url: Option<String>,
    pub cache_db_index: u32,
    pub retention_days: i64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let symbols = std::env::var("COINSCOPE_SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT,ETHUSDT,SOLUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let exchange = ExchangeConfig {
            spot_base: std::env::var("EXCHANGE_SPOT_BASE")
                .unwrap_or_else(|_| "https://api.binance.com".to_string()),
            derivatives_base: std::env::var("EXCHANGE_DERIVATIVES_BASE")
                .unwrap_or_else(|_| "https://dapi.binance.com".to_string()),
            api_key: std::env::var("EXCHANGE_API_KEY").ok(),
            api_secret: std::env::var("EXCHANGE_API_SECRET").ok(),
            rate_limit_per_min: std::env::var("EXCHANGE_RATE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1100),
        };

        Self {
            database_url: std::env::var("COINSCOPE_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://coinscope.db?mode=rwc".to_string()),
            symbols,
            exchange,
            aggregator_base: std::env::var("AGGREGATOR_BASE")
                .unwrap_or_else(|_| "https://api.coingecko.com".to_string()),
            redis_url: std::env::var("REDIS_URL").ok(),
            cache_db_index: std::env::var("CACHE_DB_INDEX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            retention_days: std::env::var("COINSCOPE_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(180),
        }
    }
}
