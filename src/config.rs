//! Process configuration, loaded from the environment the same way the
//! teacher's `models::Config::from_env` does: `dotenv` first, then
//! `std::env::var` per field with a parsed fallback default.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,

    pub feed_provider: String,
    pub feed_source: String,
    pub feed_subjects: Vec<String>,
    pub feed_kind: String,
    pub feed_granularity: String,
    pub feed_poll_seconds: u64,
    pub feed_backfill_minutes: i64,
    pub feed_candles_window: usize,
    pub feed_record_ttl_days: i64,

    pub model_runner_host: String,
    pub model_runner_port: u16,
    pub model_runner_timeout_seconds: u64,

    pub crunch_id: String,
    pub checkpoint_interval_seconds: u64,
    pub resolver_max_retry_hours: i64,
    pub predict_every_seconds: i64,

    pub report_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./coordinator.db".to_string());

        let feed_provider = std::env::var("FEED_PROVIDER").unwrap_or_else(|_| "mock".to_string());
        let feed_source = std::env::var("FEED_SOURCE").unwrap_or_else(|_| feed_provider.clone());
        let feed_subjects = std::env::var("FEED_SUBJECTS")
            .unwrap_or_else(|_| "BTC".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        let feed_kind = std::env::var("FEED_KIND").unwrap_or_else(|_| "candle".to_string());
        let feed_granularity = std::env::var("FEED_GRANULARITY").unwrap_or_else(|_| "1m".to_string());

        let feed_poll_seconds = env_parse("FEED_POLL_SECONDS", 5);
        let feed_backfill_minutes = env_parse("FEED_BACKFILL_MINUTES", 180);
        let feed_candles_window = env_parse("FEED_CANDLES_WINDOW", 60);
        let feed_record_ttl_days = env_parse("FEED_RECORD_TTL_DAYS", 30);

        let model_runner_host =
            std::env::var("MODEL_RUNNER_NODE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let model_runner_port = env_parse("MODEL_RUNNER_NODE_PORT", 9000);
        let model_runner_timeout_seconds = env_parse("MODEL_RUNNER_TIMEOUT_SECONDS", 10);

        let crunch_id = std::env::var("CRUNCH_ID").unwrap_or_else(|_| "local-crunch".to_string());
        let checkpoint_interval_seconds = env_parse("CHECKPOINT_INTERVAL_SECONDS", 3600);
        let resolver_max_retry_hours = env_parse("RESOLVER_MAX_RETRY_HOURS", 24);
        let predict_every_seconds = env_parse("PREDICT_EVERY_SECONDS", 60);

        let report_port = env_parse("PORT", 8080);

        Ok(Self {
            database_path,
            feed_provider,
            feed_source,
            feed_subjects,
            feed_kind,
            feed_granularity,
            feed_poll_seconds,
            feed_backfill_minutes,
            feed_candles_window,
            feed_record_ttl_days,
            model_runner_host,
            model_runner_port,
            model_runner_timeout_seconds,
            crunch_id,
            checkpoint_interval_seconds,
            resolver_max_retry_hours,
            predict_every_seconds,
            report_port,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
