use std::time::Duration;

use dotenvy::dotenv;
use std::env;

use crate::error::AppError;

/// Everything the binary needs to wire its background workers together.
/// Loaded once at startup; nothing in this process re-reads the
/// environment after `main` finishes constructing this.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_bootstrap_servers: String,
    pub bus_topic_prefix: String,
    pub outbox_batch_size: i64,
    pub outbox_max_retries: i32,
    pub outbox_poll_interval: Duration,
    pub outbox_retention: Duration,
    pub inbox_retention: Duration,
    pub saga_scan_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        // DATABASE_URL itself is read by `db_pool::DbConfig::for_service`;
        // checked here too so a missing value fails fast at startup instead
        // of inside the first pool-creation attempt.
        env::var("DATABASE_URL").map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let bus_bootstrap_servers =
            env::var("BUS_BOOTSTRAP_SERVERS").unwrap_or_else(|_| "localhost:9092".to_string());
        let bus_topic_prefix = env::var("BUS_TOPIC_PREFIX").unwrap_or_else(|_| "domain".to_string());

        let outbox_batch_size = env::var("OUTBOX_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        let outbox_max_retries = env::var("OUTBOX_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(transactional_outbox::MAX_RETRIES);
        let outbox_poll_interval = Duration::from_secs(
            env::var("OUTBOX_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
        );
        let outbox_retention = Duration::from_secs(
            env::var("OUTBOX_RETENTION_DAYS")
                .ok()
                .and_then(|v: String| v.parse::<u64>().ok())
                .unwrap_or(7)
                * 86_400,
        );
        let inbox_retention = Duration::from_secs(
            env::var("INBOX_RETENTION_DAYS")
                .ok()
                .and_then(|v: String| v.parse::<u64>().ok())
                .unwrap_or(7)
                * 86_400,
        );
        let saga_scan_interval = Duration::from_secs(
            env::var("SAGA_SCAN_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| saga_orchestrator::default_scan_interval().as_secs()),
        );

        Ok(Self {
            bus_bootstrap_servers,
            bus_topic_prefix,
            outbox_batch_size,
            outbox_max_retries,
            outbox_poll_interval,
            outbox_retention,
            inbox_retention,
            saga_scan_interval,
        })
    }
}
