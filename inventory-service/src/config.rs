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
    pub expiration_scan_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

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
        let expiration_scan_interval = env::var("EXPIRATION_SCAN_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(inventory_reservation::MIN_EXPIRATION_SCAN_INTERVAL)
            .max(inventory_reservation::MIN_EXPIRATION_SCAN_INTERVAL);

        Ok(Self {
            bus_bootstrap_servers,
            bus_topic_prefix,
            outbox_batch_size,
            outbox_max_retries,
            outbox_poll_interval,
            outbox_retention,
            inbox_retention,
            expiration_scan_interval,
        })
    }
}
