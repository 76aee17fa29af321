mod config;
mod error;
mod events;
mod handlers;
mod jobs;

use std::sync::Arc;

use dead_letter_queue::{OutboxDlqAdapter, SqlxDlqRepository};
use inbox::SqlxInboxRepository;
use inventory_reservation::SqlxProductRepository;
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transactional_outbox::{KafkaOutboxPublisher, SqlxOutboxRepository};

use config::Config;
use error::AppError;
use handlers::HandlerContext;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db_config = db_pool::DbConfig::for_service("inventory-service");
    db_config.log_config();
    let pool = db_pool::create_pool(db_config).await?;
    db_pool::migrate(&pool, "./migrations").await.map_err(|e| AppError::Config(e.to_string()))?;

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.bus_bootstrap_servers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("max.in.flight.requests.per.connection", "5")
        .create()
        .map_err(|e| AppError::Config(format!("failed to build kafka producer: {e}")))?;

    let product_repo = Arc::new(SqlxProductRepository::new(pool.clone()));
    let outbox_repo = Arc::new(SqlxOutboxRepository::new(pool.clone(), "inventory-service".to_string()));
    let inbox_repo = Arc::new(SqlxInboxRepository::new(pool.clone()));
    let dlq_repo = Arc::new(SqlxDlqRepository::new(pool.clone()));

    let publisher = Arc::new(KafkaOutboxPublisher::new(
        producer,
        config.bus_topic_prefix.clone(),
        "inventory-service".to_string(),
    ));
    let dlq_sink = Arc::new(OutboxDlqAdapter::new(dlq_repo));

    let ctx = HandlerContext {
        pool: pool.clone(),
        product_repo: product_repo.clone(),
        outbox_repo: outbox_repo.clone(),
        inbox_repo: inbox_repo.clone(),
    };

    let outbox_task = jobs::spawn_outbox_processor(outbox_repo.clone(), publisher, dlq_sink, &config);
    let consumer_task = jobs::spawn_event_consumer(ctx, &config);
    let expiration_task = jobs::spawn_expiration_scanner(product_repo, &config);
    let purge_task = jobs::spawn_retention_purge(outbox_repo, inbox_repo, &config);

    tracing::info!("inventory-service started");

    tokio::select! {
        _ = outbox_task => tracing::error!("outbox processor task ended unexpectedly"),
        _ = consumer_task => tracing::error!("event consumer task ended unexpectedly"),
        _ = expiration_task => tracing::error!("reservation expiration scanner task ended unexpectedly"),
        _ = purge_task => tracing::error!("retention purge task ended unexpectedly"),
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }

    Ok(())
}
