mod config;
mod domain;
mod error;
mod handlers;
mod jobs;
mod repository;

use std::sync::Arc;

use dead_letter_queue::{OutboxDlqAdapter, SqlxDlqRepository};
use inbox::SqlxInboxRepository;
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;
use saga_orchestrator::SqlxSagaRepository;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transactional_outbox::{KafkaOutboxPublisher, SqlxOutboxRepository};

use config::Config;
use error::AppError;
use handlers::HandlerContext;
use repository::SqlxOrderRepository;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db_config = db_pool::DbConfig::for_service("order-service");
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

    let saga_repo = Arc::new(SqlxSagaRepository::new(pool.clone()));
    let outbox_repo = Arc::new(SqlxOutboxRepository::new(pool.clone(), "order-service".to_string()));
    let inbox_repo = Arc::new(SqlxInboxRepository::new(pool.clone()));
    let dlq_repo = Arc::new(SqlxDlqRepository::new(pool.clone()));
    let order_repo = Arc::new(SqlxOrderRepository::new(pool.clone()));

    let publisher = Arc::new(KafkaOutboxPublisher::new(
        producer,
        config.bus_topic_prefix.clone(),
        "order-service".to_string(),
    ));
    let dlq_sink = Arc::new(OutboxDlqAdapter::new(dlq_repo));

    let ctx = HandlerContext {
        pool: pool.clone(),
        saga_repo: saga_repo.clone(),
        outbox_repo: outbox_repo.clone(),
        inbox_repo: inbox_repo.clone(),
        order_repo,
    };

    let outbox_task = jobs::spawn_outbox_processor(outbox_repo.clone(), publisher, dlq_sink, &config);
    let consumer_task = jobs::spawn_event_consumer(ctx, &config);
    let scanner_task = jobs::spawn_saga_timeout_scanner(saga_repo, &config);
    let purge_task = jobs::spawn_retention_purge(outbox_repo, inbox_repo, &config);

    tracing::info!("order-service started");

    tokio::select! {
        _ = outbox_task => tracing::error!("outbox processor task ended unexpectedly"),
        _ = consumer_task => tracing::error!("event consumer task ended unexpectedly"),
        _ = scanner_task => tracing::error!("saga timeout scanner task ended unexpectedly"),
        _ = purge_task => tracing::error!("retention purge task ended unexpectedly"),
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }

    Ok(())
}
