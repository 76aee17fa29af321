//! Background workers: the outbox processor draining to Kafka, the
//! dispatching bus consumer routing inbound saga events to their handlers,
//! the saga timeout scanner, and the outbox/inbox retention purge.

use std::sync::Arc;
use std::time::Duration;

use event_bus::{ConsumerConfig, HandlerRegistry};
use inbox::InboxRepository;
use saga_orchestrator::SagaRepository;
use tokio::task::JoinHandle;
use transactional_outbox::{DlqSink, OutboxProcessor, OutboxPublisher, OutboxRepository};
use tracing::{error, info};

use crate::config::Config;
use crate::handlers::{
    handle_inventory_reservation_confirmed, handle_inventory_reservation_failed,
    handle_payment_confirmed, handle_payment_failed, handle_release_completed, HandlerContext,
};
use crate::repository::OrderRepository;

/// Spawn the outbox processor as a background task.
pub fn spawn_outbox_processor<R, P, D>(
    repository: Arc<R>,
    publisher: Arc<P>,
    dlq: Arc<D>,
    config: &Config,
) -> JoinHandle<()>
where
    R: OutboxRepository + 'static,
    P: OutboxPublisher + 'static,
    D: DlqSink + 'static,
{
    let processor = OutboxProcessor::new(
        repository,
        publisher,
        config.outbox_batch_size,
        config.outbox_poll_interval,
        config.outbox_max_retries,
    )
    .with_dlq(dlq);

    tokio::spawn(async move {
        if let Err(e) = processor.start().await {
            error!(error = ?e, "outbox processor exited");
        }
    })
}

/// Spawn the dispatching bus consumer wired with this service's inbox
/// handlers, routed by `event-type` header.
pub fn spawn_event_consumer<S, O, IB, R>(
    ctx: HandlerContext<S, O, IB, R>,
    config: &Config,
) -> JoinHandle<()>
where
    S: SagaRepository + 'static,
    O: OutboxRepository + 'static,
    IB: InboxRepository + 'static,
    R: OrderRepository + 'static,
{
    let inventory_topic = event_bus::topic_name(&config.bus_topic_prefix, "inventory-service");
    let payment_topic = event_bus::topic_name(&config.bus_topic_prefix, "payment-service");

    let registry = {
        let ctx = ctx.clone();
        HandlerRegistry::new()
            .register("InventoryReservationConfirmed", {
                let ctx = ctx.clone();
                move |msg| handle_inventory_reservation_confirmed(ctx.clone(), msg)
            })
            .register("InventoryReservationFailed", {
                let ctx = ctx.clone();
                move |msg| handle_inventory_reservation_failed(ctx.clone(), msg)
            })
            .register("ReleaseCompleted", {
                let ctx = ctx.clone();
                move |msg| handle_release_completed(ctx.clone(), msg)
            })
            .register("PaymentConfirmed", {
                let ctx = ctx.clone();
                move |msg| handle_payment_confirmed(ctx.clone(), msg)
            })
            .register("PaymentFailed", move |msg| handle_payment_failed(ctx.clone(), msg))
    };

    let consumer_config = ConsumerConfig {
        bootstrap_servers: config.bus_bootstrap_servers.clone(),
        group_id: "order-service".to_string(),
        topics: vec![inventory_topic, payment_topic],
    };

    tokio::spawn(async move {
        if let Err(e) = event_bus::run_dispatching_consumer(consumer_config, registry).await {
            error!(error = ?e, "event consumer exited");
        }
    })
}

/// Periodically scan for timed-out saga steps and drive them into
/// compensation.
pub fn spawn_saga_timeout_scanner<S>(saga_repo: Arc<S>, config: &Config) -> JoinHandle<()>
where
    S: SagaRepository + 'static,
{
    let interval = config.saga_scan_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match saga_orchestrator::scan_timeouts(&*saga_repo).await {
                Ok(count) if count > 0 => info!(expired_count = count, "expired timed-out saga steps"),
                Ok(_) => {}
                Err(e) => error!(error = ?e, "saga timeout scan failed"),
            }
        }
    })
}

/// Periodically purge processed outbox rows and processed inbox rows older
/// than their configured retention.
pub fn spawn_retention_purge<R, IB>(
    outbox_repo: Arc<R>,
    inbox_repo: Arc<IB>,
    config: &Config,
) -> JoinHandle<()>
where
    R: OutboxRepository + 'static,
    IB: InboxRepository + 'static,
{
    let outbox_retention = config.outbox_retention;
    let inbox_retention = config.inbox_retention;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            match outbox_repo.purge_processed_older_than(outbox_retention).await {
                Ok(count) if count > 0 => info!(purged_count = count, "purged processed outbox rows"),
                Ok(_) => {}
                Err(e) => error!(error = ?e, "outbox retention purge failed"),
            }
            match inbox_repo.purge_older_than(inbox_retention).await {
                Ok(count) if count > 0 => info!(purged_count = count, "purged processed inbox rows"),
                Ok(_) => {}
                Err(e) => error!(error = ?e, "inbox retention purge failed"),
            }
        }
    })
}
