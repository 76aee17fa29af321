//! Background workers: the outbox processor draining to Kafka, the
//! dispatching bus consumer routing inbound reservation commands to their
//! handlers, the overdue-reservation expiration scan, and the outbox/inbox
//! retention purge.

use std::sync::Arc;
use std::time::Duration;

use event_bus::{ConsumerConfig, HandlerRegistry};
use inbox::InboxRepository;
use inventory_reservation::ProductRepository;
use tokio::task::JoinHandle;
use transactional_outbox::{DlqSink, OutboxProcessor, OutboxPublisher, OutboxRepository};
use tracing::{error, info};

use crate::config::Config;
use crate::handlers::{
    handle_confirm_reservation, handle_inventory_reservation_requested, handle_release_reservation, HandlerContext,
};

/// Spawn the outbox processor as a background task.
pub fn spawn_outbox_processor<R, P, D>(repository: Arc<R>, publisher: Arc<P>, dlq: Arc<D>, config: &Config) -> JoinHandle<()>
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
pub fn spawn_event_consumer<P, O, IB>(ctx: HandlerContext<P, O, IB>, config: &Config) -> JoinHandle<()>
where
    P: ProductRepository + 'static,
    O: OutboxRepository + 'static,
    IB: InboxRepository + 'static,
{
    let order_topic = event_bus::topic_name(&config.bus_topic_prefix, "order-service");

    let registry = HandlerRegistry::new()
        .register("InventoryReservationRequested", {
            let ctx = ctx.clone();
            move |msg| handle_inventory_reservation_requested(ctx.clone(), msg)
        })
        .register("ReleaseReservation", {
            let ctx = ctx.clone();
            move |msg| handle_release_reservation(ctx.clone(), msg)
        })
        .register("ConfirmReservation", move |msg| handle_confirm_reservation(ctx.clone(), msg));

    let consumer_config = ConsumerConfig {
        bootstrap_servers: config.bus_bootstrap_servers.clone(),
        group_id: "inventory-service".to_string(),
        topics: vec![order_topic],
    };

    tokio::spawn(async move {
        if let Err(e) = event_bus::run_dispatching_consumer(consumer_config, registry).await {
            error!(error = ?e, "event consumer exited");
        }
    })
}

/// Periodically expire overdue `Active` reservations.
pub fn spawn_expiration_scanner<P>(product_repo: Arc<P>, config: &Config) -> JoinHandle<()>
where
    P: ProductRepository + 'static,
{
    let interval = config.expiration_scan_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match inventory_reservation::expire_due_reservations(&*product_repo).await {
                Ok(events) if !events.is_empty() => info!(expired_count = events.len(), "expired overdue reservations"),
                Ok(_) => {}
                Err(e) => error!(error = ?e, "reservation expiration scan failed"),
            }
        }
    })
}

/// Periodically purge processed outbox rows and processed inbox rows older
/// than their configured retention.
pub fn spawn_retention_purge<R, IB>(outbox_repo: Arc<R>, inbox_repo: Arc<IB>, config: &Config) -> JoinHandle<()>
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
