//! # Event Bus Client
//!
//! The producer half and the dispatching-consumer half of the Kafka wire
//! contract every service on this core speaks: topic `"<prefix>.<service>.events"`,
//! partition key `aggregateId`, headers `event-type`/`event-id`/`timestamp`.
//!
//! The outbox processor (`transactional-outbox`) owns its own narrower
//! publisher for the exactly-one-row-at-a-time path that runs inside its
//! poll loop. This crate is for everything else that talks to the bus
//! directly: ad-hoc/batch publishing, and the dispatching consumer that
//! routes an incoming message to the handler registered for its `event-type`
//! header.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

mod error;

pub use error::{BusError, BusResult};

/// `"<prefix>.<service>.events"`, shared by producer and consumer so the
/// two sides of the bus never disagree about a topic name.
pub fn topic_name(prefix: &str, service: &str) -> String {
    format!("{prefix}.{service}.events")
}

/// A single outgoing message: a pre-serialized `EventEnvelope<T>` payload
/// plus the metadata the bus needs for partitioning and headers. Building
/// this is the caller's job (typically via `event_envelope::EventEnvelope`)
/// so this crate stays agnostic of any particular payload type.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub occurred_on: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn publish(&self, topic: &str, message: &OutgoingMessage) -> BusResult<()>;

    async fn publish_batch(&self, topic: &str, messages: &[OutgoingMessage]) -> BusResult<()> {
        for message in messages {
            self.publish(topic, message).await?;
        }
        Ok(())
    }
}

/// Kafka-backed producer for direct (non-outbox) publishing, e.g. admin
/// tooling or tests that need to put a message on the bus without an
/// aggregate transaction behind it.
pub struct KafkaBusProducer {
    producer: FutureProducer,
}

impl KafkaBusProducer {
    /// `producer` MUST have `enable.idempotence=true` and `acks=all`, same
    /// requirement as the outbox's own publisher.
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl BusProducer for KafkaBusProducer {
    async fn publish(&self, topic: &str, message: &OutgoingMessage) -> BusResult<()> {
        let payload_str = serde_json::to_string(&message.payload)?;

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event-type",
                value: Some(message.event_type.as_bytes()),
            })
            .insert(Header {
                key: "event-id",
                value: Some(message.event_id.as_bytes()),
            })
            .insert(Header {
                key: "timestamp",
                value: Some(message.occurred_on.as_bytes()),
            });

        let record = FutureRecord::to(topic)
            .key(&message.aggregate_id)
            .payload(&payload_str)
            .headers(headers);

        self.producer
            .send(record, Duration::from_secs(10))
            .await
            .map_err(|(err, _)| BusError::Kafka(err))?;

        info!(event_id = %message.event_id, event_type = %message.event_type, topic, "message published to bus");
        Ok(())
    }
}

/// A decoded message handed to a registered handler: the `event-type`
/// header plus the raw JSON payload, not yet deserialized into a concrete
/// type (the handler owns that).
pub struct IncomingMessage {
    pub event_id: Option<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Handler = Arc<dyn Fn(IncomingMessage) -> HandlerFuture + Send + Sync>;

/// Registry of handlers keyed by `eventType` string, and the consumer loop
/// that dispatches to them.
///
/// One physical subscription per topic per service. An `eventType` with no
/// registered handler is logged and the offset is still committed — the
/// topic may be shared with a consumer group this registry doesn't model,
/// and a silently stalled partition is worse than a silently skipped event.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a given `eventType` string. Overwrites any
    /// previously registered handler for the same type.
    pub fn register<F, Fut>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let event_type = event_type.into();
        self.handlers
            .insert(event_type, Arc::new(move |msg| Box::pin(handler(msg))));
        self
    }
}

/// Consumer configuration. `group_id` is the Kafka consumer group, which is
/// distinct from (though often named after) the inbox `consumer` identity a
/// registered handler uses internally for deduplication.
pub struct ConsumerConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub topics: Vec<String>,
}

/// Subscribe to `config.topics` and dispatch each message to the handler
/// registered for its `event-type` header. Offsets commit only after the
/// handler for a message returns (successfully or with a permanent
/// failure); a handler error that represents exhausted retries still
/// commits so the partition doesn't stall — by the time a handler returns
/// an error here it has already run its own retry/DLQ policy (e.g. via
/// `inbox::consume`).
pub async fn run_dispatching_consumer(
    config: ConsumerConfig,
    registry: HandlerRegistry,
) -> BusResult<()> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "30000")
        .create()
        .map_err(BusError::Kafka)?;

    let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
    consumer.subscribe(&topics).map_err(BusError::Kafka)?;

    info!(group_id = %config.group_id, topics = ?config.topics, "dispatching consumer subscribed");

    loop {
        match consumer.recv().await {
            Ok(borrowed) => {
                let event_type = borrowed
                    .headers()
                    .and_then(|headers| {
                        headers.iter().find_map(|h| {
                            (h.key == "event-type")
                                .then(|| h.value.map(|v| String::from_utf8_lossy(v).into_owned()))
                                .flatten()
                        })
                    })
                    .unwrap_or_default();

                let event_id = borrowed.headers().and_then(|headers| {
                    headers.iter().find_map(|h| {
                        (h.key == "event-id")
                            .then(|| h.value.map(|v| String::from_utf8_lossy(v).into_owned()))
                            .flatten()
                    })
                });

                let payload = match borrowed.payload() {
                    Some(bytes) => match serde_json::from_slice::<serde_json::Value>(bytes) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(error = ?e, "failed to parse message payload as JSON, skipping");
                            let _ = consumer.commit_message(&borrowed, CommitMode::Async);
                            continue;
                        }
                    },
                    None => {
                        warn!("received message with empty payload, skipping");
                        let _ = consumer.commit_message(&borrowed, CommitMode::Async);
                        continue;
                    }
                };

                match registry.handlers.get(&event_type) {
                    Some(handler) => {
                        let message = IncomingMessage {
                            event_id: event_id.clone(),
                            event_type: event_type.clone(),
                            payload,
                        };
                        if let Err(e) = handler(message).await {
                            error!(event_type = %event_type, event_id = ?event_id, error = ?e, "handler returned error, committing offset anyway");
                        } else {
                            debug!(event_type = %event_type, event_id = ?event_id, "message handled");
                        }
                    }
                    None => {
                        debug!(event_type = %event_type, "no handler registered for event type, skipping");
                    }
                }

                if let Err(e) = consumer.commit_message(&borrowed, CommitMode::Async) {
                    warn!(error = ?e, "failed to commit offset");
                }
            }
            Err(e) => {
                error!(error = ?e, "kafka consumer error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_follows_prefix_service_events() {
        assert_eq!(topic_name("domain", "order-service"), "domain.order-service.events");
    }

    #[tokio::test]
    async fn registry_dispatches_to_the_registered_handler() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let registry = HandlerRegistry::new().register("OrderCreated", move |_msg| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let handler = registry.handlers.get("OrderCreated").expect("handler registered");
        handler(IncomingMessage {
            event_id: None,
            event_type: "OrderCreated".to_string(),
            payload: serde_json::json!({}),
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_event_type_has_no_handler() {
        let registry = HandlerRegistry::new().register("OrderCreated", |_msg| async { Ok(()) });
        assert!(registry.handlers.get("StockReserved").is_none());
    }
}
