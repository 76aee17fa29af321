//! Wire envelope for integration events exchanged between services.
//!
//! Every event that crosses a service boundary is wrapped in [`EventEnvelope`]
//! before it is handed to the outbox. The envelope owns the metadata the bus
//! and the inbox need (`eventId`, `aggregateId`, `correlationId`, ...); the
//! payload stays a plain domain type that only needs `Serialize`/`Deserialize`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Implemented by every event payload type that can be wrapped in an
/// [`EventEnvelope`]. `EVENT_TYPE` and `PRODUCER` are associated constants
/// rather than constructor arguments so the producing service is a
/// compile-time fact of the type, not something a call site can get wrong.
pub trait IntegrationEvent {
    /// Stable string identifying this event's shape, e.g. `"OrderCreated"`.
    const EVENT_TYPE: &'static str;

    /// Schema version for this event shape, e.g. `"1.0"`.
    const SCHEMA_VERSION: &'static str;

    /// Name of the service that produces this event.
    const PRODUCER: &'static str;

    /// The aggregate this event is about; doubles as the bus partition key.
    fn aggregate_id(&self) -> Uuid;
}

/// Immutable envelope around a typed event payload.
///
/// Envelope identity is `event_id`; two envelopes are equal iff their
/// `event_id`s match, regardless of payload content.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub schema_version: String,
    pub producer: String,
    pub occurred_on: DateTime<Utc>,
    pub correlation_id: String,
    pub causation_id: Option<Uuid>,
    pub traceparent: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub payload: T,
}

impl<T> PartialEq for EventEnvelope<T> {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl<T> Eq for EventEnvelope<T> {}

impl<T: IntegrationEvent> EventEnvelope<T> {
    /// Wraps `payload` in a fresh envelope, stamping `event_id`/`occurred_on`
    /// and the payload type's declared `event_type`/`schema_version`/`producer`.
    pub fn new(payload: T, correlation_id: impl Into<String>) -> Self {
        let aggregate_id = payload.aggregate_id();
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            event_type: T::EVENT_TYPE.to_string(),
            schema_version: T::SCHEMA_VERSION.to_string(),
            producer: T::PRODUCER.to_string(),
            occurred_on: Utc::now(),
            correlation_id: correlation_id.into(),
            causation_id: None,
            traceparent: None,
            tenant_id: None,
            headers: HashMap::new(),
            payload,
        }
    }

    /// Same as [`EventEnvelope::new`] but records the event/command that
    /// directly caused this one, and carries its trace context forward.
    pub fn caused_by(
        payload: T,
        correlation_id: impl Into<String>,
        causation_id: Uuid,
        traceparent: Option<String>,
    ) -> Self {
        let mut envelope = Self::new(payload, correlation_id);
        envelope.causation_id = Some(causation_id);
        envelope.traceparent = traceparent;
        envelope
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

impl<T> EventEnvelope<T> {
    /// UTF-8 string form of `aggregate_id`, used verbatim as the bus partition key.
    pub fn partition_key(&self) -> String {
        self.aggregate_id.to_string()
    }

    /// The three message headers the bus client attaches to every publish:
    /// `event-type`, `event-id`, `timestamp` (RFC3339).
    pub fn bus_headers(&self) -> [(&'static str, String); 3] {
        [
            ("event-type", self.event_type.clone()),
            ("event-id", self.event_id.to_string()),
            ("timestamp", self.occurred_on.to_rfc3339()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct OrderCreated {
        order_id: Uuid,
        total_cents: i64,
    }

    impl IntegrationEvent for OrderCreated {
        const EVENT_TYPE: &'static str = "OrderCreated";
        const SCHEMA_VERSION: &'static str = "1.0";
        const PRODUCER: &'static str = "order-service";

        fn aggregate_id(&self) -> Uuid {
            self.order_id
        }
    }

    #[test]
    fn new_envelope_stamps_type_and_producer_from_payload() {
        let order_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            OrderCreated {
                order_id,
                total_cents: 2000,
            },
            "corr-1",
        );

        assert_eq!(envelope.event_type, "OrderCreated");
        assert_eq!(envelope.producer, "order-service");
        assert_eq!(envelope.schema_version, "1.0");
        assert_eq!(envelope.aggregate_id, order_id);
        assert_eq!(envelope.partition_key(), order_id.to_string());
        assert!(envelope.causation_id.is_none());
    }

    #[test]
    fn equality_is_by_event_id_alone() {
        let order_id = Uuid::new_v4();
        let payload = OrderCreated {
            order_id,
            total_cents: 2000,
        };
        let a = EventEnvelope::new(payload.clone(), "corr-1");
        let mut b = a.clone();
        b.payload.total_cents = 9_999_999;
        assert_eq!(a, b);

        let c = EventEnvelope::new(payload, "corr-1");
        assert_ne!(a, c);
    }

    #[test]
    fn json_round_trip_preserves_all_fields() {
        let order_id = Uuid::new_v4();
        let causation = Uuid::new_v4();
        let envelope = EventEnvelope::caused_by(
            OrderCreated {
                order_id,
                total_cents: 2000,
            },
            "corr-1",
            causation,
            Some("00-trace-00-01".to_string()),
        )
        .with_header("x-shard", "3")
        .with_tenant("tenant-a");

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"eventId\""));
        assert!(json.contains("\"aggregateId\""));
        assert!(json.contains("\"causationId\""));

        let round_tripped: EventEnvelope<OrderCreated> = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped.event_id, envelope.event_id);
        assert_eq!(round_tripped.correlation_id, envelope.correlation_id);
        assert_eq!(round_tripped.causation_id, Some(causation));
        assert_eq!(round_tripped.headers.get("x-shard"), Some(&"3".to_string()));
        assert_eq!(round_tripped.tenant_id, Some("tenant-a".to_string()));
        assert_eq!(round_tripped.payload, envelope.payload);
    }
}
