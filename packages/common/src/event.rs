use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::EventStatus;

/// An event staged in the producer's outbox, as seen by every layer of the relay.
///
/// Producers insert rows in the same transaction as their business write;
/// the relay claims, publishes and retires them. Rows are never deleted by
/// the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Producer-assigned identifier, treated as the primary key.
    pub id: String,
    /// Broker destination: AMQP exchange or Pub/Sub topic.
    pub entity: String,
    /// Destination kind ("topic", "direct", "fanout", "headers"). AMQP only.
    pub entity_type: String,
    /// AMQP routing key; Pub/Sub ordering key.
    pub routing_key: String,
    /// Opaque message body. The AMQP adapter publishes it as application/json.
    pub payload: Vec<u8>,
    /// Application headers. Trace-context keys are merged in at publish time.
    pub headers: HashMap<String, String>,
    pub status: EventStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    /// Doubles as the claim-lock timestamp while the event is `processing`.
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Create a new event with required fields and staging defaults.
    pub fn new(
        id: impl Into<String>,
        entity: impl Into<String>,
        entity_type: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            entity: entity.into(),
            entity_type: entity_type.into(),
            routing_key: routing_key.into(),
            payload,
            headers,
            status: EventStatus::Pending,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }
}
