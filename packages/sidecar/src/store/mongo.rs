use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventStatus, OutboxEvent, RetryPolicy};
use mongodb::bson::{doc, DateTime as BsonDateTime};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DbSettings;

use super::{OutboxRepository, StoreError};

/// Document backend. Mongo has no skip-lock select, so the claim is
/// optimistic: candidates are selected, then each claim is a conditional
/// update matching the `(id, status, updated_at)` snapshot. A replica that
/// matches zero documents lost the race and discards the candidate.
pub struct MongoRepository {
    collection: Collection<EventDocument>,
    policy: RetryPolicy,
}

/// BSON shape of an outbox document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventDocument {
    id: String,
    entity: String,
    entity_type: String,
    routing_key: String,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    #[serde(default)]
    headers: HashMap<String, String>,
    status: EventStatus,
    retry_count: i32,
    created_at: BsonDateTime,
    updated_at: BsonDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sent_at: Option<BsonDateTime>,
}

impl EventDocument {
    /// Convert a selected candidate into its post-claim domain event.
    fn into_claimed(self, claimed_at: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id: self.id,
            entity: self.entity,
            entity_type: self.entity_type,
            routing_key: self.routing_key,
            payload: self.payload,
            headers: self.headers,
            status: EventStatus::Processing,
            retry_count: self.retry_count + 1,
            created_at: self.created_at.to_chrono(),
            updated_at: claimed_at,
            sent_at: self.sent_at.map(|t| t.to_chrono()),
        }
    }
}

impl MongoRepository {
    pub async fn connect(settings: &DbSettings, policy: RetryPolicy) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(&settings.uri).await?;
        let collection = client
            .database(&settings.name)
            .collection(&settings.collection);
        Ok(Self { collection, policy })
    }
}

#[async_trait]
impl OutboxRepository for MongoRepository {
    async fn fetch_pending(&self, batch_size: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let now = Utc::now();
        let reclaim_cutoff = BsonDateTime::from_chrono(
            now - chrono::Duration::seconds(self.policy.lock_expiration().as_secs() as i64),
        );
        let claimed_at = BsonDateTime::from_chrono(now);

        let filter = doc! {
            "$or": [
                { "status": EventStatus::Pending.as_str() },
                {
                    "status": EventStatus::Processing.as_str(),
                    "updated_at": { "$lt": reclaim_cutoff },
                },
            ],
        };

        let mut cursor = self
            .collection
            .find(filter)
            .sort(doc! { "updated_at": 1 })
            .limit(batch_size as i64)
            .await?;

        let mut claimed = Vec::new();
        while cursor.advance().await? {
            let candidate: EventDocument = cursor.deserialize_current()?;

            if !self
                .policy
                .retry_due(candidate.retry_count, candidate.updated_at.to_chrono(), now)
            {
                continue;
            }

            let snapshot = doc! {
                "id": &candidate.id,
                "status": candidate.status.as_str(),
                "updated_at": candidate.updated_at,
            };

            if candidate.retry_count >= self.policy.max_retries() {
                // Budget exhausted: retire without handing it to the publisher.
                warn!(
                    event.id = %candidate.id,
                    retry_count = candidate.retry_count,
                    "Retry budget exhausted, marking event failed"
                );
                self.collection
                    .update_one(
                        snapshot,
                        doc! { "$set": {
                            "status": EventStatus::Failed.as_str(),
                            "updated_at": claimed_at,
                        } },
                    )
                    .await?;
                continue;
            }

            let updated = self
                .collection
                .update_one(
                    snapshot,
                    doc! {
                        "$set": {
                            "status": EventStatus::Processing.as_str(),
                            "updated_at": claimed_at,
                        },
                        "$inc": { "retry_count": 1 },
                    },
                )
                .await?;

            if updated.modified_count == 0 {
                debug!(event.id = %candidate.id, "Lost claim race, skipping event");
                continue;
            }

            claimed.push(candidate.into_claimed(now));
            if claimed.len() >= batch_size {
                break;
            }
        }

        debug!(
            events = claimed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched pending outbox events"
        );

        Ok(claimed)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), StoreError> {
        let now = BsonDateTime::from_chrono(Utc::now());
        self.collection
            .update_one(
                doc! { "id": event_id },
                doc! { "$set": {
                    "status": EventStatus::Sent.as_str(),
                    "updated_at": now,
                    "sent_at": now,
                } },
            )
            .await?;
        Ok(())
    }

    async fn set_status(&self, event_id: &str, status: EventStatus) -> Result<(), StoreError> {
        self.collection
            .update_one(
                doc! { "id": event_id },
                doc! { "$set": {
                    "status": status.as_str(),
                    "updated_at": BsonDateTime::from_chrono(Utc::now()),
                } },
            )
            .await?;
        Ok(())
    }

    async fn set_status_and_increment_retry(
        &self,
        event_id: &str,
        status: EventStatus,
    ) -> Result<(), StoreError> {
        self.collection
            .update_one(
                doc! { "id": event_id },
                doc! {
                    "$set": {
                        "status": status.as_str(),
                        "updated_at": BsonDateTime::from_chrono(Utc::now()),
                    },
                    "$inc": { "retry_count": 1 },
                },
            )
            .await?;
        Ok(())
    }

    async fn increment_retry_count(&self, event_id: &str) -> Result<(), StoreError> {
        self.collection
            .update_one(
                doc! { "id": event_id },
                doc! {
                    "$set": { "updated_at": BsonDateTime::from_chrono(Utc::now()) },
                    "$inc": { "retry_count": 1 },
                },
            )
            .await?;
        Ok(())
    }
}
