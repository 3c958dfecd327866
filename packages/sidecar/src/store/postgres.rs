use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventStatus, OutboxEvent, RetryPolicy};
use sea_orm::sea_query::{Expr, LockBehavior, LockType};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, ConnectOptions, Database, DatabaseConnection,
    EntityTrait, QueryFilter, QuerySelect, TransactionTrait,
};
use tracing::{debug, warn};

use crate::config::DbSettings;
use crate::entity::outbox_event;

use super::{OutboxRepository, StoreError};

/// Relational backend. The claim is pessimistic: candidates are selected
/// with `FOR UPDATE SKIP LOCKED` and advanced inside the same transaction,
/// so concurrent replicas never observe the same claimed row.
pub struct PostgresRepository {
    db: DatabaseConnection,
    policy: RetryPolicy,
}

impl PostgresRepository {
    pub async fn connect(settings: &DbSettings, policy: RetryPolicy) -> Result<Self, StoreError> {
        // A single polling worker drives all traffic here: one claim
        // transaction per tick plus a handful of advance writes. A few
        // connections cover that; the timeouts just bound a dead database.
        let mut options = ConnectOptions::new(settings.dsn.clone());
        options
            .max_connections(4)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .sqlx_logging(false);

        let db = Database::connect(options).await?;
        Ok(Self { db, policy })
    }

    async fn advance<C: ConnectionTrait>(
        conn: &C,
        event_id: &str,
        status: EventStatus,
        increment_retry: bool,
        sent: bool,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut update = outbox_event::Entity::update_many()
            .col_expr(outbox_event::Column::Status, Expr::value(status))
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now));
        if increment_retry {
            update = update.col_expr(
                outbox_event::Column::RetryCount,
                Expr::col(outbox_event::Column::RetryCount).add(1),
            );
        }
        if sent {
            update = update.col_expr(outbox_event::Column::SentAt, Expr::value(now));
        }
        update
            .filter(outbox_event::Column::Id.eq(event_id))
            .exec(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for PostgresRepository {
    async fn fetch_pending(&self, batch_size: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let now = Utc::now();
        let reclaim_cutoff = now
            - chrono::Duration::seconds(self.policy.lock_expiration().as_secs() as i64);

        let txn = self.db.begin().await?;

        let candidates = outbox_event::Entity::find()
            .filter(
                Condition::any()
                    .add(outbox_event::Column::Status.eq(EventStatus::Pending))
                    .add(
                        Condition::all()
                            .add(outbox_event::Column::Status.eq(EventStatus::Processing))
                            .add(outbox_event::Column::UpdatedAt.lt(reclaim_cutoff)),
                    ),
            )
            .limit(batch_size as u64)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .all(&txn)
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            if !self.policy.retry_due(row.retry_count, row.updated_at, now) {
                continue;
            }

            if row.retry_count >= self.policy.max_retries() {
                // Budget exhausted: retire without handing it to the publisher.
                warn!(
                    event.id = %row.id,
                    retry_count = row.retry_count,
                    "Retry budget exhausted, marking event failed"
                );
                outbox_event::Entity::update_many()
                    .col_expr(outbox_event::Column::Status, Expr::value(EventStatus::Failed))
                    .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
                    .filter(outbox_event::Column::Id.eq(row.id.clone()))
                    .exec(&txn)
                    .await?;
                continue;
            }

            outbox_event::Entity::update_many()
                .col_expr(
                    outbox_event::Column::Status,
                    Expr::value(EventStatus::Processing),
                )
                .col_expr(
                    outbox_event::Column::RetryCount,
                    Expr::col(outbox_event::Column::RetryCount).add(1),
                )
                .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
                .filter(outbox_event::Column::Id.eq(row.id.clone()))
                .exec(&txn)
                .await?;

            claimed.push(claimed_event(row, now));
        }

        txn.commit().await?;

        debug!(
            events = claimed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched pending outbox events"
        );

        Ok(claimed)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), StoreError> {
        Self::advance(&self.db, event_id, EventStatus::Sent, false, true).await
    }

    async fn set_status(&self, event_id: &str, status: EventStatus) -> Result<(), StoreError> {
        Self::advance(&self.db, event_id, status, false, false).await
    }

    async fn set_status_and_increment_retry(
        &self,
        event_id: &str,
        status: EventStatus,
    ) -> Result<(), StoreError> {
        Self::advance(&self.db, event_id, status, true, false).await
    }

    async fn increment_retry_count(&self, event_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        outbox_event::Entity::update_many()
            .col_expr(
                outbox_event::Column::RetryCount,
                Expr::col(outbox_event::Column::RetryCount).add(1),
            )
            .col_expr(outbox_event::Column::UpdatedAt, Expr::value(now))
            .filter(outbox_event::Column::Id.eq(event_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

/// Convert a selected row into its post-claim domain event.
fn claimed_event(row: outbox_event::Model, claimed_at: DateTime<Utc>) -> OutboxEvent {
    let headers: HashMap<String, String> = serde_json::from_value(row.headers).unwrap_or_default();
    OutboxEvent {
        id: row.id,
        entity: row.entity,
        entity_type: row.entity_type,
        routing_key: row.routing_key,
        payload: row.payload,
        headers,
        status: EventStatus::Processing,
        retry_count: row.retry_count + 1,
        created_at: row.created_at,
        updated_at: claimed_at,
        sent_at: row.sent_at,
    }
}
