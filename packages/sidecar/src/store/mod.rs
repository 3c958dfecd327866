mod mongo;
mod postgres;

pub use mongo::MongoRepository;
pub use postgres::PostgresRepository;

use std::sync::Arc;

use async_trait::async_trait;
use common::{EventStatus, OutboxEvent, RetryPolicy};
use thiserror::Error;

use crate::config::{DbSettings, DbType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Unsupported database type: {0}")]
    UnsupportedBackend(String),
}

/// Durable claim/advance/retire operations over the outbox table.
///
/// Each operation is atomic with respect to the others on the same event id;
/// `fetch_pending` performs selection and claim in one transactional scope.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Select up to `batch_size` live events (pending, or processing past the
    /// lock-expiration window) whose retry schedule is due, and claim each
    /// one: events at the retry budget are retired to `failed`, the rest move
    /// to `processing` with `retry_count` bumped and a fresh lock timestamp.
    /// Only successfully claimed events are returned, in post-claim state.
    async fn fetch_pending(&self, batch_size: usize) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Transition the event to `sent` and stamp `sent_at`.
    async fn mark_processed(&self, event_id: &str) -> Result<(), StoreError>;

    /// Raw status write with an `updated_at` bump.
    async fn set_status(&self, event_id: &str, status: EventStatus) -> Result<(), StoreError>;

    /// Atomic status write combined with `retry_count += 1`.
    async fn set_status_and_increment_retry(
        &self,
        event_id: &str,
        status: EventStatus,
    ) -> Result<(), StoreError>;

    /// Atomic `retry_count += 1` with an `updated_at` bump.
    async fn increment_retry_count(&self, event_id: &str) -> Result<(), StoreError>;
}

/// Construct the repository backend selected by the settings.
pub async fn init_repository(
    settings: &DbSettings,
    policy: RetryPolicy,
) -> Result<Arc<dyn OutboxRepository>, StoreError> {
    match settings.kind {
        DbType::Postgres => Ok(Arc::new(PostgresRepository::connect(settings, policy).await?)),
        DbType::Mongo => Ok(Arc::new(MongoRepository::connect(settings, policy).await?)),
        DbType::Spanner => Err(StoreError::UnsupportedBackend("spanner".to_string())),
    }
}
