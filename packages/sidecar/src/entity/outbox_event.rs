use common::EventStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// An event staged in the producer-owned outbox table.
///
/// The table is provisioned by the producer's migrations; the relay only
/// reads and advances rows.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "outbox_events")]
pub struct Model {
    /// Producer-assigned identifier.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Broker destination (exchange or topic).
    pub entity: String,

    /// Destination kind ("topic", "direct", "fanout", "headers").
    pub entity_type: String,

    pub routing_key: String,

    /// Opaque message body.
    pub payload: Vec<u8>,

    /// JSON object mapping header names to values.
    #[sea_orm(column_type = "JsonBinary")]
    pub headers: Json,

    pub status: EventStatus,

    pub retry_count: i32,

    pub created_at: DateTimeUtc,

    /// Claim-lock timestamp while `processing`.
    pub updated_at: DateTimeUtc,

    pub sent_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
