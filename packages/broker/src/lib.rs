pub mod config;
pub mod error;
mod pooling;
mod pubsub;
mod rabbitmq;

pub use config::{BrokerSettings, BrokerType};
pub use error::BrokerError;
pub use pubsub::PubSubBroker;
pub use rabbitmq::RabbitMqBroker;

use std::sync::Arc;

use async_trait::async_trait;
use common::OutboxEvent;

/// Operations a relay needs from a message broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish the event to its destination, blocking until the broker
    /// acknowledges it. Trace context is merged into the outgoing headers.
    async fn publish(&self, event: &OutboxEvent) -> Result<(), BrokerError>;

    /// Release broker resources. Callers must not publish afterwards.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Construct the broker adapter selected by the settings.
pub async fn init_broker(settings: &BrokerSettings) -> Result<Arc<dyn MessageBroker>, BrokerError> {
    match settings.kind {
        BrokerType::RabbitMq => Ok(Arc::new(RabbitMqBroker::connect(settings.clone()).await?)),
        BrokerType::PubSub => Ok(Arc::new(PubSubBroker::connect(settings.clone()).await?)),
    }
}
