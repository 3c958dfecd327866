use std::fmt;

use serde::Deserialize;

/// Settings for connecting to a message broker.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    #[serde(rename = "type")]
    pub kind: BrokerType,
    /// AMQP URL. Ignored by the Pub/Sub adapter.
    #[serde(default)]
    pub url: String,
    /// GCP project. Ignored by the AMQP adapter.
    #[serde(default)]
    pub project_id: String,
    /// Default AMQP exchange, used only when an event carries no entity.
    #[serde(default)]
    pub exchange: String,
    /// AMQP channel-pool capacity. Must be greater than 0.
    #[serde(default = "default_pool_size")]
    pub pool_size: u8,
}

fn default_pool_size() -> u8 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    RabbitMq,
    PubSub,
}

impl BrokerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RabbitMq => "rabbitmq",
            Self::PubSub => "pubsub",
        }
    }
}

impl fmt::Display for BrokerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
