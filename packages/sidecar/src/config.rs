use std::fmt;
use std::time::Duration;

use broker::{BrokerSettings, BrokerType};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::SidecarError;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub database: DbSettings,
    pub broker: BrokerSettings,
    /// Duration between polling iterations. Zero degenerates to a tight loop.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Rows claimed per fetch. Zero fetches nothing.
    pub batch_size: usize,
    /// Terminal-failure threshold.
    pub max_retries: i32,
    /// Base duration for the exponential retry schedule.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Reserved: events transitioning to `failed` may eventually be
    /// republished here. Accepted but not acted on.
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
    #[serde(default)]
    pub observability: ObservabilitySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbSettings {
    #[serde(rename = "type")]
    pub kind: DbType,
    /// Connection string for relational backends.
    #[serde(default)]
    pub dsn: String,
    /// Connection URI for document backends.
    #[serde(default)]
    pub uri: String,
    /// Database name for the mongo backend.
    #[serde(default = "default_db_name")]
    pub name: String,
    /// Collection name for the mongo backend.
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_db_name() -> String {
    "outbox".into()
}
fn default_collection() -> String {
    "outbox_events".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Postgres,
    Spanner,
    Mongo,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Spanner => "spanner",
            Self::Mongo => "mongo",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ObservabilitySettings {
    pub service_name: String,
    pub tracing_url: String,
    /// Reserved: metrics export is not wired yet.
    #[serde(default)]
    pub metrics_url: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("database.type", "postgres")?
            .set_default("broker.type", "rabbitmq")?
            .set_default("broker.pool_size", 5_i64)?
            .set_default("poll_interval", "5s")?
            .set_default("batch_size", 10_i64)?
            .set_default("max_retries", 3_i64)?
            .set_default("retry_backoff", "1s")?
            // Load from config/sidecar.toml
            .add_source(File::with_name("config/sidecar").required(false))
            // Override from environment (e.g., SIDECAR__DATABASE__DSN)
            .add_source(Environment::with_prefix("SIDECAR").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Startup validation. Failures here are fatal.
    pub fn validate(&self) -> Result<(), SidecarError> {
        match self.database.kind {
            DbType::Postgres if self.database.dsn.is_empty() => {
                return Err(SidecarError::Config(
                    "database.dsn is required for the postgres backend".into(),
                ));
            }
            DbType::Mongo if self.database.uri.is_empty() => {
                return Err(SidecarError::Config(
                    "database.uri is required for the mongo backend".into(),
                ));
            }
            DbType::Spanner if self.database.uri.is_empty() => {
                return Err(SidecarError::Config(
                    "database.uri is required for the spanner backend".into(),
                ));
            }
            _ => {}
        }

        match self.broker.kind {
            BrokerType::RabbitMq if self.broker.url.is_empty() => {
                return Err(SidecarError::Config(
                    "broker.url is required for the rabbitmq broker".into(),
                ));
            }
            BrokerType::PubSub if self.broker.project_id.is_empty() => {
                return Err(SidecarError::Config(
                    "broker.project_id is required for the pubsub broker".into(),
                ));
            }
            _ => {}
        }

        if self.observability.service_name.is_empty() {
            return Err(SidecarError::Config(
                "observability.service_name cannot be empty".into(),
            ));
        }
        if self.observability.tracing_url.is_empty() {
            return Err(SidecarError::Config(
                "observability.tracing_url cannot be empty".into(),
            ));
        }

        Ok(())
    }
}
