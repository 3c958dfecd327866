use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{trace, OutboxEvent};
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::pooling::{ChannelPool, RECONNECT_INTERVAL};
use crate::MessageBroker;

/// AMQP broker adapter: one long-lived connection, a bounded channel pool
/// and a supervised reconnect loop.
pub struct RabbitMqBroker {
    pool: Arc<ChannelPool>,
    default_exchange: String,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl RabbitMqBroker {
    pub async fn connect(settings: BrokerSettings) -> Result<Self, BrokerError> {
        if settings.pool_size == 0 {
            return Err(BrokerError::Config(
                "broker.pool_size must be greater than 0".to_string(),
            ));
        }

        let default_exchange = settings.exchange.clone();
        let pool = Arc::new(ChannelPool::connect(settings).await?);

        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(Arc::clone(&pool), shutdown.clone()));

        Ok(Self {
            pool,
            default_exchange,
            supervisor: Mutex::new(Some(supervisor)),
            shutdown,
        })
    }

    async fn publish_message(
        &self,
        exchange: &str,
        event: &OutboxEvent,
        headers: HashMap<String, String>,
    ) -> Result<(), BrokerError> {
        let channel = self.pool.acquire().await?;
        let result = publish_on(&channel, exchange, event, headers).await;
        self.pool.release(channel).await;

        match &result {
            Ok(()) => debug!(payload_bytes = event.payload.len(), "Published message"),
            Err(e) => error!(event.id = %event.id, error = %e, "Failed to publish message"),
        }
        result
    }
}

#[async_trait]
impl MessageBroker for RabbitMqBroker {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), BrokerError> {
        let exchange = if event.entity.is_empty() {
            self.default_exchange.as_str()
        } else {
            event.entity.as_str()
        };

        let span = info_span!(
            "publish",
            messaging.system = "rabbitmq",
            messaging.destination_kind = %event.entity_type,
            messaging.destination = exchange,
            messaging.rabbitmq.routing_key = %event.routing_key,
        );

        // Trace context goes into a copy: the caller's event stays reusable.
        let mut headers = event.headers.clone();
        trace::inject_context(&span.context(), &mut headers);

        self.publish_message(exchange, event, headers)
            .instrument(span)
            .await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown.cancel();
        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Reconnect supervisor exited abnormally");
            }
        }
        self.pool.shutdown().await
    }
}

async fn publish_on(
    channel: &Channel,
    exchange: &str,
    event: &OutboxEvent,
    headers: HashMap<String, String>,
) -> Result<(), BrokerError> {
    // Idempotent when the exchange already exists with matching parameters;
    // a parameter conflict fails the declare and surfaces as a publish error.
    channel
        .exchange_declare(
            exchange,
            exchange_kind(&event.entity_type),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.into(), AMQPValue::LongString(value.into()));
    }

    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_headers(table);

    channel
        .basic_publish(
            exchange,
            &event.routing_key,
            BasicPublishOptions::default(),
            &event.payload,
            properties,
        )
        .await?
        .await?;

    Ok(())
}

fn exchange_kind(entity_type: &str) -> ExchangeKind {
    match entity_type {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "" | "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

async fn supervise(pool: Arc<ChannelPool>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(RECONNECT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Stopping RabbitMQ reconnect supervisor");
                return;
            }
            _ = ticker.tick() => {}
        }

        if let Err(e) = pool.ensure_connected().await {
            error!(error = %e, "Failed to reconnect to RabbitMQ");
        }
    }
}
