use std::collections::HashMap;

use async_trait::async_trait;
use common::{trace, OutboxEvent};
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::MessageBroker;

/// Pub/Sub broker adapter: a thin topic-publish wrapper. The underlying
/// client multiplexes connections, so there is no pool and no reconnect
/// supervision here.
pub struct PubSubBroker {
    client: Client,
    publishers: Mutex<HashMap<String, Publisher>>,
}

impl PubSubBroker {
    pub async fn connect(settings: BrokerSettings) -> Result<Self, BrokerError> {
        let mut config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        config.project_id = Some(settings.project_id.clone());

        let client = Client::new(config)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            publishers: Mutex::new(HashMap::new()),
        })
    }

    async fn publisher_for(&self, topic_id: &str) -> Publisher {
        let mut publishers = self.publishers.lock().await;
        if let Some(publisher) = publishers.get(topic_id) {
            return publisher.clone();
        }
        let publisher = self.client.topic(topic_id).new_publisher(None);
        publishers.insert(topic_id.to_string(), publisher.clone());
        publisher
    }
}

#[async_trait]
impl MessageBroker for PubSubBroker {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), BrokerError> {
        let span = info_span!(
            "publish",
            messaging.system = "pubsub",
            messaging.destination_kind = "topic",
            messaging.destination = %event.entity,
        );

        let mut attributes = event.headers.clone();
        trace::inject_context(&span.context(), &mut attributes);

        async {
            let publisher = self.publisher_for(&event.entity).await;
            let message = PubsubMessage {
                data: event.payload.clone().into(),
                attributes,
                ordering_key: event.routing_key.clone(),
                ..Default::default()
            };

            // Block until the server acknowledges the message.
            publisher
                .publish(message)
                .await
                .get()
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;

            debug!(
                payload_bytes = event.payload.len(),
                "Published message to Pub/Sub"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut publishers = self.publishers.lock().await;
        for (_, mut publisher) in publishers.drain() {
            publisher.shutdown().await;
        }
        Ok(())
    }
}
