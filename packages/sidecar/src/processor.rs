use std::sync::Arc;
use std::time::Duration;

use broker::MessageBroker;
use common::{trace, EventStatus, OutboxEvent};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::config::Settings;
use crate::store::OutboxRepository;

/// Drives the event lifecycle: poll the repository, publish each claimed
/// event, and write back its terminal status.
pub struct OutboxProcessor {
    repo: Arc<dyn OutboxRepository>,
    broker: Arc<dyn MessageBroker>,
    poll_interval: Duration,
    batch_size: usize,
    max_retries: i32,
}

impl OutboxProcessor {
    pub fn new(
        repo: Arc<dyn OutboxRepository>,
        broker: Arc<dyn MessageBroker>,
        settings: &Settings,
    ) -> Self {
        Self {
            repo,
            broker,
            poll_interval: settings.poll_interval,
            batch_size: settings.batch_size,
            max_retries: settings.max_retries,
        }
    }

    /// Run the poll → publish → advance loop until `shutdown` fires.
    ///
    /// Cancellation is honored before each fetch and during the sleep; an
    /// in-flight batch always finishes so no row is left claimed needlessly.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval = ?self.poll_interval,
            batch_size = self.batch_size,
            max_retries = self.max_retries,
            "Outbox processor started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.run_once().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Outbox processor stopped");
    }

    /// One polling iteration: fetch a batch of claimed events and publish
    /// each in the order the repository returned them.
    pub async fn run_once(&self) {
        let events = match self.repo.fetch_pending(self.batch_size).await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Failed to fetch outbox events");
                return;
            }
        };

        for mut event in events {
            self.process_event(&mut event).await;
        }
    }

    async fn process_event(&self, event: &mut OutboxEvent) {
        let span = info_span!(
            "process_outbox_event",
            event.id = %event.id,
            event.entity = %event.entity,
            event.status = %event.status,
            event.retry_count = event.retry_count,
            event.created_at = %event.created_at,
            event.updated_at = %event.updated_at,
        );

        // Consumers correlate through these headers, so the context must be
        // in place before the publish.
        trace::inject_context(&span.context(), &mut event.headers);

        async {
            match self.broker.publish(event).await {
                Ok(()) => {
                    if let Err(e) = self.repo.mark_processed(&event.id).await {
                        // At-least-once: the claim expires and the event is
                        // republished by a later iteration.
                        error!(event.id = %event.id, error = %e, "Failed to mark event as processed");
                    }
                }
                Err(e) => {
                    error!(
                        event.id = %event.id,
                        retry_count = event.retry_count,
                        error = %e,
                        "Failed to publish event"
                    );

                    // The claim already spent this attempt's budget.
                    let next = if event.retry_count < self.max_retries {
                        EventStatus::Pending
                    } else {
                        EventStatus::Failed
                    };
                    if let Err(e) = self.repo.set_status(&event.id, next).await {
                        error!(event.id = %event.id, error = %e, "Failed to update event status");
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }
}
