use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker::{BrokerError, BrokerSettings, BrokerType, MessageBroker};
use chrono::Utc;
use common::{EventStatus, OutboxEvent, RetryPolicy};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use sidecar::config::{DbSettings, DbType, ObservabilitySettings, Settings};
use sidecar::processor::OutboxProcessor;
use sidecar::store::{OutboxRepository, StoreError};

fn test_settings(batch_size: usize, max_retries: i32) -> Settings {
    Settings {
        database: DbSettings {
            kind: DbType::Postgres,
            dsn: "postgres://localhost:5432/outbox".into(),
            uri: String::new(),
            name: "outbox".into(),
            collection: "outbox_events".into(),
        },
        broker: BrokerSettings {
            kind: BrokerType::RabbitMq,
            url: "amqp://localhost:5672".into(),
            project_id: String::new(),
            exchange: String::new(),
            pool_size: 5,
        },
        poll_interval: Duration::from_millis(10),
        batch_size,
        max_retries,
        retry_backoff: Duration::ZERO,
        dead_letter_topic: None,
        observability: ObservabilitySettings {
            service_name: "outbox-sidecar-test".into(),
            tracing_url: "http://localhost:4317".into(),
            metrics_url: None,
        },
    }
}

fn pending_event(id: &str) -> OutboxEvent {
    OutboxEvent::new(
        id,
        "orders",
        "topic",
        "orders.created",
        b"{\"x\":1}".to_vec(),
        HashMap::new(),
    )
}

/// Repository double implementing the claim/advance/retire state machine
/// over a plain vector, with a zero-backoff retry schedule.
struct InMemoryRepository {
    events: Mutex<Vec<OutboxEvent>>,
    policy: RetryPolicy,
    fail_mark_processed: bool,
}

impl InMemoryRepository {
    fn new(events: Vec<OutboxEvent>, max_retries: i32) -> Self {
        Self {
            events: Mutex::new(events),
            policy: RetryPolicy::new(max_retries, Duration::ZERO),
            fail_mark_processed: false,
        }
    }

    async fn get(&self, id: &str) -> OutboxEvent {
        self.events
            .lock()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .expect("event not found")
    }
}

#[async_trait]
impl OutboxRepository for InMemoryRepository {
    async fn fetch_pending(&self, batch_size: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let lock_expiration =
            chrono::Duration::seconds(self.policy.lock_expiration().as_secs() as i64);

        let mut events = self.events.lock().await;
        let mut claimed = Vec::new();
        for event in events.iter_mut() {
            if claimed.len() >= batch_size {
                break;
            }
            let live = event.status == EventStatus::Pending
                || (event.status == EventStatus::Processing
                    && event.updated_at < now - lock_expiration);
            if !live || !self.policy.retry_due(event.retry_count, event.updated_at, now) {
                continue;
            }
            if event.retry_count >= self.policy.max_retries() {
                event.status = EventStatus::Failed;
                event.updated_at = now;
                continue;
            }
            event.status = EventStatus::Processing;
            event.retry_count += 1;
            event.updated_at = now;
            claimed.push(event.clone());
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), StoreError> {
        if self.fail_mark_processed {
            return Err(StoreError::Db(sea_orm::DbErr::Custom(
                "connection reset".into(),
            )));
        }
        let now = Utc::now();
        let mut events = self.events.lock().await;
        if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
            event.status = EventStatus::Sent;
            event.updated_at = now;
            event.sent_at = Some(now);
        }
        Ok(())
    }

    async fn set_status(&self, event_id: &str, status: EventStatus) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
            event.status = status;
            event.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_status_and_increment_retry(
        &self,
        event_id: &str,
        status: EventStatus,
    ) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
            event.status = status;
            event.retry_count += 1;
            event.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn increment_retry_count(&self, event_id: &str) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
            event.retry_count += 1;
            event.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// Repository double whose fetch always fails.
struct FailingRepository;

#[async_trait]
impl OutboxRepository for FailingRepository {
    async fn fetch_pending(&self, _batch_size: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        Err(StoreError::Db(sea_orm::DbErr::Custom(
            "connection refused".into(),
        )))
    }

    async fn mark_processed(&self, _event_id: &str) -> Result<(), StoreError> {
        panic!("mark_processed should not be called");
    }

    async fn set_status(&self, _event_id: &str, _status: EventStatus) -> Result<(), StoreError> {
        panic!("set_status should not be called");
    }

    async fn set_status_and_increment_retry(
        &self,
        _event_id: &str,
        _status: EventStatus,
    ) -> Result<(), StoreError> {
        panic!("set_status_and_increment_retry should not be called");
    }

    async fn increment_retry_count(&self, _event_id: &str) -> Result<(), StoreError> {
        panic!("increment_retry_count should not be called");
    }
}

/// Broker double that replays a scripted sequence of publish outcomes and
/// records every event it saw. Once the script runs out it keeps succeeding.
#[derive(Default)]
struct ScriptedBroker {
    script: Mutex<VecDeque<Result<(), BrokerError>>>,
    published: Mutex<Vec<OutboxEvent>>,
}

impl ScriptedBroker {
    fn with_script(script: Vec<Result<(), BrokerError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            published: Mutex::new(Vec::new()),
        }
    }

    fn always_failing() -> Self {
        // An empty script means success, so seed enough failures for any test.
        let script = (0..16)
            .map(|_| Err(BrokerError::Publish("broker unavailable".into())))
            .collect();
        Self {
            script: Mutex::new(script),
            published: Mutex::new(Vec::new()),
        }
    }

    async fn published_count(&self) -> usize {
        self.published.lock().await.len()
    }
}

#[async_trait]
impl MessageBroker for ScriptedBroker {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), BrokerError> {
        self.published.lock().await.push(event.clone());
        self.script.lock().await.pop_front().unwrap_or(Ok(()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[tokio::test]
async fn happy_path_publishes_once_and_marks_sent() {
    let repo = Arc::new(InMemoryRepository::new(vec![pending_event("e1")], 3));
    let broker = Arc::new(ScriptedBroker::with_script(vec![Ok(())]));
    let processor = OutboxProcessor::new(repo.clone(), broker.clone(), &test_settings(10, 3));

    processor.run_once().await;

    let event = repo.get("e1").await;
    assert_eq!(event.status, EventStatus::Sent);
    // The claim bumped the retry count exactly once.
    assert_eq!(event.retry_count, 1);
    assert!(event.sent_at.is_some());

    let published = broker.published.lock().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].entity, "orders");
    assert_eq!(published[0].routing_key, "orders.created");
    assert_eq!(published[0].payload, b"{\"x\":1}".to_vec());
}

#[tokio::test]
async fn trace_context_is_injected_before_publish() {
    use opentelemetry::trace::TracerProvider as _;
    use tracing::instrument::WithSubscriber;
    use tracing_subscriber::layer::SubscriberExt;

    // The production wiring installed by telemetry::init, scoped to this
    // test: a W3C propagator plus an OTel-backed tracing subscriber so the
    // per-event span carries a real sampled context.
    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );
    let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("processor-test")));

    let mut headers = HashMap::new();
    headers.insert("x-tenant".to_string(), "acme".to_string());
    let mut event = pending_event("e1");
    event.headers = headers;

    let repo = Arc::new(InMemoryRepository::new(vec![event], 3));
    let broker = Arc::new(ScriptedBroker::with_script(vec![Ok(())]));
    let processor = OutboxProcessor::new(repo.clone(), broker.clone(), &test_settings(10, 3));

    processor.run_once().with_subscriber(subscriber).await;

    let published = broker.published.lock().await;
    assert_eq!(published.len(), 1);
    // The broker saw the trace context, so it was merged before the publish.
    let traceparent = published[0]
        .headers
        .get("traceparent")
        .expect("published headers must carry a traceparent");
    assert!(traceparent.starts_with("00-"));
    // Application headers survive the merge.
    assert_eq!(published[0].headers.get("x-tenant").unwrap(), "acme");
}

#[tokio::test]
async fn transient_failure_returns_event_to_pending() {
    let repo = Arc::new(InMemoryRepository::new(vec![pending_event("e1")], 3));
    let broker = Arc::new(ScriptedBroker::with_script(vec![
        Err(BrokerError::Publish("timeout".into())),
        Ok(()),
    ]));
    let processor = OutboxProcessor::new(repo.clone(), broker.clone(), &test_settings(10, 3));

    processor.run_once().await;
    let event = repo.get("e1").await;
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.retry_count, 1);

    processor.run_once().await;
    let event = repo.get("e1").await;
    assert_eq!(event.status, EventStatus::Sent);
    assert_eq!(event.retry_count, 2);
    assert_eq!(broker.published_count().await, 2);
}

#[tokio::test]
async fn budget_exhaustion_marks_failed_with_no_further_attempts() {
    let max_retries = 3;
    let repo = Arc::new(InMemoryRepository::new(
        vec![pending_event("e1")],
        max_retries,
    ));
    let broker = Arc::new(ScriptedBroker::always_failing());
    let processor = OutboxProcessor::new(
        repo.clone(),
        broker.clone(),
        &test_settings(10, max_retries),
    );

    for _ in 0..3 {
        processor.run_once().await;
    }

    let event = repo.get("e1").await;
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retry_count, 3);
    assert_eq!(broker.published_count().await, 3);

    // A further iteration must not publish a fourth time.
    processor.run_once().await;
    assert_eq!(broker.published_count().await, 3);
    assert_eq!(repo.get("e1").await.status, EventStatus::Failed);
}

#[tokio::test]
async fn expired_claim_is_reclaimed_and_published() {
    // A replica claimed the event once and died; the lock window has passed.
    let mut abandoned = pending_event("e1");
    abandoned.status = EventStatus::Processing;
    abandoned.retry_count = 1;
    abandoned.updated_at = Utc::now() - chrono::Duration::minutes(6);

    let repo = Arc::new(InMemoryRepository::new(vec![abandoned], 3));
    let broker = Arc::new(ScriptedBroker::with_script(vec![Ok(())]));
    let processor = OutboxProcessor::new(repo.clone(), broker.clone(), &test_settings(10, 3));

    processor.run_once().await;

    let event = repo.get("e1").await;
    assert_eq!(event.status, EventStatus::Sent);
    // One claim by the dead replica, one by this one.
    assert_eq!(event.retry_count, 2);
}

#[tokio::test]
async fn canceled_and_terminal_events_are_skipped() {
    let mut canceled = pending_event("c1");
    canceled.status = EventStatus::Canceled;
    let mut sent = pending_event("s1");
    sent.status = EventStatus::Sent;
    let mut failed = pending_event("f1");
    failed.status = EventStatus::Failed;

    let repo = Arc::new(InMemoryRepository::new(vec![canceled, sent, failed], 3));
    let broker = Arc::new(ScriptedBroker::default());
    let processor = OutboxProcessor::new(repo.clone(), broker.clone(), &test_settings(10, 3));

    processor.run_once().await;

    assert_eq!(broker.published_count().await, 0);
    assert_eq!(repo.get("c1").await.status, EventStatus::Canceled);
    assert_eq!(repo.get("s1").await.status, EventStatus::Sent);
    assert_eq!(repo.get("f1").await.status, EventStatus::Failed);
}

#[tokio::test]
async fn fetch_error_skips_the_iteration() {
    let broker = Arc::new(ScriptedBroker::default());
    let processor = OutboxProcessor::new(
        Arc::new(FailingRepository),
        broker.clone(),
        &test_settings(10, 3),
    );

    // Must neither panic nor publish.
    processor.run_once().await;
    assert_eq!(broker.published_count().await, 0);
}

#[tokio::test]
async fn zero_batch_size_publishes_nothing() {
    let repo = Arc::new(InMemoryRepository::new(vec![pending_event("e1")], 3));
    let broker = Arc::new(ScriptedBroker::default());
    let processor = OutboxProcessor::new(repo.clone(), broker.clone(), &test_settings(0, 3));

    processor.run_once().await;

    assert_eq!(broker.published_count().await, 0);
    assert_eq!(repo.get("e1").await.status, EventStatus::Pending);
}

#[tokio::test]
async fn mark_processed_error_leaves_claim_for_reclaim() {
    let mut repo = InMemoryRepository::new(vec![pending_event("e1")], 3);
    repo.fail_mark_processed = true;
    let repo = Arc::new(repo);
    let broker = Arc::new(ScriptedBroker::with_script(vec![Ok(())]));
    let processor = OutboxProcessor::new(repo.clone(), broker.clone(), &test_settings(10, 3));

    processor.run_once().await;

    // The publish happened, but the row stays claimed until lock expiration.
    assert_eq!(broker.published_count().await, 1);
    let event = repo.get("e1").await;
    assert_eq!(event.status, EventStatus::Processing);
    assert_eq!(event.retry_count, 1);
}

#[tokio::test]
async fn cancelled_before_start_exits_without_fetching() {
    let repo = Arc::new(InMemoryRepository::new(vec![pending_event("e1")], 3));
    let broker = Arc::new(ScriptedBroker::default());
    let processor = OutboxProcessor::new(repo.clone(), broker.clone(), &test_settings(10, 3));

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    processor.run(shutdown).await;

    assert_eq!(broker.published_count().await, 0);
    assert_eq!(repo.get("e1").await.status, EventStatus::Pending);
}

#[tokio::test]
async fn cancellation_during_sleep_stops_the_loop() {
    let repo = Arc::new(InMemoryRepository::new(vec![pending_event("e1")], 3));
    let broker = Arc::new(ScriptedBroker::with_script(vec![Ok(())]));

    let mut settings = test_settings(10, 3);
    settings.poll_interval = Duration::from_secs(3600);
    let processor = Arc::new(OutboxProcessor::new(repo.clone(), broker.clone(), &settings));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let processor = Arc::clone(&processor);
        let shutdown = shutdown.clone();
        async move { processor.run(shutdown).await }
    });

    // Let the first iteration run, then cancel during the long sleep.
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("processor did not stop after cancellation")
        .expect("processor task panicked");

    assert_eq!(repo.get("e1").await.status, EventStatus::Sent);
    assert_eq!(broker.published_count().await, 1);
}

#[tokio::test]
async fn batch_is_published_in_repository_order() {
    let repo = Arc::new(InMemoryRepository::new(
        vec![pending_event("e1"), pending_event("e2"), pending_event("e3")],
        3,
    ));
    let broker = Arc::new(ScriptedBroker::default());
    let processor = OutboxProcessor::new(repo.clone(), broker.clone(), &test_settings(10, 3));

    processor.run_once().await;

    let published = broker.published.lock().await;
    let ids: Vec<&str> = published.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["e1", "e2", "e3"]);
}
