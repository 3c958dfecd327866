use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilitySettings;
use crate::error::SidecarError;

/// Handle over the installed tracer provider. Dropping it without calling
/// `shutdown` loses buffered spans.
pub struct Telemetry {
    provider: TracerProvider,
}

/// Initialize tracing: a fmt layer for logs, an OTLP batch exporter for
/// spans, and the W3C propagator as the process-wide text-map propagator.
pub fn init(settings: &ObservabilitySettings) -> Result<Telemetry, SidecarError> {
    if settings.service_name.is_empty() {
        return Err(SidecarError::Telemetry(
            "service name cannot be empty".to_string(),
        ));
    }
    if settings.tracing_url.is_empty() {
        return Err(SidecarError::Telemetry(
            "tracing URL cannot be empty".to_string(),
        ));
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(settings.tracing_url.clone())
        .build()
        .map_err(|e| SidecarError::Telemetry(format!("failed to create trace exporter: {e}")))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            SERVICE_NAME,
            settings.service_name.clone(),
        )]))
        .build();

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer = provider.tracer("outbox-sidecar");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    Ok(Telemetry { provider })
}

impl Telemetry {
    /// Flush buffered spans and stop the exporter.
    pub fn shutdown(self) {
        if let Err(e) = self.provider.shutdown() {
            error!(error = %e, "Error shutting down tracer provider");
        }
    }
}
