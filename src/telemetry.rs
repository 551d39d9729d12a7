//! Tracing setup shared by every binary.
//!
//! Logs go to stderr; stdout belongs to the worker protocol. Call before the
//! tokio runtime starts so the OTLP exporter's blocking client is built outside it.

use crate::WarcannonError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn fmt_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
}

#[cfg(not(feature = "distributed"))]
pub fn init_tracing(_service: &'static str) -> Result<(), WarcannonError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer())
        .try_init()
        .map_err(|e| WarcannonError::Other(format!("tracing init failed: {}", e)))
}

/// Install the subscriber. With `OTEL_EXPORTER_OTLP_ENDPOINT` set, spans are also
/// exported over OTLP/HTTP under `service.name = service`.
#[cfg(feature = "distributed")]
pub fn init_tracing(service: &'static str) -> Result<(), WarcannonError> {
    use opentelemetry::KeyValue;
    use opentelemetry::trace::TracerProvider;
    use opentelemetry_otlp::{Protocol, WithExportConfig};
    use opentelemetry_sdk::{Resource, trace as sdktrace};

    let otel_layer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) if !endpoint.is_empty() => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .build()
                .map_err(|e| WarcannonError::Config(format!("OTLP exporter for {}: {}", endpoint, e)))?;
            let resource = Resource::builder_empty()
                .with_attributes(vec![KeyValue::new("service.name", service)])
                .build();
            let provider = sdktrace::SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(resource)
                .build();
            let tracer = provider.tracer(service);
            opentelemetry::global::set_tracer_provider(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(otel_layer)
        .with(fmt_layer())
        .try_init()
        .map_err(|e| WarcannonError::Other(format!("tracing init failed: {}", e)))
}
