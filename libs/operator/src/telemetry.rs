use std::time::Duration;

use opentelemetry::trace::{TraceError, TraceId, TracerProvider};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use serde::Serialize;
use thiserror::Error;
use tracing::dispatcher::SetGlobalDefaultError;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

#[derive(Error, Debug)]
pub enum Error {
    #[error("TraceError: {0}")]
    TraceError(#[source] TraceError),

    #[error("SetGlobalDefaultError: {0}")]
    SetGlobalDefaultError(#[source] SetGlobalDefaultError),
}

/// Trace ID of the current span, resolved through the tracing-opentelemetry
/// bridge. Returns `TraceId::INVALID` outside an exported span; callers use
/// it to stamp reconcile spans and metric exemplars.
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

/// Log output format, selectable on the command line.
#[derive(clap::ValueEnum, Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Initialize the tracing subscriber: an `EnvFilter`-driven fmt layer, plus
/// an OTLP span exporter when `tracing_url` is set. Traces are sampled at
/// `trace_ratio`.
pub async fn init(
    log_filter: &str,
    log_format: LogFormat,
    tracing_url: Option<&str>,
    trace_ratio: f64,
) -> Result<(), Error> {
    let logger = match log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().compact().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().compact().boxed(),
    };
    let collector = Registry::default()
        .with(logger)
        .with(EnvFilter::new(log_filter));

    match tracing_url {
        Some(url) => {
            let provider = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(url)
                        .with_timeout(Duration::from_secs(3)),
                )
                .with_trace_config(
                    trace::Config::default()
                        .with_sampler(Sampler::TraceIdRatioBased(trace_ratio))
                        .with_id_generator(RandomIdGenerator::default())
                        .with_resource(Resource::new(vec![KeyValue::new(
                            "service.name",
                            "stackop",
                        )])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .map_err(Error::TraceError)?;
            let tracer = provider
                .tracer_builder("opentelemetry-otlp")
                .with_version(env!("CARGO_PKG_VERSION"))
                .build();
            tracing::subscriber::set_global_default(
                collector.with(OpenTelemetryLayer::new(tracer)),
            )
            .map_err(Error::SetGlobalDefaultError)
        }
        None => {
            tracing::subscriber::set_global_default(collector).map_err(Error::SetGlobalDefaultError)
        }
    }
}
