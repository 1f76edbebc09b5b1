//! Telemetry logic.
//! Support logging, log shipping, metrics and error reporting.
use metrics::{Unit, gauge};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::LogExporter;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::{SdkLogger, SdkLoggerProvider};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::time::sleep;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use std::error::Error;
use std::time::Duration;

use crate::config;
use crate::error::PortalError;

type BoxError = Box<dyn Error + Send + Sync>;

fn ressources() -> Resource {
    Resource::builder()
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Logs are also shipped to the
/// OTLP collector when an endpoint is configured.
pub fn setup_tracing(config: &config::Telemetry) -> Result<(), BoxError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let otlp = config
        .otlp_endpoint
        .as_deref()
        .filter(|endpoint| !endpoint.is_empty())
        .map(setup_logging)
        .transpose()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(otlp)
        .try_init()?;

    Ok(())
}

/// Create OLTP exporter for logs.
pub fn setup_logging(
    endpoint: &str,
) -> Result<OpenTelemetryTracingBridge<SdkLoggerProvider, SdkLogger>, BoxError> {
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let provider: SdkLoggerProvider = SdkLoggerProvider::builder()
        .with_resource(ressources())
        .with_batch_exporter(exporter)
        .build();
    Ok(OpenTelemetryTracingBridge::new(&provider))
}

/// Create recorder for Prometheus metrics.
///
/// Must be called within a Tokio runtime. The host renders the handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    metrics::describe_counter!("portal_logins_total", "INN login attempts by outcome.");
    metrics::describe_counter!("portal_questions_total", "Consultant questions by role and outcome.");
    metrics::describe_counter!("portal_documents_queries_total", "Document catalog queries.");
    metrics::describe_counter!("portal_tickets_total", "Support ticket submissions by outcome.");
    metrics::describe_counter!("portal_errors_total", "Reported failures by operation.");
    metrics::describe_histogram!(
        "portal_answer_duration_seconds",
        Unit::Seconds,
        "Time to get an answer from the consultant."
    );
    metrics::describe_gauge!(
        "process_memory_used_bytes",
        Unit::Bytes,
        "Total process memory in bytes."
    );

    let mut system = System::new_with_specifics(RefreshKind::nothing());
    let pid = Pid::from_u32(std::process::id());

    // Refresh process memory every 30 seconds.
    tokio::spawn(async move {
        loop {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );

            if let Some(process) = system.process(pid) {
                gauge!("process_memory_used_bytes").set(process.memory() as f64);
            }

            sleep(Duration::from_secs(30)).await;
        }
    });

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("portal_answer_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )?
        .install_recorder()
}

/// Port for the error-monitoring collaborator.
///
/// Reporting is fire-and-forget and never fails the calling flow.
pub trait ErrorReporter: Send + Sync {
    /// Report a caught failure of `operation`.
    fn report(&self, error: &PortalError, operation: &'static str);
}

/// Tracing-based error reporter.
///
/// Events reach the OTLP collector through the log bridge when enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl TracingReporter {
    /// Create a new [`TracingReporter`].
    pub fn new() -> Self {
        Self
    }
}

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &PortalError, operation: &'static str) {
        tracing::error!(
            operation,
            error = %error,
            source = ?Error::source(error),
            "operation failed"
        );
        metrics::counter!("portal_errors_total", "operation" => operation).increment(1);
    }
}
