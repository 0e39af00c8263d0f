//! Telemetry logic.
//! Local logging, plus OTLP export of log records when configured.
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::{SdkLogger, SdkLoggerProvider};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_NAME: &str = "keysignup";
const DEFAULT_FILTER: &str = "info";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn ressources() -> Resource {
    Resource::builder().with_service_name(SERVICE_NAME).build()
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

/// Run `f` with a plain stderr subscriber, before [`init`] is possible.
pub fn bootstrap<T>(f: impl FnOnce() -> T) -> T {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init(otlp_endpoint: Option<&str>) -> Result<(), BoxError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let mut otlp_error = None;
    let otlp = otlp_endpoint.and_then(|endpoint| match setup_logging(endpoint) {
        Ok(layer) => Some(layer),
        Err(err) => {
            otlp_error = Some(err);
            None
        },
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(otlp)
        .try_init()?;

    if let Some(err) = otlp_error {
        tracing::warn!(error = %err, "OTLP log export disabled");
    }

    Ok(())
}
