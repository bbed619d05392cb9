//! Logging and trace export for the device daemon.
//!
//! [`init_tracing`] installs the global subscriber: an env filter, the
//! console formatter picked by [`LogFormat`], and an OTLP span layer when a
//! collector is configured.  Keep the returned [`TelemetryGuard`] alive until
//! exit so buffered spans are flushed.
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Collector base URL (e.g. `http://localhost:4318`); enables span export over HTTP. |
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `HOMEWATCH_LOG_FORMAT` | `json` or `compact`; overrides the config file. |
//! | `HOSTNAME` | Reported as `host.name` on exported spans. |
//!
//! ```rust,no_run
//! use homewatch_runtime::telemetry::{self, LogFormat};
//! let _telemetry = telemetry::init_tracing("homewatch", LogFormat::Compact);
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FORMAT_ENV: &str = "HOMEWATCH_LOG_FORMAT";

/// Namespace shared by every homewatch process in exported resources.
const SERVICE_NAMESPACE: &str = "homewatch";

/// Console log layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// Newline-delimited JSON, one object per event.
    Json,
}

impl LogFormat {
    /// Parse a format name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }

    /// Format requested through [`LOG_FORMAT_ENV`], if any.
    pub fn from_env() -> Option<Self> {
        Self::from_name(&std::env::var(LOG_FORMAT_ENV).ok()?)
    }
}

/// Install the global `tracing` subscriber for `service_name`.
///
/// Span export is only wired when `OTEL_EXPORTER_OTLP_ENDPOINT` is set and
/// the exporter builds; otherwise logs go to the console alone.
pub fn init_tracing(service_name: &str, format: LogFormat) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let provider = build_provider(service_name);
    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer(SERVICE_NAMESPACE))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(console_layer(format))
        .init();

    TelemetryGuard(provider)
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    match format {
        LogFormat::Json => fmt::layer().json().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    }
}

/// Flushes and shuts down the span exporter on drop.
pub struct TelemetryGuard(Option<SdkTracerProvider>);

impl TelemetryGuard {
    /// Whether spans are being exported to a collector.
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[homewatch] span exporter shutdown failed: {e}");
        }
    }
}

/// Attributes identifying this daemon on exported spans.
fn resource_attributes(hostname: Option<String>) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new("service.namespace", SERVICE_NAMESPACE),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ];
    if let Some(host) = hostname.filter(|h| !h.trim().is_empty()) {
        attributes.push(KeyValue::new("host.name", host));
    }
    attributes
}

fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[homewatch] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .with_attributes(resource_attributes(std::env::var("HOSTNAME").ok()))
        .build();

    // Synchronous export: the daemon builds its runtime after this call.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a KeyValue> {
        attributes.iter().find(|kv| kv.key.as_str() == key)
    }

    #[test]
    fn build_provider_returns_none_without_endpoint() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(build_provider("homewatch").is_none());
    }

    #[test]
    fn idle_guard_reports_no_export() {
        let guard = TelemetryGuard(None);
        assert!(!guard.is_exporting());
        drop(guard);
    }

    #[test]
    fn resource_names_namespace_version_and_host() {
        let attributes = resource_attributes(Some("hub-kitchen".to_string()));
        let namespace = attribute(&attributes, "service.namespace").map(|kv| kv.value.as_str());
        assert_eq!(namespace.as_deref(), Some("homewatch"));
        let version = attribute(&attributes, "service.version").map(|kv| kv.value.as_str());
        assert_eq!(version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
        let host = attribute(&attributes, "host.name").map(|kv| kv.value.as_str());
        assert_eq!(host.as_deref(), Some("hub-kitchen"));
    }

    #[test]
    fn blank_hostname_is_left_out() {
        let attributes = resource_attributes(Some("  ".to_string()));
        assert!(attribute(&attributes, "host.name").is_none());
        assert!(attribute(&resource_attributes(None), "host.name").is_none());
    }

    #[test]
    fn log_format_names() -> Result<(), serde_json::Error> {
        assert_eq!(LogFormat::from_name(" JSON "), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_name("compact"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::from_name("pretty"), None);
        assert_eq!(serde_json::from_str::<LogFormat>("\"json\"")?, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Compact);
        Ok(())
    }
}
