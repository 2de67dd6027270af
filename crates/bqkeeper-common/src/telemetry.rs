//! Logging, tracing and metrics setup for the bqkeeper binary
//!
//! Logs go to stdout, one JSON object per line by default. Each reconcile
//! runs inside a span carrying `dataset`, `namespace` and `project`, and the
//! JSON formatter copies the current span onto every line, so a log query
//! for one dataset returns its whole history. `BQKEEPER_LOG_FORMAT=text`
//! switches to human-readable output for local runs.
//!
//! With `OTEL_EXPORTER_OTLP_ENDPOINT` set, the reconcile spans and the
//! `bqkeeper_*` instruments from [`crate::metrics`] are also exported over
//! OTLP/gRPC, tagged with the pod identity from the downward API.

use std::str::FromStr;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Service name reported on spans, metrics and the resource
pub const SERVICE_NAME: &str = "bqkeeper";

/// Environment variable selecting the log line format
pub const LOG_FORMAT_ENV: &str = "BQKEEPER_LOG_FORMAT";

/// Our crates log at debug; kube watch chatter and HTTP stacks stay quiet
const DEFAULT_FILTER: &str = "info,bqkeeper=debug,bqkeeper_common=debug,bqkeeper_dataset=debug,\
kube_runtime=info,kube_client=warn,tower=warn,hyper=warn,hyper_util=warn,reqwest=warn";

/// Downward API variables copied onto the OTLP resource
const POD_IDENTITY: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// OTLP span exporter could not be built
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// OTLP metric exporter could not be built
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    /// `BQKEEPER_LOG_FORMAT` holds an unknown value
    #[error("unknown log format {0:?}, expected \"json\" or \"text\"")]
    LogFormat(String),
}

/// Shape of the lines written to stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line with the current span flattened in
    #[default]
    Json,
    /// Human-readable lines
    Text,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            other => Err(TelemetryError::LogFormat(other.to_string())),
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces and metrics
    pub service_name: String,

    /// OTLP collector, e.g. `http://otel-collector:4317`; `None` keeps
    /// everything local
    pub otlp_endpoint: Option<String>,

    /// Line format for stdout
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            otlp_endpoint: None,
            log_format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    /// Read `OTEL_EXPORTER_OTLP_ENDPOINT` and `BQKEEPER_LOG_FORMAT`
    pub fn from_env() -> Result<Self, TelemetryError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TelemetryError> {
        let log_format = match lookup(LOG_FORMAT_ENV) {
            Some(value) => value.parse()?,
            None => LogFormat::default(),
        };
        Ok(Self {
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.is_empty()),
            log_format,
            ..Self::default()
        })
    }
}

/// Install the global subscriber, and the OTLP pipelines when configured
///
/// Call once at startup, inside the Tokio runtime; the batch exporters
/// spawn onto it. `RUST_LOG` overrides the default filter.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = build_resource(&config.service_name, |key| std::env::var(key).ok());
            init_otlp_metrics(endpoint, resource.clone())?;
            let provider = init_otlp_tracer(endpoint, resource)?;
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json_layer = (config.log_format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
    });
    let text_layer =
        (config.log_format == LogFormat::Text).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(())
}

fn build_resource(service_name: &str, lookup: impl Fn(&str) -> Option<String>) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    attributes.extend(
        POD_IDENTITY
            .iter()
            .filter_map(|(env, key)| lookup(env).map(|value| KeyValue::new(*key, value))),
    );
    Resource::new(attributes)
}

fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

fn init_otlp_metrics(endpoint: &str, resource: Resource) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader =
        opentelemetry_sdk::metrics::PeriodicReader::builder(exporter, runtime::Tokio).build();

    global::set_meter_provider(
        opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource)
            .build(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{Key, Value};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" TEXT ".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let err = "logfmt".parse::<LogFormat>().unwrap_err();
        assert!(matches!(err, TelemetryError::LogFormat(ref v) if v == "logfmt"));
    }

    #[test]
    fn empty_environment_logs_json_locally() {
        let config = TelemetryConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.service_name, SERVICE_NAME);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn environment_selects_text_and_collector() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            (LOG_FORMAT_ENV, "text"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://otel-collector:4317"),
        ]))
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(
            config.otlp_endpoint.as_deref(),
            Some("http://otel-collector:4317")
        );
    }

    #[test]
    fn blank_collector_endpoint_disables_export() {
        let config =
            TelemetryConfig::from_lookup(lookup(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "")])).unwrap();
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn resource_carries_pod_identity_when_present() {
        let resource = build_resource(
            SERVICE_NAME,
            lookup(&[("POD_NAME", "bqkeeper-7d9f"), ("POD_NAMESPACE", "bqkeeper-system")]),
        );
        assert_eq!(
            resource.get(Key::from_static_str("service.name")),
            Some(Value::from(SERVICE_NAME))
        );
        assert_eq!(
            resource.get(Key::from_static_str("k8s.pod.name")),
            Some(Value::from("bqkeeper-7d9f"))
        );
        assert_eq!(
            resource.get(Key::from_static_str("k8s.namespace.name")),
            Some(Value::from("bqkeeper-system"))
        );
        assert_eq!(resource.get(Key::from_static_str("k8s.node.name")), None);
    }

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
