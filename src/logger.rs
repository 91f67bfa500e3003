use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Target of the JSON lifecycle events written to `lifecycle.json`.
pub const LIFECYCLE_TARGET: &str = "lifecycle";

const SERVICE_NAME: &str = "botrunner";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info` or `botrunner=debug,teloxide=warn`.
    pub log_level: String,
    /// Directory for the rolling text log and the JSON lifecycle log.
    pub log_dir: Option<PathBuf>,
    /// OTLP/HTTP base endpoint, e.g. `http://localhost:4318`.
    pub otel_endpoint: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
        }
    }
}

/// Keeps the OTLP providers alive; call `shutdown` before exit to flush them.
#[derive(Default)]
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn shutdown(&self) {
        if let Some(provider) = &self.logger_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("could not flush OTLP logs: {e}");
            }
        }
        if let Some(provider) = &self.meter_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("could not flush OTLP metrics: {e}");
            }
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn otlp_url(base: &str, signal: &str) -> String {
    format!("{}/v1/{signal}", base.trim_end_matches('/'))
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(otlp_url(end_point, "logs"))
        .build()
        .context("building OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(otlp_url(end_point, "metrics"))
        .build()
        .context("building OTLP metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Install the global subscriber.
///
/// - stdout always gets human-readable logs filtered by `log_level`.
/// - with `log_dir`, a daily rolling `botrunner.log` gets the same, and
///   `lifecycle.json` gets one JSON line per worker transition.
/// - with `otel_endpoint`, logs and the lifecycle counters are exported over
///   OTLP/HTTP.
///
/// Must run before the first call to [`metrics`], otherwise the counters bind
/// to the no-op meter.
pub fn init_tracing(settings: &LogSettings) -> Result<Telemetry> {
    // 1) Filters
    let env_filter = EnvFilter::try_new(&settings.log_level)
        .with_context(|| format!("invalid log level `{}`", settings.log_level))?;

    // 2) Rolling files
    let (txt_layer, json_layer) = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log dir {}", dir.display()))?;
            let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, "botrunner.log");
            let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false);

            let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, "lifecycle.json");
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{LIFECYCLE_TARGET}=info")));
            (Some(txt_layer), Some(json_layer))
        }
        None => (None, None),
    };

    // 3) OTLP bridge
    let mut telemetry = Telemetry::default();
    let otel_layer = match &settings.otel_endpoint {
        Some(endpoint) => {
            let logger_provider = init_logs(endpoint)?;
            let meter_provider = init_metrics(endpoint)?;
            global::set_meter_provider(meter_provider.clone());

            let filter = EnvFilter::try_new(&settings.log_level)?
                .add_directive("hyper=off".parse()?)
                .add_directive("tonic=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            let layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter);

            telemetry.logger_provider = Some(logger_provider);
            telemetry.meter_provider = Some(meter_provider);
            Some(layer)
        }
        None => None,
    };

    // 4) Install subscriber
    Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_thread_names(true))
        .with(txt_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(telemetry)
}

/// Write one JSON lifecycle line: `tenant` moved to `state`.
pub fn lifecycle_event(tenant: &str, state: &str) {
    tracing::event!(target: LIFECYCLE_TARGET, Level::INFO, tenant, state);
}

/// Counters for worker lifecycle and join request handling.
pub struct LifecycleMetrics {
    workers_started: Counter<u64>,
    workers_stopped: Counter<u64>,
    connect_failures: Counter<u64>,
    join_requests_approved: Counter<u64>,
    approve_failures: Counter<u64>,
}

impl LifecycleMetrics {
    fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            workers_started: meter
                .u64_counter("workers_started")
                .with_description("Bot sessions opened")
                .build(),
            workers_stopped: meter
                .u64_counter("workers_stopped")
                .with_description("Bot sessions closed")
                .build(),
            connect_failures: meter.u64_counter("connect_failures").build(),
            join_requests_approved: meter.u64_counter("join_requests_approved").build(),
            approve_failures: meter.u64_counter("approve_failures").build(),
        }
    }

    fn attrs(tenant: &str) -> [KeyValue; 1] {
        [KeyValue::new("tenant", tenant.to_string())]
    }

    pub fn worker_started(&self, tenant: &str) {
        self.workers_started.add(1, &Self::attrs(tenant));
    }

    pub fn worker_stopped(&self, tenant: &str) {
        self.workers_stopped.add(1, &Self::attrs(tenant));
    }

    pub fn connect_failed(&self, tenant: &str) {
        self.connect_failures.add(1, &Self::attrs(tenant));
    }

    pub fn join_request_approved(&self, tenant: &str) {
        self.join_requests_approved.add(1, &Self::attrs(tenant));
    }

    pub fn approve_failed(&self, tenant: &str) {
        self.approve_failures.add(1, &Self::attrs(tenant));
    }
}

static METRICS: OnceLock<LifecycleMetrics> = OnceLock::new();

pub fn metrics() -> &'static LifecycleMetrics {
    METRICS.get_or_init(LifecycleMetrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_otlp_url() {
        assert_eq!(otlp_url("http://localhost:4318/", "logs"), "http://localhost:4318/v1/logs");
        assert_eq!(otlp_url("http://collector", "metrics"), "http://collector/v1/metrics");
    }

    #[test]
    fn test_metrics_without_provider_are_noop() {
        // no global provider installed: recording must not panic
        metrics().worker_started("t1");
        metrics().approve_failed("t1");
        lifecycle_event("t1", "running");
    }
}
