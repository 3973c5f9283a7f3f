use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;

/// Settings for structured logging and optional OTLP trace export
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otel_endpoint: String,
    pub otel_enabled: bool,
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "telemetry-ingest".to_string(),
            otel_endpoint: "http://localhost:4317".to_string(),
            otel_enabled: false,
            log_level: "info".to_string(),
        }
    }
}

/// Provider handle kept by `main` so pending spans are flushed on shutdown
pub struct TelemetryProviders {
    pub tracer_provider: SdkTracerProvider,
}
