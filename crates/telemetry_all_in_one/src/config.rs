use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // OpenTelemetry configuration
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    /// OTLP/gRPC collector endpoint
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    // Event store configuration
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    /// Storage backend: `memory` or `clickhouse`
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// Width of one time bucket. Must not change once events are stored.
    #[serde(default = "default_bucket_width_secs")]
    pub bucket_width_secs: u64,

    /// Timeout for one dimension index write; 0 disables it
    #[serde(default = "default_index_write_timeout_ms")]
    pub index_write_timeout_ms: u64,

    /// Timeout for one index query; 0 disables it
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Widest query accepted, in buckets; 0 disables the limit
    #[serde(default = "default_max_buckets_per_query")]
    pub max_buckets_per_query: u64,

    /// Await dimension index writes before acknowledging an event
    #[serde(default)]
    pub wait_for_index_writes: bool,

    // ClickHouse configuration
    #[serde(default = "default_clickhouse_url")]
    pub clickhouse_url: String,

    #[serde(default = "default_clickhouse_database")]
    pub clickhouse_database: String,

    #[serde(default = "default_clickhouse_username")]
    pub clickhouse_username: String,

    #[serde(default = "default_clickhouse_password")]
    pub clickhouse_password: String,

    // Device assignments
    /// JSON file with the device assignments to serve lookups from
    #[serde(default)]
    pub assignments_file: Option<String>,

    // Deduplication
    /// `none`, `alternate_id` or `recent`
    #[serde(default = "default_dedup_mode")]
    pub dedup_mode: String,

    /// Fingerprints remembered by the `recent` deduplicator
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    // NATS configuration
    #[serde(default = "default_nats_enabled")]
    pub nats_enabled: bool,

    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Stream carrying raw device payloads on `{stream}.{device_token}`
    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,

    #[serde(default = "default_nats_subject")]
    pub nats_subject: String,

    #[serde(default = "default_nats_consumer_name")]
    pub nats_consumer_name: String,

    #[serde(default = "default_nats_workers")]
    pub nats_workers: usize,

    #[serde(default = "default_nats_batch_size")]
    pub nats_batch_size: usize,

    #[serde(default = "default_nats_batch_wait_secs")]
    pub nats_batch_wait_secs: u64,

    // MQTT configuration
    #[serde(default)]
    pub mqtt_enabled: bool,

    #[serde(default = "default_mqtt_broker_url")]
    pub mqtt_broker_url: String,

    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    #[serde(default = "default_mqtt_max_retry_attempts")]
    pub mqtt_max_retry_attempts: u32,

    #[serde(default = "default_mqtt_retry_delay_ms")]
    pub mqtt_retry_delay_ms: u64,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "telemetry-all-in-one".to_string()
}

fn default_tenant_id() -> String {
    event_store::DEFAULT_TENANT_ID.to_string()
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_bucket_width_secs() -> u64 {
    3_600
}

fn default_index_write_timeout_ms() -> u64 {
    10_000
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_max_buckets_per_query() -> u64 {
    event_store::DEFAULT_MAX_BUCKETS_PER_QUERY
}

fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_database() -> String {
    "telemetry".to_string()
}

fn default_clickhouse_username() -> String {
    "default".to_string()
}

fn default_clickhouse_password() -> String {
    String::new()
}

fn default_dedup_mode() -> String {
    "alternate_id".to_string()
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_nats_enabled() -> bool {
    true
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream() -> String {
    "device_payloads".to_string()
}

fn default_nats_subject() -> String {
    "device_payloads.>".to_string()
}

fn default_nats_consumer_name() -> String {
    "telemetry-ingest".to_string()
}

fn default_nats_workers() -> usize {
    ingest_worker::DEFAULT_BROKER_WORKER_COUNT
}

fn default_nats_batch_size() -> usize {
    32
}

fn default_nats_batch_wait_secs() -> u64 {
    5
}

fn default_mqtt_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_mqtt_client_id() -> String {
    "telemetry-all-in-one".to_string()
}

fn default_mqtt_max_retry_attempts() -> u32 {
    10
}

fn default_mqtt_retry_delay_ms() -> u64 {
    2_000
}

fn default_startup_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("TELEMETRY"))
            .build()?
            .try_deserialize()
    }
}
