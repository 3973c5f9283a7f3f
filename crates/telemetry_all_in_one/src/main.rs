mod config;

use common::clickhouse::{ClickHouseClient, ClickHouseConfig};
use common::domain::DeviceAssignmentRepository;
use common::nats::NatsClient;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use config::ServiceConfig;
use event_store::{
    ClickHouseEventBackend, EventStore, EventStoreBackend, EventStoreConfig,
    InMemoryWideRowBackend, LoggingFailureSink,
};
use ingest_worker::{
    DeduplicatorKind, InMemoryDeviceAssignmentRepository, IngestWorker, IngestWorkerConfig,
    MqttReceiver, MqttReceiverConfig, NatsReceiver, NatsReceiverConfig,
};
use std::sync::Arc;
use std::time::Duration;
use telemetry_runner::Runner;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        storage_backend = %config.storage_backend,
        tenant_id = %config.tenant_id,
        "starting telemetry-all-in-one service"
    );
    debug!(config = ?config, "loaded configuration");

    let event_store = match create_event_store(&config).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %format!("{:#}", e), "failed to initialize event store");
            std::process::exit(1);
        }
    };

    let assignments = match load_assignments(&config).await {
        Ok(repository) => repository,
        Err(e) => {
            error!(error = %format!("{:#}", e), "failed to load device assignments");
            std::process::exit(1);
        }
    };

    let deduplicator = match dedup_kind(&config) {
        Ok(kind) => kind,
        Err(e) => {
            error!(error = %format!("{:#}", e), "invalid deduplicator configuration");
            std::process::exit(1);
        }
    };

    let mut ingest_worker = IngestWorker::new(
        assignments,
        event_store.clone(),
        IngestWorkerConfig { deduplicator },
    );

    let nats_client = if config.nats_enabled {
        match connect_nats(&config).await {
            Ok(client) => Some(client),
            Err(e) => {
                error!(error = %format!("{:#}", e), "failed to initialize NATS");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    if let Some(client) = &nats_client {
        let receiver = NatsReceiver::new(
            NatsReceiverConfig {
                stream_name: config.nats_stream.clone(),
                consumer_name: config.nats_consumer_name.clone(),
                filter_subject: config.nats_subject.clone(),
                batch_size: config.nats_batch_size,
                batch_wait: Duration::from_secs(config.nats_batch_wait_secs),
                worker_count: config.nats_workers,
            },
            client.create_consumer_client(),
        );
        ingest_worker = ingest_worker.with_receiver(Arc::new(receiver));
    }

    if config.mqtt_enabled {
        let receiver = MqttReceiver::new(MqttReceiverConfig {
            broker_url: config.mqtt_broker_url.clone(),
            client_id: config.mqtt_client_id.clone(),
            tenant_id: config.tenant_id.clone(),
            max_retry_attempts: config.mqtt_max_retry_attempts,
            retry_delay: Duration::from_millis(config.mqtt_retry_delay_ms),
        });
        ingest_worker = ingest_worker.with_receiver(Arc::new(receiver));
    }

    if !config.nats_enabled && !config.mqtt_enabled {
        error!("no receivers enabled; set TELEMETRY_NATS_ENABLED or TELEMETRY_MQTT_ENABLED");
        std::process::exit(1);
    }

    let mut runner = Runner::new();
    for (i, process) in ingest_worker.into_runner_processes().into_iter().enumerate() {
        runner = runner.with_boxed_process(format!("ingest_worker_{}", i), process);
    }

    let exit_code = runner
        .with_closer(move || async move {
            info!("running cleanup tasks");
            event_store.flush().await;
            drop(nats_client);
            shutdown_telemetry(telemetry_providers);
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10))
        .run()
        .await;

    std::process::exit(exit_code);
}

async fn create_event_store(config: &ServiceConfig) -> anyhow::Result<EventStore> {
    let backend: Arc<dyn EventStoreBackend> = match config.storage_backend.as_str() {
        "memory" => {
            warn!("using in-memory event storage; events are lost on restart");
            Arc::new(InMemoryWideRowBackend::new())
        }
        "clickhouse" => {
            info!(url = %config.clickhouse_url, "initializing ClickHouse");
            let client = ClickHouseClient::new(&ClickHouseConfig {
                url: config.clickhouse_url.clone(),
                database: config.clickhouse_database.clone(),
                username: config.clickhouse_username.clone(),
                password: config.clickhouse_password.clone(),
            });
            tokio::time::timeout(
                Duration::from_secs(config.startup_timeout_secs),
                client.ping(),
            )
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to ClickHouse"))??;

            let backend = ClickHouseEventBackend::new(client);
            backend.ensure_schema().await?;
            Arc::new(backend)
        }
        other => anyhow::bail!("unknown storage backend '{}'", other),
    };

    let store_config = EventStoreConfig {
        tenant_id: config.tenant_id.clone(),
        bucket_width: Duration::from_secs(config.bucket_width_secs),
        index_write_timeout: optional_millis(config.index_write_timeout_ms),
        query_timeout: optional_millis(config.query_timeout_ms),
        wait_for_index_writes: config.wait_for_index_writes,
        max_buckets_per_query: (config.max_buckets_per_query > 0)
            .then_some(config.max_buckets_per_query),
    };
    Ok(EventStore::new(backend, store_config).with_failure_sink(Arc::new(LoggingFailureSink)))
}

async fn load_assignments(
    config: &ServiceConfig,
) -> anyhow::Result<Arc<dyn DeviceAssignmentRepository>> {
    let repository = match &config.assignments_file {
        Some(path) => InMemoryDeviceAssignmentRepository::from_file(path).await?,
        None => {
            warn!("no assignments file configured; every device token will be rejected");
            InMemoryDeviceAssignmentRepository::new()
        }
    };
    Ok(Arc::new(repository))
}

async fn connect_nats(config: &ServiceConfig) -> anyhow::Result<NatsClient> {
    info!(url = %config.nats_url, "initializing NATS");
    let client = NatsClient::connect(
        &config.nats_url,
        Duration::from_secs(config.startup_timeout_secs),
    )
    .await?;
    client.ensure_stream(&config.nats_stream).await?;
    Ok(client)
}

fn dedup_kind(config: &ServiceConfig) -> anyhow::Result<DeduplicatorKind> {
    match config.dedup_mode.as_str() {
        "none" => Ok(DeduplicatorKind::None),
        "alternate_id" => Ok(DeduplicatorKind::AlternateId),
        "recent" => Ok(DeduplicatorKind::Recent {
            capacity: config.dedup_capacity,
        }),
        other => anyhow::bail!("unknown dedup mode '{}'", other),
    }
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
