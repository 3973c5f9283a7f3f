use chrono::{DateTime, TimeDelta, Utc};
use common::clickhouse::{ClickHouseClient, ClickHouseConfig};
use common::domain::{
    CommandResponsePayload, DateRange, DeviceAssignment, DeviceAssignmentStatus,
    DeviceEventCreateRequest, EventPayload, IndexDimension, MeasurementPayload, PageCriteria,
};
use event_store::{ClickHouseEventBackend, EventStore, EventStoreConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, Image};
use testcontainers_modules::clickhouse::ClickHouse;
use uuid::Uuid;

/// ClickHouse 24.10; the client validates row types against the server schema
#[derive(Debug, Clone)]
struct ClickHouse24 {
    inner: ClickHouse,
    ports: Vec<ContainerPort>,
}

impl Default for ClickHouse24 {
    fn default() -> Self {
        Self {
            inner: ClickHouse::default(),
            ports: vec![ContainerPort::Tcp(8123)],
        }
    }
}

impl Image for ClickHouse24 {
    fn name(&self) -> &str {
        "clickhouse/clickhouse-server"
    }

    fn tag(&self) -> &str {
        "24.10"
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        self.inner.ready_conditions()
    }

    fn env_vars(
        &self,
    ) -> impl IntoIterator<
        Item = (
            impl Into<std::borrow::Cow<'_, str>>,
            impl Into<std::borrow::Cow<'_, str>>,
        ),
    > {
        self.inner.env_vars()
    }

    fn expose_ports(&self) -> &[ContainerPort] {
        &self.ports
    }
}

async fn start_store() -> (ContainerAsync<ClickHouse24>, EventStore) {
    let container = ClickHouse24::default().start().await.unwrap();
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(8123).await.unwrap();

    let client = ClickHouseClient::new(&ClickHouseConfig {
        url: format!("http://{}:{}", host, port),
        database: "default".to_string(),
        username: "default".to_string(),
        password: String::new(),
    });
    client.ping().await.expect("should be able to ping ClickHouse");

    let backend = ClickHouseEventBackend::new(client);
    backend.ensure_schema().await.unwrap();
    // idempotent
    backend.ensure_schema().await.unwrap();

    let store = EventStore::new(
        Arc::new(backend),
        EventStoreConfig {
            tenant_id: "acme".to_string(),
            bucket_width: Duration::from_secs(60),
            wait_for_index_writes: true,
            ..Default::default()
        },
    );
    (container, store)
}

fn assignment() -> DeviceAssignment {
    DeviceAssignment {
        id: Uuid::new_v4(),
        device_id: Uuid::new_v4(),
        device_token: "pump-3".to_string(),
        customer_id: Some(Uuid::new_v4()),
        area_id: None,
        asset_id: Some(Uuid::new_v4()),
        status: DeviceAssignmentStatus::Active,
        active_date: None,
    }
}

fn measurement(value: f64, event_date: DateTime<Utc>) -> DeviceEventCreateRequest {
    let mut measurements = BTreeMap::new();
    measurements.insert("pressure".to_string(), value);
    DeviceEventCreateRequest::new(EventPayload::Measurement(MeasurementPayload { measurements }))
        .with_event_date(event_date)
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_point_reads_round_trip() {
    let (_container, store) = start_store().await;
    let assignment = assignment();

    let mut request = DeviceEventCreateRequest::new(EventPayload::CommandResponse(
        CommandResponsePayload {
            originating_event_id: Uuid::new_v4(),
            response_event_id: None,
            response: Some("ok".to_string()),
        },
    ))
    .with_alternate_id("resp-42");
    request
        .metadata
        .insert("firmware".to_string(), "2.0.1".to_string());

    let stored = store.put(&assignment, request).await.unwrap();

    assert_eq!(store.get_by_id(stored.id).await.unwrap(), Some(stored.clone()));
    assert_eq!(
        store.get_by_alternate_id("resp-42").await.unwrap(),
        Some(stored)
    );
    assert!(store.get_by_id(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_index_queries_span_buckets() {
    let (_container, store) = start_store().await;
    let assignment = assignment();
    let base = DateTime::<Utc>::from_timestamp_millis(1_717_000_000_000).unwrap();

    for minutes in 0..6 {
        store
            .put(
                &assignment,
                measurement(minutes as f64, base + TimeDelta::minutes(minutes)),
            )
            .await
            .unwrap();
    }

    let range = DateRange::between(base + TimeDelta::minutes(1), base + TimeDelta::minutes(4));
    let by_asset = store
        .query_by_index(
            IndexDimension::Asset,
            &[assignment.asset_id.unwrap()],
            &range,
            &PageCriteria::new(1, 2),
        )
        .await
        .unwrap();

    assert_eq!(by_asset.total, 4);
    assert_eq!(by_asset.results.len(), 2);
    assert_eq!(by_asset.results[0].event_date, base + TimeDelta::minutes(4));
    assert_eq!(by_asset.results[1].event_date, base + TimeDelta::minutes(3));

    let by_area = store
        .query_by_index(
            IndexDimension::Area,
            &[Uuid::new_v4()],
            &range,
            &PageCriteria::all(),
        )
        .await
        .unwrap();
    assert_eq!(by_area.total, 0);
}
