use crate::backend::{EventStoreBackend, PartitionKey};
use crate::codec::{decode_event, encode_event, EncodedEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use common::clickhouse::ClickHouseClient;
use common::domain::{DateRange, DeviceEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

const EVENTS_TABLE: &str = "device_events";
const ALTERNATE_IDS_TABLE: &str = "device_event_alternate_ids";
const INDEX_TABLE: &str = "device_event_index";

/// Event columns shared by the point table and the wide index table
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct DeviceEventRow {
    pub tenant_id: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub id: Uuid,
    pub alternate_id: Option<String>,
    pub event_type: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub device_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub device_assignment_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid::option")]
    pub customer_id: Option<Uuid>,
    #[serde(with = "clickhouse::serde::uuid::option")]
    pub area_id: Option<Uuid>,
    #[serde(with = "clickhouse::serde::uuid::option")]
    pub asset_id: Option<Uuid>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_date: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub received_date: DateTime<Utc>,
    pub metadata: String,
    pub payload: String,
}

impl DeviceEventRow {
    fn from_encoded(tenant_id: &str, encoded: EncodedEvent) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            id: encoded.id,
            alternate_id: encoded.alternate_id,
            event_type: encoded.event_type,
            device_id: encoded.device_id,
            device_assignment_id: encoded.device_assignment_id,
            customer_id: encoded.customer_id,
            area_id: encoded.area_id,
            asset_id: encoded.asset_id,
            event_date: encoded.event_date,
            received_date: encoded.received_date,
            metadata: encoded.metadata,
            payload: encoded.payload,
        }
    }
}

impl From<DeviceEventRow> for EncodedEvent {
    fn from(row: DeviceEventRow) -> Self {
        EncodedEvent {
            id: row.id,
            alternate_id: row.alternate_id,
            event_type: row.event_type,
            device_id: row.device_id,
            device_assignment_id: row.device_assignment_id,
            customer_id: row.customer_id,
            area_id: row.area_id,
            asset_id: row.asset_id,
            event_date: row.event_date,
            received_date: row.received_date,
            metadata: row.metadata,
            payload: row.payload,
        }
    }
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct AlternateIdRow {
    pub tenant_id: String,
    pub alternate_id: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub event_id: Uuid,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct EventIdRow {
    #[serde(with = "clickhouse::serde::uuid")]
    event_id: Uuid,
}

/// One entry of a wide index row; the event columns are denormalized so a
/// partition scan never touches the point table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct IndexEntryRow {
    pub dimension: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub entity_id: Uuid,
    pub bucket: i64,
    pub tenant_id: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub id: Uuid,
    pub alternate_id: Option<String>,
    pub event_type: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub device_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub device_assignment_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid::option")]
    pub customer_id: Option<Uuid>,
    #[serde(with = "clickhouse::serde::uuid::option")]
    pub area_id: Option<Uuid>,
    #[serde(with = "clickhouse::serde::uuid::option")]
    pub asset_id: Option<Uuid>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_date: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub received_date: DateTime<Utc>,
    pub metadata: String,
    pub payload: String,
}

impl IndexEntryRow {
    fn new(key: &PartitionKey, row: DeviceEventRow) -> Self {
        Self {
            dimension: key.dimension.as_str().to_string(),
            entity_id: key.entity_id,
            bucket: key.bucket.0,
            tenant_id: row.tenant_id,
            id: row.id,
            alternate_id: row.alternate_id,
            event_type: row.event_type,
            device_id: row.device_id,
            device_assignment_id: row.device_assignment_id,
            customer_id: row.customer_id,
            area_id: row.area_id,
            asset_id: row.asset_id,
            event_date: row.event_date,
            received_date: row.received_date,
            metadata: row.metadata,
            payload: row.payload,
        }
    }
}

/// ClickHouse implementation of [`EventStoreBackend`].
///
/// All tables use `ReplacingMergeTree`, so replaying a write after a
/// redelivery converges to a single row; reads use `FINAL`.
#[derive(Clone)]
pub struct ClickHouseEventBackend {
    client: ClickHouseClient,
}

impl ClickHouseEventBackend {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    /// Create the event tables when they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        info!(database = %self.client.database(), "ensuring event store tables exist");

        for statement in schema_statements() {
            self.client.execute(&statement).await?;
        }
        Ok(())
    }
}

fn schema_statements() -> Vec<String> {
    let event_columns = "
        tenant_id LowCardinality(String),
        id UUID,
        alternate_id Nullable(String),
        event_type LowCardinality(String),
        device_id UUID,
        device_assignment_id UUID,
        customer_id Nullable(UUID),
        area_id Nullable(UUID),
        asset_id Nullable(UUID),
        event_date DateTime64(3, 'UTC'),
        received_date DateTime64(3, 'UTC'),
        metadata String,
        payload String";

    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {EVENTS_TABLE} ({event_columns})
             ENGINE = ReplacingMergeTree
             ORDER BY (tenant_id, id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {ALTERNATE_IDS_TABLE} (
                tenant_id LowCardinality(String),
                alternate_id String,
                event_id UUID
             )
             ENGINE = ReplacingMergeTree
             ORDER BY (tenant_id, alternate_id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {INDEX_TABLE} (
                dimension LowCardinality(String),
                entity_id UUID,
                bucket Int64,
                {event_columns}
             )
             ENGINE = ReplacingMergeTree
             ORDER BY (tenant_id, dimension, entity_id, bucket, event_date, id)"
        ),
    ]
}

#[async_trait]
impl EventStoreBackend for ClickHouseEventBackend {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn write_event(&self, tenant_id: &str, event: &DeviceEvent) -> Result<()> {
        let row = DeviceEventRow::from_encoded(tenant_id, encode_event(event)?);

        let mut insert = self
            .client
            .get_client()
            .insert::<DeviceEventRow>(EVENTS_TABLE)
            .await
            .map_err(|e| {
                error!("failed to create ClickHouse insert: {}", e);
                e
            })
            .context("failed to create event insert")?;
        insert.write(&row).await.context("failed to write event row")?;
        insert.end().await.context("failed to finalize event insert")?;

        debug!(event_id = %event.id, "stored event point record");
        Ok(())
    }

    async fn write_alternate_id(
        &self,
        tenant_id: &str,
        alternate_id: &str,
        event_id: Uuid,
    ) -> Result<()> {
        let row = AlternateIdRow {
            tenant_id: tenant_id.to_string(),
            alternate_id: alternate_id.to_string(),
            event_id,
        };

        let mut insert = self
            .client
            .get_client()
            .insert::<AlternateIdRow>(ALTERNATE_IDS_TABLE)
            .await
            .context("failed to create alternate id insert")?;
        insert
            .write(&row)
            .await
            .context("failed to write alternate id row")?;
        insert
            .end()
            .await
            .context("failed to finalize alternate id insert")?;
        Ok(())
    }

    async fn write_index_entry(&self, key: &PartitionKey, event: &DeviceEvent) -> Result<()> {
        let row = IndexEntryRow::new(
            key,
            DeviceEventRow::from_encoded(&key.tenant_id, encode_event(event)?),
        );

        let mut insert = self
            .client
            .get_client()
            .insert::<IndexEntryRow>(INDEX_TABLE)
            .await
            .map_err(|e| {
                error!(partition = %key, "failed to create ClickHouse insert: {}", e);
                e
            })
            .context("failed to create index insert")?;
        insert.write(&row).await.context("failed to write index row")?;
        insert.end().await.context("failed to finalize index insert")?;

        debug!(partition = %key, event_id = %event.id, "stored index entry");
        Ok(())
    }

    async fn read_event(&self, tenant_id: &str, event_id: Uuid) -> Result<Option<DeviceEvent>> {
        let row = self
            .client
            .get_client()
            .query(&format!(
                "SELECT ?fields FROM {EVENTS_TABLE} FINAL WHERE tenant_id = ? AND id = toUUID(?) LIMIT 1"
            ))
            .bind(tenant_id)
            .bind(event_id.to_string())
            .fetch_optional::<DeviceEventRow>()
            .await
            .context("failed to read event by id")?;

        match row {
            Some(row) => Ok(Some(decode_event(row.into())?)),
            None => Ok(None),
        }
    }

    async fn read_event_id_by_alternate_id(
        &self,
        tenant_id: &str,
        alternate_id: &str,
    ) -> Result<Option<Uuid>> {
        let row = self
            .client
            .get_client()
            .query(&format!(
                "SELECT ?fields FROM {ALTERNATE_IDS_TABLE} FINAL WHERE tenant_id = ? AND alternate_id = ? LIMIT 1"
            ))
            .bind(tenant_id)
            .bind(alternate_id)
            .fetch_optional::<EventIdRow>()
            .await
            .context("failed to resolve alternate id")?;

        Ok(row.map(|row| row.event_id))
    }

    async fn scan_partition(
        &self,
        key: &PartitionKey,
        range: &DateRange,
    ) -> Result<Vec<DeviceEvent>> {
        let mut sql = format!(
            "SELECT ?fields FROM {INDEX_TABLE} FINAL \
             WHERE tenant_id = ? AND dimension = ? AND entity_id = toUUID(?) AND bucket = ?"
        );
        if range.start.is_some() {
            sql.push_str(" AND event_date >= fromUnixTimestamp64Milli(?)");
        }
        if range.end.is_some() {
            sql.push_str(" AND event_date <= fromUnixTimestamp64Milli(?)");
        }

        let mut query = self
            .client
            .get_client()
            .query(&sql)
            .bind(key.tenant_id.as_str())
            .bind(key.dimension.as_str())
            .bind(key.entity_id.to_string())
            .bind(key.bucket.0);
        if let Some(start) = range.start {
            query = query.bind(start.timestamp_millis());
        }
        if let Some(end) = range.end {
            query = query.bind(end.timestamp_millis());
        }

        let rows = query
            .fetch_all::<DeviceEventRow>()
            .await
            .with_context(|| format!("failed to scan partition {}", key))?;

        rows.into_iter()
            .map(|row| decode_event(row.into()).map_err(anyhow::Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketId;
    use common::domain::{EventPayload, IndexDimension, StateChangePayload};
    use std::collections::BTreeMap;

    fn sample_event() -> DeviceEvent {
        let now = Utc::now();
        DeviceEvent {
            id: Uuid::new_v4(),
            alternate_id: Some("sc-1".to_string()),
            device_id: Uuid::new_v4(),
            device_assignment_id: Uuid::new_v4(),
            customer_id: Some(Uuid::new_v4()),
            area_id: None,
            asset_id: Some(Uuid::new_v4()),
            event_date: now,
            received_date: now,
            metadata: BTreeMap::new(),
            payload: EventPayload::StateChange(StateChangePayload {
                attribute: "presence".to_string(),
                change_type: "missing".to_string(),
                previous_state: Some("present".to_string()),
                new_state: Some("missing".to_string()),
            }),
        }
    }

    #[test]
    fn test_index_row_carries_partition_key_and_event_columns() {
        let event = sample_event();
        let key = PartitionKey::new(
            "acme",
            IndexDimension::Asset,
            event.asset_id.unwrap(),
            BucketId(477_000),
        );

        let row = IndexEntryRow::new(
            &key,
            DeviceEventRow::from_encoded("acme", encode_event(&event).unwrap()),
        );

        assert_eq!(row.dimension, "asset");
        assert_eq!(row.entity_id, key.entity_id);
        assert_eq!(row.bucket, 477_000);
        assert_eq!(row.tenant_id, "acme");
        assert_eq!(row.id, event.id);
        assert_eq!(row.event_type, "StateChange");
        assert!(row.payload.contains("presence"));
    }

    #[test]
    fn test_event_row_decodes_back_to_event() {
        let event = sample_event();
        let row = DeviceEventRow::from_encoded("acme", encode_event(&event).unwrap());

        assert_eq!(decode_event(row.into()).unwrap(), event);
    }

    #[test]
    fn test_schema_orders_index_by_partition_then_time() {
        let statements = schema_statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[2]
            .contains("ORDER BY (tenant_id, dimension, entity_id, bucket, event_date, id)"));
        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
    }
}
