use crate::backend::{EventStoreBackend, PartitionKey};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::domain::{DateRange, DeviceEvent, IndexDimension};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

type WideRow = BTreeMap<(DateTime<Utc>, Uuid), DeviceEvent>;

/// Wide-row store held in process memory.
///
/// Mirrors the persisted layout one to one: point maps keyed by event id and
/// alternate id plus one ordered row per [`PartitionKey`]. Writes and scans for
/// individual dimensions can be made to fail, which is how partial index
/// failures are exercised.
#[derive(Default)]
pub struct InMemoryWideRowBackend {
    events: RwLock<HashMap<(String, Uuid), DeviceEvent>>,
    alternate_ids: RwLock<HashMap<(String, String), Uuid>>,
    partitions: RwLock<HashMap<PartitionKey, WideRow>>,
    failing_writes: RwLock<HashSet<IndexDimension>>,
    failing_scans: RwLock<HashSet<IndexDimension>>,
}

impl InMemoryWideRowBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every index write for `dimension` fail until cleared
    pub async fn fail_writes_for(&self, dimension: IndexDimension) {
        self.failing_writes.write().await.insert(dimension);
    }

    /// Make every partition scan for `dimension` fail until cleared
    pub async fn fail_scans_for(&self, dimension: IndexDimension) {
        self.failing_scans.write().await.insert(dimension);
    }

    pub async fn clear_failures(&self) {
        self.failing_writes.write().await.clear();
        self.failing_scans.write().await.clear();
    }

    /// Every partition holding an entry for `event_id`
    pub async fn partitions_containing(&self, event_id: Uuid) -> Vec<PartitionKey> {
        let partitions = self.partitions.read().await;
        let mut keys: Vec<PartitionKey> = partitions
            .iter()
            .filter(|(_, row)| row.keys().any(|(_, id)| *id == event_id))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl EventStoreBackend for InMemoryWideRowBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write_event(&self, tenant_id: &str, event: &DeviceEvent) -> Result<()> {
        self.events
            .write()
            .await
            .insert((tenant_id.to_string(), event.id), event.clone());
        Ok(())
    }

    async fn write_alternate_id(
        &self,
        tenant_id: &str,
        alternate_id: &str,
        event_id: Uuid,
    ) -> Result<()> {
        self.alternate_ids
            .write()
            .await
            .insert((tenant_id.to_string(), alternate_id.to_string()), event_id);
        Ok(())
    }

    async fn write_index_entry(&self, key: &PartitionKey, event: &DeviceEvent) -> Result<()> {
        if self.failing_writes.read().await.contains(&key.dimension) {
            bail!("injected write failure for {} index", key.dimension);
        }

        debug!(partition = %key, event_id = %event.id, "writing index entry");
        self.partitions
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .insert((event.event_date, event.id), event.clone());
        Ok(())
    }

    async fn read_event(&self, tenant_id: &str, event_id: Uuid) -> Result<Option<DeviceEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(&(tenant_id.to_string(), event_id))
            .cloned())
    }

    async fn read_event_id_by_alternate_id(
        &self,
        tenant_id: &str,
        alternate_id: &str,
    ) -> Result<Option<Uuid>> {
        Ok(self
            .alternate_ids
            .read()
            .await
            .get(&(tenant_id.to_string(), alternate_id.to_string()))
            .copied())
    }

    async fn scan_partition(
        &self,
        key: &PartitionKey,
        range: &DateRange,
    ) -> Result<Vec<DeviceEvent>> {
        if self.failing_scans.read().await.contains(&key.dimension) {
            bail!("injected scan failure for {} index", key.dimension);
        }

        let partitions = self.partitions.read().await;
        let Some(row) = partitions.get(key) else {
            return Ok(Vec::new());
        };

        let lower = match range.start {
            Some(start) => Bound::Included((start, Uuid::nil())),
            None => Bound::Unbounded,
        };
        let upper = match range.end {
            Some(end) => Bound::Included((end, Uuid::from_u128(u128::MAX))),
            None => Bound::Unbounded,
        };

        // An inverted range would make BTreeMap::range panic
        if let (Some(start), Some(end)) = (range.start, range.end) {
            if start > end {
                return Ok(Vec::new());
            }
        }

        Ok(row.range((lower, upper)).map(|(_, event)| event.clone()).collect())
    }
}
