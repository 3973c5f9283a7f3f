mod clickhouse;
mod in_memory;

pub use self::clickhouse::*;
pub use in_memory::*;

use crate::bucket::BucketId;
use anyhow::Result;
use async_trait::async_trait;
use common::domain::{DateRange, DeviceEvent, IndexDimension};
use std::fmt;
use uuid::Uuid;

/// Address of one wide row: every event indexed under `entity_id` for
/// `dimension` whose event date falls in `bucket`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub tenant_id: String,
    pub dimension: IndexDimension,
    pub entity_id: Uuid,
    pub bucket: BucketId,
}

impl PartitionKey {
    pub fn new(
        tenant_id: impl Into<String>,
        dimension: IndexDimension,
        entity_id: Uuid,
        bucket: BucketId,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            dimension,
            entity_id,
            bucket,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant_id, self.dimension, self.entity_id, self.bucket
        )
    }
}

/// Raw storage operations behind [`crate::EventStore`].
///
/// Implementations must be safe to call concurrently from many tasks; the
/// store never serializes access to a backend.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventStoreBackend: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Point record keyed by event id
    async fn write_event(&self, tenant_id: &str, event: &DeviceEvent) -> Result<()>;

    /// Point record mapping an alternate id to an event id
    async fn write_alternate_id(
        &self,
        tenant_id: &str,
        alternate_id: &str,
        event_id: Uuid,
    ) -> Result<()>;

    /// Entry in the wide row addressed by `key`
    async fn write_index_entry(&self, key: &PartitionKey, event: &DeviceEvent) -> Result<()>;

    async fn read_event(&self, tenant_id: &str, event_id: Uuid) -> Result<Option<DeviceEvent>>;

    async fn read_event_id_by_alternate_id(
        &self,
        tenant_id: &str,
        alternate_id: &str,
    ) -> Result<Option<Uuid>>;

    /// Events of one partition whose event date lies inside `range` (inclusive).
    /// Order is unspecified; the query engine sorts.
    async fn scan_partition(&self, key: &PartitionKey, range: &DateRange)
        -> Result<Vec<DeviceEvent>>;
}
