use crate::backend::{EventStoreBackend, PartitionKey};
use crate::bucket::BucketScheme;
use crate::error::{StoreError, StoreResult};
use crate::pager::Pager;
use chrono::{DateTime, Utc};
use common::domain::{DateRange, DeviceEvent, IndexDimension, PageCriteria, SearchResults};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Newest event date first; equal dates fall back to the larger id first so
/// the order is total and repeatable.
pub fn sort_newest_first(events: &mut [DeviceEvent]) {
    events.sort_by(|a, b| {
        b.event_date
            .cmp(&a.event_date)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Plans and runs range queries over the dimension indices.
///
/// Buckets are visited newest first. Within a bucket one scan per entity id is
/// issued concurrently, and the bucket's merged results are sorted before they
/// reach the pager. Every covering bucket is scanned so the reported total is
/// exact. Ranges covering more than `max_buckets` buckets are rejected before
/// any bucket is planned.
#[derive(Clone)]
pub struct QueryFanOutEngine {
    backend: Arc<dyn EventStoreBackend>,
    scheme: BucketScheme,
    tenant_id: String,
    max_buckets: Option<u64>,
}

impl QueryFanOutEngine {
    pub fn new(
        backend: Arc<dyn EventStoreBackend>,
        scheme: BucketScheme,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            scheme,
            tenant_id: tenant_id.into(),
            max_buckets: None,
        }
    }

    pub fn with_max_buckets(mut self, max_buckets: Option<u64>) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    pub async fn query(
        &self,
        dimension: IndexDimension,
        entity_ids: &[Uuid],
        range: &DateRange,
        page: &PageCriteria,
    ) -> StoreResult<SearchResults<DeviceEvent>> {
        self.query_at(dimension, entity_ids, range, page, Utc::now())
            .await
    }

    /// [`Self::query`] with an explicit clock for open-ended ranges
    #[instrument(
        skip_all,
        fields(dimension = %dimension, entity_count = entity_ids.len())
    )]
    pub async fn query_at(
        &self,
        dimension: IndexDimension,
        entity_ids: &[Uuid],
        range: &DateRange,
        page: &PageCriteria,
        now: DateTime<Utc>,
    ) -> StoreResult<SearchResults<DeviceEvent>> {
        let entities = distinct(entity_ids);
        if entities.is_empty() {
            debug!("no entity ids given, returning empty page");
            return Ok(SearchResults::empty());
        }

        let bucket_count = self.scheme.bucket_count_at(range, now);
        if let Some(max) = self.max_buckets {
            if bucket_count > max {
                warn!(bucket_count, max, "query range too wide");
                return Err(StoreError::RangeTooWide {
                    buckets: bucket_count,
                    max,
                });
            }
        }

        let buckets = self.scheme.buckets_covering_at(range, now);
        debug!(
            bucket_count = buckets.len(),
            sub_queries = buckets.len() * entities.len(),
            "planned fan-out query"
        );

        let mut pager = Pager::new(page);
        for bucket in buckets {
            let keys: Vec<PartitionKey> = entities
                .iter()
                .map(|entity_id| {
                    PartitionKey::new(self.tenant_id.clone(), dimension, *entity_id, bucket)
                })
                .collect();

            let scans = keys
                .iter()
                .map(|key| self.backend.scan_partition(key, range));
            let per_entity = try_join_all(scans).await?;

            let mut merged: Vec<DeviceEvent> = per_entity.into_iter().flatten().collect();
            if merged.is_empty() {
                continue;
            }
            sort_newest_first(&mut merged);

            debug!(bucket = %bucket, matches = merged.len(), "bucket scanned");
            pager.extend(merged);
        }

        let results = pager.into_results();
        debug!(
            total = results.total,
            returned = results.results.len(),
            "fan-out query complete"
        );
        Ok(results)
    }
}

fn distinct(entity_ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(entity_ids.len());
    entity_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}
