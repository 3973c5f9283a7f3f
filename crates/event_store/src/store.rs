use crate::backend::{EventStoreBackend, PartitionKey};
use crate::bucket::{BucketScheme, DEFAULT_BUCKET_WIDTH};
use crate::dead_letter::{IndexWriteFailure, IndexWriteFailureSink, LoggingFailureSink};
use crate::error::{StoreError, StoreResult};
use crate::query::QueryFanOutEngine;
use async_trait::async_trait;
use chrono::Utc;
use common::domain::{
    truncate_to_millis, DateRange, DeviceAssignment, DeviceEvent, DeviceEventCreateRequest,
    DeviceEventManagement, DomainResult, IndexDimension, PageCriteria, SearchResults,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_TENANT_ID: &str = "default";

/// A little over a year of hourly buckets
pub const DEFAULT_MAX_BUCKETS_PER_QUERY: u64 = 10_000;

/// Settings for one [`EventStore`]
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    pub tenant_id: String,
    /// Fixed for the lifetime of the stored data; changing it orphans old partitions
    pub bucket_width: Duration,
    /// Upper bound for one dimension index write; `None` waits forever
    pub index_write_timeout: Option<Duration>,
    /// Upper bound for a whole `query_by_index` call; `None` waits forever
    pub query_timeout: Option<Duration>,
    /// Await dimension index writes inside `put` instead of detaching them
    pub wait_for_index_writes: bool,
    /// Widest query accepted, in buckets; `None` accepts any range
    pub max_buckets_per_query: Option<u64>,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            bucket_width: DEFAULT_BUCKET_WIDTH,
            index_write_timeout: Some(Duration::from_secs(10)),
            query_timeout: Some(Duration::from_secs(30)),
            wait_for_index_writes: false,
            max_buckets_per_query: Some(DEFAULT_MAX_BUCKETS_PER_QUERY),
        }
    }
}

/// Multi-index device event store.
///
/// `put` writes the point records (by id and by alternate id) before
/// returning; an error there fails the call. The dimension index entries
/// (assignment, and customer/area/asset when the assignment carries them) are
/// dispatched as independent tasks. A failed or timed-out dimension write is
/// logged and handed to the [`IndexWriteFailureSink`] but never fails `put`
/// and never undoes sibling writes, so the index views may briefly disagree.
pub struct EventStore {
    backend: Arc<dyn EventStoreBackend>,
    config: EventStoreConfig,
    scheme: BucketScheme,
    engine: QueryFanOutEngine,
    failure_sink: Arc<dyn IndexWriteFailureSink>,
    index_writes: TaskTracker,
}

impl EventStore {
    pub fn new(backend: Arc<dyn EventStoreBackend>, config: EventStoreConfig) -> Self {
        let scheme = BucketScheme::new(config.bucket_width);
        let engine = QueryFanOutEngine::new(backend.clone(), scheme, config.tenant_id.clone())
            .with_max_buckets(config.max_buckets_per_query);

        debug!(
            backend = backend.name(),
            tenant_id = %config.tenant_id,
            bucket_width_ms = scheme.width_ms(),
            "event store created"
        );

        Self {
            backend,
            config,
            scheme,
            engine,
            failure_sink: Arc::new(LoggingFailureSink),
            index_writes: TaskTracker::new(),
        }
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn IndexWriteFailureSink>) -> Self {
        self.failure_sink = sink;
        self
    }

    pub fn scheme(&self) -> &BucketScheme {
        &self.scheme
    }

    /// Persist one event for `assignment`. The assignment is trusted as given.
    #[instrument(
        skip(self, assignment, request),
        fields(assignment_id = %assignment.id, event_type = %request.payload.event_type())
    )]
    pub async fn put(
        &self,
        assignment: &DeviceAssignment,
        request: DeviceEventCreateRequest,
    ) -> StoreResult<DeviceEvent> {
        let received_date = truncate_to_millis(Utc::now());
        let event = DeviceEvent {
            id: Uuid::new_v4(),
            alternate_id: request.alternate_id,
            device_id: assignment.device_id,
            device_assignment_id: assignment.id,
            customer_id: assignment.customer_id,
            area_id: assignment.area_id,
            asset_id: assignment.asset_id,
            event_date: request
                .event_date
                .map(truncate_to_millis)
                .unwrap_or(received_date),
            received_date,
            metadata: request.metadata,
            payload: request.payload,
        };

        let tenant_id = self.config.tenant_id.as_str();
        self.backend.write_event(tenant_id, &event).await?;
        if let Some(alternate_id) = &event.alternate_id {
            self.backend
                .write_alternate_id(tenant_id, alternate_id, event.id)
                .await?;
        }

        self.dispatch_index_writes(assignment, &event).await;

        debug!(event_id = %event.id, "event stored");
        Ok(event)
    }

    /// Sequential `put` of every request. The first point-write failure fails
    /// the whole call; events stored before it stay stored.
    pub async fn put_all(
        &self,
        assignment: &DeviceAssignment,
        requests: Vec<DeviceEventCreateRequest>,
    ) -> StoreResult<Vec<DeviceEvent>> {
        let mut events = Vec::with_capacity(requests.len());
        for request in requests {
            events.push(self.put(assignment, request).await?);
        }
        Ok(events)
    }

    pub async fn get_by_id(&self, event_id: Uuid) -> StoreResult<Option<DeviceEvent>> {
        Ok(self
            .backend
            .read_event(&self.config.tenant_id, event_id)
            .await?)
    }

    pub async fn get_by_alternate_id(&self, alternate_id: &str) -> StoreResult<Option<DeviceEvent>> {
        let event_id = self
            .backend
            .read_event_id_by_alternate_id(&self.config.tenant_id, alternate_id)
            .await?;

        match event_id {
            Some(event_id) => self.get_by_id(event_id).await,
            None => Ok(None),
        }
    }

    /// Page of events indexed under any of `entity_ids`, bounded by the
    /// configured query timeout.
    pub async fn query_by_index(
        &self,
        dimension: IndexDimension,
        entity_ids: &[Uuid],
        range: &DateRange,
        page: &PageCriteria,
    ) -> StoreResult<SearchResults<DeviceEvent>> {
        let query = self.engine.query(dimension, entity_ids, range, page);
        match self.config.query_timeout {
            Some(limit) => tokio::time::timeout(limit, query).await.map_err(|_| {
                warn!(dimension = %dimension, timeout_ms = limit.as_millis(), "query timed out");
                StoreError::Timeout(limit)
            })?,
            None => query.await,
        }
    }

    /// [`Self::query_by_index`] that also gives up as soon as `cancel` fires.
    /// Outstanding sub-queries are dropped either way.
    pub async fn query_by_index_with_cancel(
        &self,
        dimension: IndexDimension,
        entity_ids: &[Uuid],
        range: &DateRange,
        page: &PageCriteria,
        cancel: &CancellationToken,
    ) -> StoreResult<SearchResults<DeviceEvent>> {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(dimension = %dimension, "query cancelled");
                Err(StoreError::Cancelled)
            }
            result = self.query_by_index(dimension, entity_ids, range, page) => result,
        }
    }

    /// Wait until every detached dimension write has finished
    pub async fn flush(&self) {
        self.index_writes.close();
        self.index_writes.wait().await;
        self.index_writes.reopen();
    }

    async fn dispatch_index_writes(&self, assignment: &DeviceAssignment, event: &DeviceEvent) {
        let event = Arc::new(event.clone());
        let bucket = self.scheme.bucket_of(event.event_date);
        let mut inline = Vec::new();
        for dimension in IndexDimension::ALL {
            let Some(entity_id) = assignment.entity_for(dimension) else {
                continue;
            };

            let write = IndexWrite {
                key: PartitionKey::new(self.config.tenant_id.clone(), dimension, entity_id, bucket),
                event: event.clone(),
                backend: self.backend.clone(),
                sink: self.failure_sink.clone(),
                timeout: self.config.index_write_timeout,
            };

            if self.config.wait_for_index_writes {
                inline.push(write.run());
            } else {
                self.index_writes.spawn(write.run());
            }
        }

        if !inline.is_empty() {
            futures::future::join_all(inline).await;
        }
    }
}

/// One detached dimension index write
struct IndexWrite {
    key: PartitionKey,
    event: Arc<DeviceEvent>,
    backend: Arc<dyn EventStoreBackend>,
    sink: Arc<dyn IndexWriteFailureSink>,
    timeout: Option<Duration>,
}

impl IndexWrite {
    async fn run(self) {
        let write = self.backend.write_index_entry(&self.key, &self.event);
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "index write timed out after {}ms",
                    limit.as_millis()
                )),
            },
            None => write.await,
        };

        if let Err(e) = outcome {
            warn!(
                event_id = %self.event.id,
                partition = %self.key,
                error = %e,
                "dimension index write failed"
            );
            self.sink
                .record(IndexWriteFailure {
                    event_id: self.event.id,
                    dimension: self.key.dimension,
                    entity_id: self.key.entity_id,
                    cause: format!("{:#}", e),
                    failed_at: Utc::now(),
                })
                .await;
        }
    }
}

#[async_trait]
impl DeviceEventManagement for EventStore {
    async fn add_device_event(
        &self,
        assignment: &DeviceAssignment,
        request: DeviceEventCreateRequest,
    ) -> DomainResult<DeviceEvent> {
        Ok(self.put(assignment, request).await?)
    }

    async fn get_device_event_by_id(&self, event_id: Uuid) -> DomainResult<Option<DeviceEvent>> {
        Ok(self.get_by_id(event_id).await?)
    }

    async fn get_device_event_by_alternate_id(
        &self,
        alternate_id: &str,
    ) -> DomainResult<Option<DeviceEvent>> {
        Ok(self.get_by_alternate_id(alternate_id).await?)
    }

    async fn list_device_events(
        &self,
        dimension: IndexDimension,
        entity_ids: Vec<Uuid>,
        range: DateRange,
        page: PageCriteria,
    ) -> DomainResult<SearchResults<DeviceEvent>> {
        Ok(self
            .query_by_index(dimension, &entity_ids, &range, &page)
            .await?)
    }
}
