use crate::domain::assignment::DeviceAssignment;
use crate::domain::event::DeviceEvent;
use crate::domain::request::DeviceEventCreateRequest;
use crate::domain::result::DomainResult;
use crate::domain::search::{DateRange, IndexDimension, PageCriteria, SearchResults};
use async_trait::async_trait;
use uuid::Uuid;

/// Storage contract for device events.
///
/// Implemented by the event store crate; consumed by the ingestion pipeline
/// (persistence and deduplication) and by API layers.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceEventManagement: Send + Sync {
    /// Persist one event for the given assignment.
    ///
    /// The caller is responsible for validating the assignment; the store
    /// trusts its input.
    async fn add_device_event(
        &self,
        assignment: &DeviceAssignment,
        request: DeviceEventCreateRequest,
    ) -> DomainResult<DeviceEvent>;

    async fn get_device_event_by_id(&self, event_id: Uuid) -> DomainResult<Option<DeviceEvent>>;

    async fn get_device_event_by_alternate_id(
        &self,
        alternate_id: &str,
    ) -> DomainResult<Option<DeviceEvent>>;

    /// Page of events indexed under any of `entity_ids` for `dimension` within `range`
    async fn list_device_events(
        &self,
        dimension: IndexDimension,
        entity_ids: Vec<Uuid>,
        range: DateRange,
        page: PageCriteria,
    ) -> DomainResult<SearchResults<DeviceEvent>>;
}
