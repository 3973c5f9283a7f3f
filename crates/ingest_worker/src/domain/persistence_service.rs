use crate::domain::{DecodeError, DecodedEventHandler};
use async_trait::async_trait;
use bytes::Bytes;
use common::domain::{
    DecodedDeviceRequest, DeviceAssignmentRepository, DeviceEventManagement, DomainError,
    DomainResult, PayloadMetadata,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const PAYLOAD_PREVIEW_BYTES: usize = 256;

/// Default downstream handler: validates a decoded request against device
/// management and persists it.
///
/// Flow:
/// 1. Resolve the active assignment for the request's device token
/// 2. Reject an alternate id that is already taken
/// 3. Store the event under the assignment
pub struct EventPersistenceService {
    assignments: Arc<dyn DeviceAssignmentRepository>,
    events: Arc<dyn DeviceEventManagement>,
}

impl EventPersistenceService {
    pub fn new(
        assignments: Arc<dyn DeviceAssignmentRepository>,
        events: Arc<dyn DeviceEventManagement>,
    ) -> Self {
        Self {
            assignments,
            events,
        }
    }
}

#[async_trait]
impl DecodedEventHandler for EventPersistenceService {
    #[instrument(
        skip_all,
        fields(
            source_id = %source_id,
            device_token = %request.device_token,
            event_type = %request.request.payload.event_type(),
        )
    )]
    async fn handle_decoded_event(
        &self,
        source_id: &str,
        _payload: &Bytes,
        _metadata: &PayloadMetadata,
        request: DecodedDeviceRequest,
    ) -> DomainResult<()> {
        let assignment = self
            .assignments
            .get_active_assignment(&request.device_token)
            .await?
            .ok_or_else(|| {
                warn!("no active assignment for device token");
                DomainError::AssignmentNotFound(request.device_token.clone())
            })?;

        if let Some(alternate_id) = request.request.alternate_id.as_deref() {
            if self
                .events
                .get_device_event_by_alternate_id(alternate_id)
                .await?
                .is_some()
            {
                warn!(alternate_id = %alternate_id, "alternate id already in use");
                return Err(DomainError::DuplicateAlternateId(alternate_id.to_string()));
            }
        }

        let event = self
            .events
            .add_device_event(&assignment, request.request)
            .await?;

        debug!(
            event_id = %event.id,
            assignment_id = %assignment.id,
            "device event persisted"
        );
        Ok(())
    }

    async fn handle_failed_decode(
        &self,
        source_id: &str,
        payload: &Bytes,
        metadata: &PayloadMetadata,
        error: &DecodeError,
    ) {
        let preview_len = payload.len().min(PAYLOAD_PREVIEW_BYTES);
        warn!(
            source_id = %source_id,
            error = %error,
            payload_size = payload.len(),
            payload_preview = %String::from_utf8_lossy(&payload[..preview_len]),
            metadata = %serde_json::Value::Object(metadata.clone()),
            "payload could not be decoded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::domain::{
        DeviceAssignment, DeviceAssignmentStatus, DeviceEvent, DeviceEventCreateRequest,
        EventPayload, MeasurementPayload, MockDeviceAssignmentRepository,
        MockDeviceEventManagement,
    };
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn assignment() -> DeviceAssignment {
        DeviceAssignment {
            id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            device_token: "truck-17".to_string(),
            customer_id: Some(Uuid::new_v4()),
            area_id: None,
            asset_id: None,
            status: DeviceAssignmentStatus::Active,
            active_date: None,
        }
    }

    fn decoded(alternate_id: Option<&str>) -> DecodedDeviceRequest {
        let mut request =
            DeviceEventCreateRequest::new(EventPayload::Measurement(MeasurementPayload::default()));
        request.alternate_id = alternate_id.map(str::to_string);
        DecodedDeviceRequest {
            device_token: "truck-17".to_string(),
            originator: None,
            request,
        }
    }

    fn event_for(assignment: &DeviceAssignment, request: DeviceEventCreateRequest) -> DeviceEvent {
        let now = Utc::now();
        DeviceEvent {
            id: Uuid::new_v4(),
            alternate_id: request.alternate_id,
            device_id: assignment.device_id,
            device_assignment_id: assignment.id,
            customer_id: assignment.customer_id,
            area_id: assignment.area_id,
            asset_id: assignment.asset_id,
            event_date: now,
            received_date: now,
            metadata: BTreeMap::new(),
            payload: request.payload,
        }
    }

    #[tokio::test]
    async fn test_persists_event_for_active_assignment() {
        let assignment = assignment();
        let assignment_id = assignment.id;

        let mut assignments = MockDeviceAssignmentRepository::new();
        let found = assignment.clone();
        assignments
            .expect_get_active_assignment()
            .withf(|token| token == "truck-17")
            .times(1)
            .returning(move |_| Ok(Some(found.clone())));

        let mut events = MockDeviceEventManagement::new();
        events
            .expect_get_device_event_by_alternate_id()
            .times(1)
            .returning(|_| Ok(None));
        events
            .expect_add_device_event()
            .withf(move |a, r| a.id == assignment_id && r.alternate_id.as_deref() == Some("m-1"))
            .times(1)
            .returning(|a, r| Ok(event_for(a, r)));

        let service = EventPersistenceService::new(Arc::new(assignments), Arc::new(events));
        service
            .handle_decoded_event("test", &Bytes::new(), &PayloadMetadata::new(), decoded(Some("m-1")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_device_token_is_rejected() {
        let mut assignments = MockDeviceAssignmentRepository::new();
        assignments
            .expect_get_active_assignment()
            .returning(|_| Ok(None));
        let mut events = MockDeviceEventManagement::new();
        events.expect_add_device_event().never();

        let service = EventPersistenceService::new(Arc::new(assignments), Arc::new(events));
        let err = service
            .handle_decoded_event("test", &Bytes::new(), &PayloadMetadata::new(), decoded(None))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::AssignmentNotFound(ref token) if token == "truck-17"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_taken_alternate_id_is_rejected() {
        let assignment = assignment();
        let mut assignments = MockDeviceAssignmentRepository::new();
        let found = assignment.clone();
        assignments
            .expect_get_active_assignment()
            .returning(move |_| Ok(Some(found.clone())));

        let mut events = MockDeviceEventManagement::new();
        let existing = event_for(&assignment, decoded(Some("m-1")).request);
        events
            .expect_get_device_event_by_alternate_id()
            .returning(move |_| Ok(Some(existing.clone())));
        events.expect_add_device_event().never();

        let service = EventPersistenceService::new(Arc::new(assignments), Arc::new(events));
        let err = service
            .handle_decoded_event("test", &Bytes::new(), &PayloadMetadata::new(), decoded(Some("m-1")))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::DuplicateAlternateId(_)));
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let assignment = assignment();
        let mut assignments = MockDeviceAssignmentRepository::new();
        assignments
            .expect_get_active_assignment()
            .returning(move |_| Ok(Some(assignment.clone())));

        let mut events = MockDeviceEventManagement::new();
        events
            .expect_add_device_event()
            .returning(|_, _| Err(DomainError::EventStoreUnavailable("timeout".to_string())));

        let service = EventPersistenceService::new(Arc::new(assignments), Arc::new(events));
        let err = service
            .handle_decoded_event("test", &Bytes::new(), &PayloadMetadata::new(), decoded(None))
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }
}
