use crate::domain::event::EventPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Transport metadata accompanying a raw payload (topic, headers, decoder hints).
pub type PayloadMetadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key carrying a device token hint for decoders
pub const METADATA_DEVICE_TOKEN: &str = "deviceToken";

/// Metadata key carrying an event type hint for decoders
pub const METADATA_EVENT_TYPE: &str = "eventType";

/// Request to create one device event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEventCreateRequest {
    #[serde(default)]
    pub alternate_id: Option<String>,
    /// When the event happened on the device; defaults to ingestion time
    #[serde(default)]
    pub event_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub payload: EventPayload,
}

impl DeviceEventCreateRequest {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            alternate_id: None,
            event_date: None,
            metadata: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_alternate_id(mut self, alternate_id: impl Into<String>) -> Self {
        self.alternate_id = Some(alternate_id.into());
        self
    }

    pub fn with_event_date(mut self, event_date: DateTime<Utc>) -> Self {
        self.event_date = Some(event_date);
        self
    }
}

/// Output of a payload decoder: a create request addressed to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedDeviceRequest {
    pub device_token: String,
    #[serde(default)]
    pub originator: Option<String>,
    pub request: DeviceEventCreateRequest,
}
