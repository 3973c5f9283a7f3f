//! Field codecs shared by backends that store events as flat rows.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use common::domain::{DeviceEvent, DeviceEventType, EventPayload};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Column-friendly form of a [`DeviceEvent`]: scalars stay typed, the variant
/// payload and the metadata map are carried as JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedEvent {
    pub id: Uuid,
    pub alternate_id: Option<String>,
    pub event_type: String,
    pub device_id: Uuid,
    pub device_assignment_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub area_id: Option<Uuid>,
    pub asset_id: Option<Uuid>,
    pub event_date: DateTime<Utc>,
    pub received_date: DateTime<Utc>,
    pub metadata: String,
    pub payload: String,
}

pub fn encode_event(event: &DeviceEvent) -> StoreResult<EncodedEvent> {
    Ok(EncodedEvent {
        id: event.id,
        alternate_id: event.alternate_id.clone(),
        event_type: event.event_type().as_str().to_string(),
        device_id: event.device_id,
        device_assignment_id: event.device_assignment_id,
        customer_id: event.customer_id,
        area_id: event.area_id,
        asset_id: event.asset_id,
        event_date: event.event_date,
        received_date: event.received_date,
        metadata: encode_metadata(&event.metadata)?,
        payload: serde_json::to_string(&event.payload)?,
    })
}

pub fn decode_event(encoded: EncodedEvent) -> StoreResult<DeviceEvent> {
    let payload: EventPayload = serde_json::from_str(&encoded.payload)?;

    let stored_type: DeviceEventType = encoded
        .event_type
        .parse()
        .map_err(StoreError::InvalidStoredValue)?;
    if stored_type != payload.event_type() {
        return Err(StoreError::InvalidStoredValue(format!(
            "event {} is stored as {} but carries a {} payload",
            encoded.id,
            stored_type,
            payload.event_type()
        )));
    }

    Ok(DeviceEvent {
        id: encoded.id,
        alternate_id: encoded.alternate_id,
        device_id: encoded.device_id,
        device_assignment_id: encoded.device_assignment_id,
        customer_id: encoded.customer_id,
        area_id: encoded.area_id,
        asset_id: encoded.asset_id,
        event_date: encoded.event_date,
        received_date: encoded.received_date,
        metadata: decode_metadata(&encoded.metadata)?,
        payload,
    })
}

pub fn encode_metadata(metadata: &BTreeMap<String, String>) -> StoreResult<String> {
    if metadata.is_empty() {
        return Ok("{}".to_string());
    }
    Ok(serde_json::to_string(metadata)?)
}

pub fn decode_metadata(raw: &str) -> StoreResult<BTreeMap<String, String>> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(raw)?)
}
