use crate::domain::DecodeError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::domain::{
    DecodedDeviceRequest, DeviceEventCreateRequest, DeviceEventType, EventPayload,
    PayloadMetadata, METADATA_DEVICE_TOKEN, METADATA_EVENT_TYPE,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Turns a raw transport payload into zero or more device requests
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait DeviceRequestDecoder: Send + Sync {
    fn decode(
        &self,
        payload: &Bytes,
        metadata: &PayloadMetadata,
    ) -> Result<Vec<DecodedDeviceRequest>, DecodeError>;
}

/// Decoder for JSON payloads.
///
/// Accepts one request object or an array of them:
///
/// ```json
/// {
///   "deviceToken": "truck-17",
///   "type": "Measurement",
///   "originator": "gateway-3",
///   "request": {
///     "alternateId": "m-1",
///     "eventDate": "2024-05-01T10:00:00Z",
///     "metadata": { "firmware": "1.4.2" },
///     "measurements": { "engine.temperature": 98.5 }
///   }
/// }
/// ```
///
/// `deviceToken` and `type` fall back to the `deviceToken` and `eventType`
/// metadata hints. Everything in `request` besides `alternateId`, `eventDate`
/// and `metadata` is the type-specific payload.
#[derive(Debug, Default, Clone)]
pub struct JsonDeviceRequestDecoder;

impl JsonDeviceRequestDecoder {
    pub fn new() -> Self {
        Self
    }

    fn decode_one(
        &self,
        value: Value,
        payload: &Bytes,
        metadata: &PayloadMetadata,
    ) -> Result<DecodedDeviceRequest, DecodeError> {
        let Value::Object(mut envelope) = value else {
            return Err(malformed("request must be a JSON object", payload));
        };

        let device_token = take_string(&mut envelope, "deviceToken")
            .or_else(|| hint(metadata, METADATA_DEVICE_TOKEN))
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| DecodeError::MissingDeviceToken {
                payload: payload.clone(),
            })?;

        let type_name = take_string(&mut envelope, "type")
            .or_else(|| hint(metadata, METADATA_EVENT_TYPE))
            .ok_or_else(|| malformed("missing event type", payload))?;
        let event_type =
            parse_event_type(&type_name).ok_or_else(|| DecodeError::UnsupportedEventType {
                event_type: type_name.clone(),
                payload: payload.clone(),
            })?;

        let originator = take_string(&mut envelope, "originator");

        let mut body = match envelope.remove("request") {
            Some(Value::Object(body)) => body,
            Some(_) => return Err(malformed("'request' must be a JSON object", payload)),
            None => return Err(malformed("missing 'request'", payload)),
        };

        let alternate_id = take_string(&mut body, "alternateId");
        let event_date = match body.remove("eventDate") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(parse_event_date(&raw).ok_or_else(|| {
                malformed(&format!("invalid eventDate: {}", raw), payload)
            })?),
        };
        let event_metadata = match body.remove("metadata") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(raw) => serde_json::from_value::<BTreeMap<String, String>>(raw)
                .map_err(|e| malformed(&format!("invalid metadata: {}", e), payload))?,
        };

        body.insert(
            "eventType".to_string(),
            Value::String(event_type.as_str().to_string()),
        );
        let event_payload: EventPayload = serde_json::from_value(Value::Object(body))
            .map_err(|e| malformed(&format!("invalid {} payload: {}", event_type, e), payload))?;

        Ok(DecodedDeviceRequest {
            device_token,
            originator,
            request: DeviceEventCreateRequest {
                alternate_id,
                event_date,
                metadata: event_metadata,
                payload: event_payload,
            },
        })
    }
}

impl DeviceRequestDecoder for JsonDeviceRequestDecoder {
    fn decode(
        &self,
        payload: &Bytes,
        metadata: &PayloadMetadata,
    ) -> Result<Vec<DecodedDeviceRequest>, DecodeError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| malformed(&e.to_string(), payload))?;

        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.decode_one(item, payload, metadata))
                .collect(),
            single => Ok(vec![self.decode_one(single, payload, metadata)?]),
        }
    }
}

/// Event type names as devices send them: `Measurement`, `measurements`,
/// `DeviceMeasurement`, `state_change`, ...
fn parse_event_type(name: &str) -> Option<DeviceEventType> {
    if let Ok(event_type) = name.parse() {
        return Some(event_type);
    }
    let lowered = name.trim().to_ascii_lowercase();
    lowered
        .strip_prefix("device")
        .and_then(|rest| rest.parse().ok())
}

/// RFC 3339 string or epoch milliseconds
fn parse_event_date(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn hint(metadata: &PayloadMetadata, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn malformed(reason: &str, payload: &Bytes) -> DecodeError {
    DecodeError::Malformed {
        reason: reason.to_string(),
        payload: payload.clone(),
    }
}
