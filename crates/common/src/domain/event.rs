use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Discriminator for the payload carried by a [`DeviceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceEventType {
    Measurement,
    Location,
    Alert,
    CommandInvocation,
    CommandResponse,
    StateChange,
}

impl DeviceEventType {
    pub const ALL: [DeviceEventType; 6] = [
        DeviceEventType::Measurement,
        DeviceEventType::Location,
        DeviceEventType::Alert,
        DeviceEventType::CommandInvocation,
        DeviceEventType::CommandResponse,
        DeviceEventType::StateChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceEventType::Measurement => "Measurement",
            DeviceEventType::Location => "Location",
            DeviceEventType::Alert => "Alert",
            DeviceEventType::CommandInvocation => "CommandInvocation",
            DeviceEventType::CommandResponse => "CommandResponse",
            DeviceEventType::StateChange => "StateChange",
        }
    }
}

impl fmt::Display for DeviceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceEventType {
    type Err = String;

    /// Case-insensitive; accepts the plural `Measurements` used by some device firmware.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], "");
        match normalized.as_str() {
            "measurement" | "measurements" => Ok(DeviceEventType::Measurement),
            "location" => Ok(DeviceEventType::Location),
            "alert" => Ok(DeviceEventType::Alert),
            "commandinvocation" => Ok(DeviceEventType::CommandInvocation),
            "commandresponse" => Ok(DeviceEventType::CommandResponse),
            "statechange" => Ok(DeviceEventType::StateChange),
            _ => Err(format!("unknown device event type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSource {
    Device,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandInitiator {
    Rest,
    Script,
    Scheduler,
    BatchOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandTarget {
    Assignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementPayload {
    pub measurements: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    #[serde(default = "default_alert_source")]
    pub source: AlertSource,
    #[serde(default = "default_alert_level")]
    pub level: AlertLevel,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub message: String,
}

fn default_alert_source() -> AlertSource {
    AlertSource::Device
}

fn default_alert_level() -> AlertLevel {
    AlertLevel::Info
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInvocationPayload {
    pub initiator: CommandInitiator,
    #[serde(default)]
    pub initiator_id: Option<String>,
    pub target: CommandTarget,
    #[serde(default)]
    pub target_id: Option<String>,
    pub command_token: String,
    #[serde(default)]
    pub parameter_values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponsePayload {
    pub originating_event_id: Uuid,
    #[serde(default)]
    pub response_event_id: Option<Uuid>,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangePayload {
    pub attribute: String,
    #[serde(rename = "type")]
    pub change_type: String,
    #[serde(default)]
    pub previous_state: Option<String>,
    #[serde(default)]
    pub new_state: Option<String>,
}

/// Type-specific content of a device event.
///
/// Serialized with an `eventType` tag so a stored payload is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum EventPayload {
    Measurement(MeasurementPayload),
    Location(LocationPayload),
    Alert(AlertPayload),
    CommandInvocation(CommandInvocationPayload),
    CommandResponse(CommandResponsePayload),
    StateChange(StateChangePayload),
}

impl EventPayload {
    pub fn event_type(&self) -> DeviceEventType {
        match self {
            EventPayload::Measurement(_) => DeviceEventType::Measurement,
            EventPayload::Location(_) => DeviceEventType::Location,
            EventPayload::Alert(_) => DeviceEventType::Alert,
            EventPayload::CommandInvocation(_) => DeviceEventType::CommandInvocation,
            EventPayload::CommandResponse(_) => DeviceEventType::CommandResponse,
            EventPayload::StateChange(_) => DeviceEventType::StateChange,
        }
    }
}

/// A persisted device event.
///
/// Events are immutable once written. The customer, area and asset ids are a
/// snapshot of the owning assignment at write time and are never corrected
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub id: Uuid,
    pub alternate_id: Option<String>,
    pub device_id: Uuid,
    pub device_assignment_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub area_id: Option<Uuid>,
    pub asset_id: Option<Uuid>,
    pub event_date: DateTime<Utc>,
    pub received_date: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub payload: EventPayload,
}

impl DeviceEvent {
    pub fn event_type(&self) -> DeviceEventType {
        self.payload.event_type()
    }
}

/// Drop sub-millisecond precision; buckets and stored timestamps are millisecond based.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_from_str_is_lenient() {
        assert_eq!(
            "measurements".parse::<DeviceEventType>().unwrap(),
            DeviceEventType::Measurement
        );
        assert_eq!(
            "STATE_CHANGE".parse::<DeviceEventType>().unwrap(),
            DeviceEventType::StateChange
        );
        assert_eq!(
            "command-response".parse::<DeviceEventType>().unwrap(),
            DeviceEventType::CommandResponse
        );
        assert!("registration".parse::<DeviceEventType>().is_err());
    }

    #[test]
    fn test_payload_serializes_with_event_type_tag() {
        let payload = EventPayload::Alert(AlertPayload {
            source: AlertSource::System,
            level: AlertLevel::Critical,
            alert_type: "engine.overheat".to_string(),
            message: "Engine temperature above threshold".to_string(),
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["eventType"], "Alert");
        assert_eq!(json["type"], "engine.overheat");
        assert_eq!(json["level"], "Critical");
    }

    #[test]
    fn test_alert_defaults_when_source_and_level_missing() {
        let payload: EventPayload = serde_json::from_value(serde_json::json!({
            "eventType": "Alert",
            "type": "door.open",
            "message": "Door opened"
        }))
        .unwrap();

        match payload {
            EventPayload::Alert(alert) => {
                assert_eq!(alert.source, AlertSource::Device);
                assert_eq!(alert.level, AlertLevel::Info);
            }
            other => panic!("expected alert, got {:?}", other),
        }
    }

    #[test]
    fn test_truncate_to_millis() {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate_to_millis(ts);
        assert_eq!(truncated.timestamp_millis(), ts.timestamp_millis());
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_000_000);
    }
}
