use common::domain::{DomainError, DomainResult};

/// MQTT topic of the form `{tenant_id}/{device_token}`
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTopic {
    pub tenant_id: String,
    pub device_token: String,
}

/// Parse an MQTT topic in the format `{tenant_id}/{device_token}`
///
/// # Examples
/// ```
/// use ingest_worker::receivers::parse_topic;
///
/// let parsed = parse_topic("acme/truck-17").unwrap();
/// assert_eq!(parsed.tenant_id, "acme");
/// assert_eq!(parsed.device_token, "truck-17");
/// ```
pub fn parse_topic(topic: &str) -> DomainResult<ParsedTopic> {
    let Some((tenant_id, device_token)) = topic.split_once('/') else {
        return Err(DomainError::InvalidEventRequest(format!(
            "invalid topic '{}': expected '{{tenant_id}}/{{device_token}}'",
            topic
        )));
    };

    let tenant_id = tenant_id.trim();
    let device_token = device_token.trim();

    if tenant_id.is_empty() {
        return Err(DomainError::InvalidEventRequest(
            "tenant id cannot be empty in topic".to_string(),
        ));
    }

    if device_token.is_empty() || device_token.contains('/') {
        return Err(DomainError::InvalidEventRequest(format!(
            "invalid device token in topic '{}'",
            topic
        )));
    }

    Ok(ParsedTopic {
        tenant_id: tenant_id.to_string(),
        device_token: device_token.to_string(),
    })
}
