use bytes::Bytes;
use thiserror::Error;

/// Payload that could not be turned into device requests.
///
/// Every variant keeps the raw payload so it can be reported downstream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {reason}")]
    Malformed { reason: String, payload: Bytes },

    #[error("unsupported event type '{event_type}'")]
    UnsupportedEventType { event_type: String, payload: Bytes },

    #[error("no device token in payload or metadata")]
    MissingDeviceToken { payload: Bytes },
}

impl DecodeError {
    pub fn payload(&self) -> &Bytes {
        match self {
            DecodeError::Malformed { payload, .. } => payload,
            DecodeError::UnsupportedEventType { payload, .. } => payload,
            DecodeError::MissingDeviceToken { payload } => payload,
        }
    }
}

/// Lifecycle misuse or component failure while driving a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline has no receivers")]
    NoReceivers,

    #[error("pipeline has no decoder")]
    NoDecoder,

    #[error("cannot {operation} pipeline in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: super::PipelineState,
    },

    #[error("receiver '{source_id}' failed to {operation}: {source}")]
    Receiver {
        source_id: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("deduplicator failed to {operation}: {source}")]
    Deduplicator {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
}
