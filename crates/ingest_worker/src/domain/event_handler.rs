use crate::domain::DecodeError;
use async_trait::async_trait;
use bytes::Bytes;
use common::domain::{DecodedDeviceRequest, DomainResult, PayloadMetadata};

/// Downstream of the pipeline: receives every surviving request and every
/// payload that failed to decode.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DecodedEventHandler: Send + Sync {
    /// Process one decoded request. A transient error asks the transport to
    /// redeliver the payload; any other error drops it.
    async fn handle_decoded_event(
        &self,
        source_id: &str,
        payload: &Bytes,
        metadata: &PayloadMetadata,
        request: DecodedDeviceRequest,
    ) -> DomainResult<()>;

    async fn handle_failed_decode(
        &self,
        source_id: &str,
        payload: &Bytes,
        metadata: &PayloadMetadata,
        error: &DecodeError,
    );
}
