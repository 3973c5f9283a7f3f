use crate::domain::{InboundReceiver, PayloadSink};
use async_trait::async_trait;
use bytes::Bytes;
use common::domain::PayloadMetadata;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One payload handed to a [`ChannelReceiver`]
#[derive(Debug, Clone)]
pub struct InboundPayload {
    pub payload: Bytes,
    pub metadata: PayloadMetadata,
}

impl InboundPayload {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            metadata: PayloadMetadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// In-process receiver fed through a bounded channel.
///
/// Used to embed the pipeline in another service and to drive it from tests.
/// Senders get backpressure once `capacity` payloads are queued.
pub struct ChannelReceiver {
    source_id: String,
    worker_count: usize,
    sender: mpsc::Sender<InboundPayload>,
    receiver: Arc<Mutex<mpsc::Receiver<InboundPayload>>>,
}

impl ChannelReceiver {
    pub fn new(source_id: impl Into<String>, capacity: usize, worker_count: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            source_id: source_id.into(),
            worker_count: worker_count.max(1),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<InboundPayload> {
        self.sender.clone()
    }
}

#[async_trait]
impl InboundReceiver for ChannelReceiver {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn worker_count(&self) -> usize {
        self.worker_count
    }

    async fn start(&self) -> anyhow::Result<()> {
        debug!(source_id = %self.source_id, "channel receiver ready");
        Ok(())
    }

    async fn run_worker(
        &self,
        worker: usize,
        sink: Arc<dyn PayloadSink>,
        ctx: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            let next = tokio::select! {
                _ = ctx.cancelled() => break,
                next = async { self.receiver.lock().await.recv().await } => next,
            };

            let Some(inbound) = next else {
                debug!(source_id = %self.source_id, worker, "channel closed");
                break;
            };

            let outcome = sink
                .on_payload_received(&self.source_id, inbound.payload, inbound.metadata)
                .await;
            if outcome.should_retry() {
                // no redelivery path for in-process payloads
                warn!(
                    source_id = %self.source_id,
                    retryable = outcome.retryable,
                    "payload needed a retry and was dropped"
                );
            }
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        debug!(source_id = %self.source_id, "channel receiver stopped");
        Ok(())
    }
}
