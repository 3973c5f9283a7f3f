use crate::domain::{InboundReceiver, PayloadSink};
use anyhow::{Context, Result};
use async_nats::jetstream;
use async_trait::async_trait;
use common::domain::{PayloadMetadata, METADATA_DEVICE_TOKEN};
use common::nats::{FetchedMessage, JetStreamConsumer, PullConsumer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Workers per broker consumer unless configured otherwise
pub const DEFAULT_BROKER_WORKER_COUNT: usize = 3;

#[derive(Debug, Clone)]
pub struct NatsReceiverConfig {
    pub stream_name: String,
    pub consumer_name: String,
    pub filter_subject: String,
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub worker_count: usize,
}

impl NatsReceiverConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        let stream_name = stream_name.into();
        Self {
            consumer_name: format!("{}-ingest", stream_name),
            filter_subject: format!("{}.>", stream_name),
            stream_name,
            batch_size: 32,
            batch_wait: Duration::from_secs(5),
            worker_count: DEFAULT_BROKER_WORKER_COUNT,
        }
    }
}

/// Durable JetStream pull consumer feeding the pipeline.
///
/// A message is acked once the pipeline is done with it, unless a request
/// failed transiently, in which case it is nak'd for redelivery.
pub struct NatsReceiver {
    config: NatsReceiverConfig,
    jetstream: Arc<dyn JetStreamConsumer>,
    consumer: RwLock<Option<Arc<dyn PullConsumer>>>,
}

impl NatsReceiver {
    pub fn new(config: NatsReceiverConfig, jetstream: Arc<dyn JetStreamConsumer>) -> Self {
        Self {
            config,
            jetstream,
            consumer: RwLock::new(None),
        }
    }

    async fn fetch_and_process_batch(
        &self,
        consumer: &dyn PullConsumer,
        sink: &dyn PayloadSink,
    ) -> Result<()> {
        let messages = consumer
            .fetch_messages(self.config.batch_size, self.config.batch_wait)
            .await?;

        if messages.is_empty() {
            return Ok(());
        }
        debug!(message_count = messages.len(), "received message batch");

        for message in &messages {
            self.process_message(message, sink).await;
        }
        Ok(())
    }

    async fn process_message(&self, message: &FetchedMessage, sink: &dyn PayloadSink) {
        let span = info_span!(
            parent: Span::none(),
            "nats_message",
            stream = %self.config.stream_name,
            subject = %message.subject,
            payload_size = message.payload.len(),
        );

        async {
            let outcome = sink
                .on_payload_received(
                    &self.config.stream_name,
                    message.payload.clone(),
                    message_metadata(message),
                )
                .await;

            if outcome.should_retry() {
                warn!(retryable = outcome.retryable, "rejecting message for redelivery");
                if let Err(e) = message.nak().await {
                    error!(error = %e, "failed to reject message");
                }
            } else if let Err(e) = message.ack().await {
                error!(error = %e, "failed to acknowledge message");
            }
        }
        .instrument(span)
        .await
    }
}

/// Headers become metadata entries. A subject of the form
/// `{stream}.{device_token}` also yields a device token hint.
pub fn message_metadata(message: &FetchedMessage) -> PayloadMetadata {
    let mut metadata = PayloadMetadata::new();
    for (name, value) in &message.headers {
        metadata.insert(name.clone(), serde_json::Value::String(value.clone()));
    }
    metadata.insert(
        "subject".to_string(),
        serde_json::Value::String(message.subject.clone()),
    );

    if !metadata.contains_key(METADATA_DEVICE_TOKEN) {
        if let Some((_, token)) = message.subject.rsplit_once('.') {
            if !token.is_empty() && token != "*" && token != ">" {
                metadata.insert(
                    METADATA_DEVICE_TOKEN.to_string(),
                    serde_json::Value::String(token.to_string()),
                );
            }
        }
    }
    metadata
}

#[async_trait]
impl InboundReceiver for NatsReceiver {
    fn source_id(&self) -> &str {
        &self.config.stream_name
    }

    fn worker_count(&self) -> usize {
        self.config.worker_count.max(1)
    }

    async fn start(&self) -> Result<()> {
        let consumer_config = jetstream::consumer::pull::Config {
            name: Some(self.config.consumer_name.clone()),
            durable_name: Some(self.config.consumer_name.clone()),
            filter_subject: self.config.filter_subject.clone(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ..Default::default()
        };

        let consumer = self
            .jetstream
            .create_consumer(consumer_config, &self.config.stream_name)
            .await
            .context("failed to create consumer")?;
        *self.consumer.write().await = Some(Arc::from(consumer));

        info!(
            stream = %self.config.stream_name,
            consumer = %self.config.consumer_name,
            filter_subject = %self.config.filter_subject,
            "nats receiver started"
        );
        Ok(())
    }

    async fn run_worker(
        &self,
        worker: usize,
        sink: Arc<dyn PayloadSink>,
        ctx: CancellationToken,
    ) -> Result<()> {
        let consumer = self
            .consumer
            .read()
            .await
            .clone()
            .context("nats receiver has not been started")?;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!(stream = %self.config.stream_name, worker, "stopping nats worker");
                    break;
                }
                result = self.fetch_and_process_batch(consumer.as_ref(), sink.as_ref()) => {
                    if let Err(e) = result {
                        error!(
                            stream = %self.config.stream_name,
                            worker,
                            error = %e,
                            "error processing batch"
                        );
                        tokio::select! {
                            _ = ctx.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.consumer.write().await.take();
        info!(stream = %self.config.stream_name, "nats receiver stopped");
        Ok(())
    }
}
