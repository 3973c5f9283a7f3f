use crate::domain::{
    AlternateIdDeduplicator, CounterSnapshot, DeviceEventDeduplicator, EventPersistenceService,
    InboundReceiver, IngestionPipeline, JsonDeviceRequestDecoder, PipelineCounters,
    RecentRequestDeduplicator,
};
use common::domain::{DeviceAssignmentRepository, DeviceEventManagement};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Which duplicate check runs ahead of persistence
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DeduplicatorKind {
    None,
    #[default]
    AlternateId,
    Recent { capacity: usize },
}

#[derive(Debug, Clone, Default)]
pub struct IngestWorkerConfig {
    pub deduplicator: DeduplicatorKind,
}

/// Ingestion pipeline wired to the event store: JSON decoding, the configured
/// deduplicator and [`EventPersistenceService`] downstream.
pub struct IngestWorker {
    pipeline: IngestionPipeline,
    counters: Arc<PipelineCounters>,
}

impl IngestWorker {
    pub fn new(
        assignments: Arc<dyn DeviceAssignmentRepository>,
        events: Arc<dyn DeviceEventManagement>,
        config: IngestWorkerConfig,
    ) -> Self {
        info!(deduplicator = ?config.deduplicator, "initializing ingest worker");

        let handler = Arc::new(EventPersistenceService::new(assignments, events.clone()));
        let mut pipeline =
            IngestionPipeline::new(handler).with_decoder(Arc::new(JsonDeviceRequestDecoder::new()));

        let deduplicator: Option<Arc<dyn DeviceEventDeduplicator>> = match config.deduplicator {
            DeduplicatorKind::None => None,
            DeduplicatorKind::AlternateId => Some(Arc::new(AlternateIdDeduplicator::new(events))),
            DeduplicatorKind::Recent { capacity } => {
                Some(Arc::new(RecentRequestDeduplicator::new(capacity)))
            }
        };
        if let Some(deduplicator) = deduplicator {
            pipeline = pipeline.with_deduplicator(deduplicator);
        }

        let counters = pipeline.counters();
        Self { pipeline, counters }
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn InboundReceiver>) -> Self {
        self.pipeline = self.pipeline.with_receiver(receiver);
        self
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn into_runner_processes(
        self,
    ) -> Vec<
        Box<
            dyn FnOnce(
                    CancellationToken,
                ) -> std::pin::Pin<
                    Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
                > + Send,
        >,
    > {
        vec![Box::new({
            let pipeline = self.pipeline;
            move |ctx| Box::pin(async move { pipeline.run(ctx).await })
        })]
    }
}
