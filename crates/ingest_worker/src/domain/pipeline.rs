use crate::domain::{
    DecodedEventHandler, DeviceEventDeduplicator, DeviceRequestDecoder, PipelineCounters,
    PipelineError,
};
use async_trait::async_trait;
use bytes::Bytes;
use common::domain::PayloadMetadata;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// What happened to one received payload
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub decode_failed: bool,
    pub decoded: usize,
    pub duplicates: usize,
    pub forwarded: usize,
    /// Requests lost to deduplicator errors or permanent handler errors
    pub dropped: usize,
    /// Requests whose handler failed transiently
    pub retryable: usize,
}

impl IngestOutcome {
    /// True when the transport should redeliver the payload
    pub fn should_retry(&self) -> bool {
        self.retryable > 0
    }
}

/// Entry point receivers feed raw payloads into
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PayloadSink: Send + Sync {
    async fn on_payload_received(
        &self,
        source_id: &str,
        payload: Bytes,
        metadata: PayloadMetadata,
    ) -> IngestOutcome;
}

/// Protocol adapter supplying payloads to a pipeline.
///
/// `start` prepares the transport (connections, consumers). The pipeline then
/// runs `worker_count` copies of `run_worker`, each until its token is
/// cancelled, and calls `stop` once all of them have returned.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait InboundReceiver: Send + Sync {
    fn source_id(&self) -> &str;

    fn worker_count(&self) -> usize;

    async fn start(&self) -> anyhow::Result<()>;

    async fn run_worker(
        &self,
        worker: usize,
        sink: Arc<dyn PayloadSink>,
        ctx: CancellationToken,
    ) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Initialized,
    Started,
    Stopped,
    Terminated,
}

/// Decode, deduplicate and forward; shared by every receiver worker
pub struct PipelineCore {
    decoder: Arc<dyn DeviceRequestDecoder>,
    deduplicator: Option<Arc<dyn DeviceEventDeduplicator>>,
    handler: Arc<dyn DecodedEventHandler>,
    counters: Arc<PipelineCounters>,
}

impl PipelineCore {
    pub fn new(
        decoder: Arc<dyn DeviceRequestDecoder>,
        deduplicator: Option<Arc<dyn DeviceEventDeduplicator>>,
        handler: Arc<dyn DecodedEventHandler>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            decoder,
            deduplicator,
            handler,
            counters,
        }
    }
}

#[async_trait]
impl PayloadSink for PipelineCore {
    async fn on_payload_received(
        &self,
        source_id: &str,
        payload: Bytes,
        metadata: PayloadMetadata,
    ) -> IngestOutcome {
        self.counters.record_payload();
        let mut outcome = IngestOutcome::default();

        let requests = match self.decoder.decode(&payload, &metadata) {
            Ok(requests) => requests,
            Err(e) => {
                self.counters.record_failed_decode();
                debug!(source_id = %source_id, error = %e, "decode failed");
                self.handler
                    .handle_failed_decode(source_id, &payload, &metadata, &e)
                    .await;
                outcome.decode_failed = true;
                return outcome;
            }
        };

        outcome.decoded = requests.len();
        self.counters.record_decoded(requests.len() as u64);

        for request in requests {
            if let Some(deduplicator) = &self.deduplicator {
                match deduplicator.is_duplicate(&request).await {
                    Ok(true) => {
                        debug!(
                            source_id = %source_id,
                            device_token = %request.device_token,
                            "duplicate request dropped"
                        );
                        self.counters.record_duplicate();
                        outcome.duplicates += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!(
                            source_id = %source_id,
                            device_token = %request.device_token,
                            error = %e,
                            "deduplicator failed, dropping request"
                        );
                        self.counters.record_deduplicator_error();
                        outcome.dropped += 1;
                        continue;
                    }
                }
            }

            let retained = self.deduplicator.as_ref().map(|_| request.clone());
            match self
                .handler
                .handle_decoded_event(source_id, &payload, &metadata, request)
                .await
            {
                Ok(()) => {
                    self.counters.record_forwarded();
                    outcome.forwarded += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(source_id = %source_id, error = %e, "handler failed, payload will be retried");
                    self.counters.record_handler_error();
                    outcome.retryable += 1;
                    if let (Some(deduplicator), Some(request)) = (&self.deduplicator, retained) {
                        if let Err(e) = deduplicator.forget(&request).await {
                            warn!(error = %e, "failed to release request for redelivery");
                        }
                    }
                }
                Err(e) => {
                    warn!(source_id = %source_id, error = %e, "handler rejected request");
                    self.counters.record_handler_error();
                    outcome.dropped += 1;
                }
            }
        }

        outcome
    }
}

/// Ingestion pipeline with an explicit lifecycle:
/// `Created -> Initialized -> Started -> Stopped -> Terminated`.
///
/// Receivers are started first and the deduplicator second; stopping runs in
/// reverse. Each receiver gets its own pool of workers, all feeding the same
/// [`PipelineCore`].
pub struct IngestionPipeline {
    state: PipelineState,
    receivers: Vec<Arc<dyn InboundReceiver>>,
    decoder: Option<Arc<dyn DeviceRequestDecoder>>,
    deduplicator: Option<Arc<dyn DeviceEventDeduplicator>>,
    handler: Arc<dyn DecodedEventHandler>,
    counters: Arc<PipelineCounters>,
    core: Option<Arc<PipelineCore>>,
    workers: TaskTracker,
    workers_token: CancellationToken,
}

impl IngestionPipeline {
    pub fn new(handler: Arc<dyn DecodedEventHandler>) -> Self {
        Self {
            state: PipelineState::Created,
            receivers: Vec::new(),
            decoder: None,
            deduplicator: None,
            handler,
            counters: Arc::new(PipelineCounters::new()),
            core: None,
            workers: TaskTracker::new(),
            workers_token: CancellationToken::new(),
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn DeviceRequestDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_deduplicator(mut self, deduplicator: Arc<dyn DeviceEventDeduplicator>) -> Self {
        self.deduplicator = Some(deduplicator);
        self
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn InboundReceiver>) -> Self {
        self.receivers.push(receiver);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.counters.clone()
    }

    /// Sink for feeding payloads directly; available once initialized
    pub fn sink(&self) -> Option<Arc<dyn PayloadSink>> {
        self.core
            .as_ref()
            .map(|core| core.clone() as Arc<dyn PayloadSink>)
    }

    pub fn initialize(&mut self) -> Result<(), PipelineError> {
        self.expect_state(PipelineState::Created, "initialize")?;
        if self.receivers.is_empty() {
            return Err(PipelineError::NoReceivers);
        }
        let decoder = self.decoder.clone().ok_or(PipelineError::NoDecoder)?;

        self.core = Some(Arc::new(PipelineCore::new(
            decoder,
            self.deduplicator.clone(),
            self.handler.clone(),
            self.counters.clone(),
        )));
        self.state = PipelineState::Initialized;
        info!(receivers = self.receivers.len(), "ingestion pipeline initialized");
        Ok(())
    }

    pub async fn start(&mut self) -> Result<(), PipelineError> {
        self.expect_state(PipelineState::Initialized, "start")?;
        let sink = self.sink().ok_or(PipelineError::InvalidState {
            operation: "start",
            state: self.state,
        })?;

        for (started, receiver) in self.receivers.iter().enumerate() {
            if let Err(source) = receiver.start().await {
                error!(source_id = %receiver.source_id(), error = %source, "receiver failed to start");
                self.roll_back_start(started).await;
                return Err(PipelineError::Receiver {
                    source_id: receiver.source_id().to_string(),
                    operation: "start",
                    source,
                });
            }
        }

        if let Some(deduplicator) = &self.deduplicator {
            if let Err(e) = deduplicator.start().await {
                error!(error = %e, "deduplicator failed to start");
                self.roll_back_start(self.receivers.len()).await;
                return Err(PipelineError::Deduplicator {
                    operation: "start",
                    source: e.into(),
                });
            }
        }

        for receiver in &self.receivers {
            let worker_count = receiver.worker_count().max(1);
            for worker in 0..worker_count {
                let receiver = receiver.clone();
                let sink = sink.clone();
                let ctx = self.workers_token.child_token();
                self.workers.spawn(async move {
                    let source_id = receiver.source_id().to_string();
                    debug!(source_id = %source_id, worker, "receiver worker started");
                    if let Err(e) = receiver.run_worker(worker, sink, ctx).await {
                        error!(source_id = %source_id, worker, error = %e, "receiver worker failed");
                    }
                    debug!(source_id = %source_id, worker, "receiver worker stopped");
                });
            }
            info!(
                source_id = %receiver.source_id(),
                workers = worker_count,
                "receiver started"
            );
        }

        self.state = PipelineState::Started;
        info!("ingestion pipeline started");
        Ok(())
    }

    /// Stop the receivers a failed `start` already started, newest first. The
    /// pipeline stays `Initialized`.
    async fn roll_back_start(&self, started_receivers: usize) {
        for receiver in self.receivers[..started_receivers].iter().rev() {
            if let Err(e) = receiver.stop().await {
                warn!(source_id = %receiver.source_id(), error = %e, "receiver failed to stop during rollback");
            }
        }
    }

    /// Stop workers, then the deduplicator, then the receivers. Every
    /// component is asked to stop even if an earlier one fails; the first
    /// failure is returned.
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        self.expect_state(PipelineState::Started, "stop")?;

        self.workers_token.cancel();
        self.workers.close();
        self.workers.wait().await;
        debug!("all receiver workers finished");

        let mut first_error = None;
        if let Some(deduplicator) = &self.deduplicator {
            if let Err(e) = deduplicator.stop().await {
                error!(error = %e, "deduplicator failed to stop");
                first_error.get_or_insert(PipelineError::Deduplicator {
                    operation: "stop",
                    source: e.into(),
                });
            }
        }

        for receiver in self.receivers.iter().rev() {
            if let Err(source) = receiver.stop().await {
                error!(source_id = %receiver.source_id(), error = %source, "receiver failed to stop");
                first_error.get_or_insert(PipelineError::Receiver {
                    source_id: receiver.source_id().to_string(),
                    operation: "stop",
                    source,
                });
            }
        }

        self.state = PipelineState::Stopped;
        info!(counters = ?self.counters.snapshot(), "ingestion pipeline stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub fn terminate(&mut self) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Created | PipelineState::Initialized | PipelineState::Stopped => {
                self.core = None;
                self.state = PipelineState::Terminated;
                info!("ingestion pipeline terminated");
                Ok(())
            }
            state => Err(PipelineError::InvalidState {
                operation: "terminate",
                state,
            }),
        }
    }

    /// Drive the whole lifecycle until `ctx` is cancelled
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        self.initialize()?;
        if let Err(e) = self.start().await {
            self.terminate()?;
            return Err(e.into());
        }

        ctx.cancelled().await;
        info!("received shutdown signal, stopping ingestion pipeline");

        let stopped = self.stop().await;
        self.terminate()?;
        stopped?;
        Ok(())
    }

    fn expect_state(
        &self,
        expected: PipelineState,
        operation: &'static str,
    ) -> Result<(), PipelineError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        DecodeError, MockDecodedEventHandler, MockDeviceEventDeduplicator,
        MockDeviceRequestDecoder, RecentRequestDeduplicator,
    };
    use common::domain::{
        DecodedDeviceRequest, DeviceEventCreateRequest, DomainError, EventPayload,
        MeasurementPayload,
    };
    use mockall::Sequence;
    use std::sync::Mutex as StdMutex;

    fn decoded(token: &str, alternate_id: &str) -> DecodedDeviceRequest {
        DecodedDeviceRequest {
            device_token: token.to_string(),
            originator: None,
            request: DeviceEventCreateRequest::new(EventPayload::Measurement(
                MeasurementPayload::default(),
            ))
            .with_alternate_id(alternate_id),
        }
    }

    fn decoder_returning(requests: Vec<DecodedDeviceRequest>) -> MockDeviceRequestDecoder {
        let mut decoder = MockDeviceRequestDecoder::new();
        decoder
            .expect_decode()
            .returning(move |_, _| Ok(requests.clone()));
        decoder
    }

    fn core(
        decoder: MockDeviceRequestDecoder,
        deduplicator: Option<Arc<dyn DeviceEventDeduplicator>>,
        handler: MockDecodedEventHandler,
    ) -> (PipelineCore, Arc<PipelineCounters>) {
        let counters = Arc::new(PipelineCounters::new());
        (
            PipelineCore::new(
                Arc::new(decoder),
                deduplicator,
                Arc::new(handler),
                counters.clone(),
            ),
            counters,
        )
    }

    fn idle_receiver(source_id: &'static str, log: Arc<StdMutex<Vec<String>>>) -> MockInboundReceiver {
        let mut receiver = MockInboundReceiver::new();
        receiver.expect_source_id().return_const(source_id.to_string());
        receiver.expect_worker_count().return_const(2usize);
        let start_log = log.clone();
        receiver.expect_start().returning(move || {
            start_log.lock().unwrap().push(format!("start:{}", source_id));
            Ok(())
        });
        receiver
            .expect_run_worker()
            .times(2)
            .returning(|_, _, _| Ok(()));
        receiver.expect_stop().returning(move || {
            log.lock().unwrap().push(format!("stop:{}", source_id));
            Ok(())
        });
        receiver
    }

    /// Receiver that only logs start/stop; its workers are never expected to run
    fn unstarted_receiver(
        source_id: &'static str,
        start_ok: bool,
        log: Arc<StdMutex<Vec<String>>>,
    ) -> MockInboundReceiver {
        let mut receiver = MockInboundReceiver::new();
        receiver.expect_source_id().return_const(source_id.to_string());
        receiver.expect_worker_count().return_const(1usize);
        receiver.expect_run_worker().never();
        let start_log = log.clone();
        receiver.expect_start().times(1).returning(move || {
            start_log.lock().unwrap().push(format!("start:{}", source_id));
            if start_ok {
                Ok(())
            } else {
                Err(anyhow::anyhow!("{} unreachable", source_id))
            }
        });
        receiver.expect_stop().returning(move || {
            log.lock().unwrap().push(format!("stop:{}", source_id));
            Ok(())
        });
        receiver
    }

    #[tokio::test]
    async fn test_forwards_every_decoded_request() {
        let mut handler = MockDecodedEventHandler::new();
        handler
            .expect_handle_decoded_event()
            .withf(|source, _, _, _| source == "nats")
            .times(2)
            .returning(|_, _, _, _| Ok(()));
        let (core, counters) = core(
            decoder_returning(vec![decoded("a", "1"), decoded("b", "2")]),
            None,
            handler,
        );

        let outcome = core
            .on_payload_received("nats", Bytes::from_static(b"[]"), PayloadMetadata::new())
            .await;

        assert_eq!(outcome.decoded, 2);
        assert_eq!(outcome.forwarded, 2);
        assert!(!outcome.should_retry());
        assert_eq!(counters.snapshot().forwarded, 2);
    }

    #[tokio::test]
    async fn test_decode_failure_is_reported_with_raw_payload() {
        let mut decoder = MockDeviceRequestDecoder::new();
        decoder.expect_decode().returning(|payload, _| {
            Err(DecodeError::Malformed {
                reason: "bad".to_string(),
                payload: payload.clone(),
            })
        });

        let mut handler = MockDecodedEventHandler::new();
        handler.expect_handle_decoded_event().never();
        handler
            .expect_handle_failed_decode()
            .withf(|source, payload, metadata, error| {
                source == "mqtt"
                    && payload.as_ref() == b"garbage"
                    && metadata.get("topic").and_then(|v| v.as_str()) == Some("acme/truck-17")
                    && error.payload().as_ref() == b"garbage"
            })
            .times(1)
            .return_const(());
        let (core, counters) = core(decoder, None, handler);

        let mut metadata = PayloadMetadata::new();
        metadata.insert("topic".to_string(), serde_json::json!("acme/truck-17"));
        let outcome = core
            .on_payload_received("mqtt", Bytes::from_static(b"garbage"), metadata)
            .await;

        assert!(outcome.decode_failed);
        assert_eq!(outcome.forwarded, 0);
        assert_eq!(counters.snapshot().failed_decodes, 1);
    }

    #[tokio::test]
    async fn test_duplicates_are_counted_and_dropped() {
        let mut handler = MockDecodedEventHandler::new();
        handler
            .expect_handle_decoded_event()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let deduplicator: Arc<dyn DeviceEventDeduplicator> =
            Arc::new(RecentRequestDeduplicator::new(16));
        let (core, counters) = core(
            decoder_returning(vec![decoded("a", "same"), decoded("a", "same")]),
            Some(deduplicator),
            handler,
        );

        let outcome = core
            .on_payload_received("test", Bytes::new(), PayloadMetadata::new())
            .await;

        assert_eq!(outcome.forwarded, 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(counters.snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn test_deduplicator_error_drops_request() {
        let mut deduplicator = MockDeviceEventDeduplicator::new();
        deduplicator
            .expect_is_duplicate()
            .returning(|_| Err(DomainError::EventStoreUnavailable("down".to_string())));
        let mut handler = MockDecodedEventHandler::new();
        handler.expect_handle_decoded_event().never();
        let (core, counters) = core(
            decoder_returning(vec![decoded("a", "1")]),
            Some(Arc::new(deduplicator)),
            handler,
        );

        let outcome = core
            .on_payload_received("test", Bytes::new(), PayloadMetadata::new())
            .await;

        assert_eq!(outcome.dropped, 1);
        assert!(!outcome.should_retry());
        assert_eq!(counters.snapshot().deduplicator_errors, 1);
    }

    #[tokio::test]
    async fn test_transient_handler_error_requests_retry_and_releases_request() {
        let mut handler = MockDecodedEventHandler::new();
        handler
            .expect_handle_decoded_event()
            .times(2)
            .returning(|_, _, _, _| Err(DomainError::EventStoreUnavailable("busy".to_string())));
        let deduplicator = Arc::new(RecentRequestDeduplicator::new(16));
        let (core, _) = core(
            decoder_returning(vec![decoded("a", "retry")]),
            Some(deduplicator.clone()),
            handler,
        );

        let first = core
            .on_payload_received("test", Bytes::new(), PayloadMetadata::new())
            .await;
        let redelivered = core
            .on_payload_received("test", Bytes::new(), PayloadMetadata::new())
            .await;

        assert!(first.should_retry());
        assert!(redelivered.should_retry());
        assert_eq!(redelivered.duplicates, 0);
        assert!(deduplicator.is_empty().await);
    }

    #[tokio::test]
    async fn test_permanent_handler_error_is_dropped() {
        let mut handler = MockDecodedEventHandler::new();
        handler
            .expect_handle_decoded_event()
            .returning(|_, _, _, _| Err(DomainError::AssignmentNotFound("a".to_string())));
        let (core, counters) = core(decoder_returning(vec![decoded("a", "1")]), None, handler);

        let outcome = core
            .on_payload_received("test", Bytes::new(), PayloadMetadata::new())
            .await;

        assert_eq!(outcome.dropped, 1);
        assert!(!outcome.should_retry());
        assert_eq!(counters.snapshot().handler_errors, 1);
    }

    #[test]
    fn test_initialize_requires_receivers_and_decoder() {
        let mut no_receivers = IngestionPipeline::new(Arc::new(MockDecodedEventHandler::new()))
            .with_decoder(Arc::new(MockDeviceRequestDecoder::new()));
        assert!(matches!(
            no_receivers.initialize(),
            Err(PipelineError::NoReceivers)
        ));
        assert_eq!(no_receivers.state(), PipelineState::Created);

        let mut no_decoder = IngestionPipeline::new(Arc::new(MockDecodedEventHandler::new()))
            .with_receiver(Arc::new(MockInboundReceiver::new()));
        assert!(matches!(no_decoder.initialize(), Err(PipelineError::NoDecoder)));
    }

    #[tokio::test]
    async fn test_lifecycle_orders_components() {
        let log = Arc::new(StdMutex::new(Vec::new()));

        let mut seq = Sequence::new();
        let mut deduplicator = MockDeviceEventDeduplicator::new();
        let start_log = log.clone();
        deduplicator
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || {
                start_log.lock().unwrap().push("start:dedup".to_string());
                Ok(())
            });
        let stop_log = log.clone();
        deduplicator
            .expect_stop()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || {
                stop_log.lock().unwrap().push("stop:dedup".to_string());
                Ok(())
            });

        let mut pipeline = IngestionPipeline::new(Arc::new(MockDecodedEventHandler::new()))
            .with_decoder(Arc::new(MockDeviceRequestDecoder::new()))
            .with_deduplicator(Arc::new(deduplicator))
            .with_receiver(Arc::new(idle_receiver("first", log.clone())))
            .with_receiver(Arc::new(idle_receiver("second", log.clone())));

        assert!(matches!(
            pipeline.start().await,
            Err(PipelineError::InvalidState { .. })
        ));

        pipeline.initialize().unwrap();
        pipeline.start().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Started);
        assert!(matches!(
            pipeline.terminate(),
            Err(PipelineError::InvalidState { .. })
        ));

        pipeline.stop().await.unwrap();
        pipeline.terminate().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Terminated);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start:first",
                "start:second",
                "start:dedup",
                "stop:dedup",
                "stop:second",
                "stop:first"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_receiver_start_stops_earlier_receivers() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut deduplicator = MockDeviceEventDeduplicator::new();
        deduplicator.expect_start().never();
        deduplicator.expect_stop().never();

        let mut pipeline = IngestionPipeline::new(Arc::new(MockDecodedEventHandler::new()))
            .with_decoder(Arc::new(MockDeviceRequestDecoder::new()))
            .with_deduplicator(Arc::new(deduplicator))
            .with_receiver(Arc::new(unstarted_receiver("first", true, log.clone())))
            .with_receiver(Arc::new(unstarted_receiver("second", true, log.clone())))
            .with_receiver(Arc::new(unstarted_receiver("third", false, log.clone())));

        pipeline.initialize().unwrap();
        let err = pipeline.start().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Receiver { ref source_id, operation: "start", .. } if source_id == "third"
        ));
        assert_eq!(pipeline.state(), PipelineState::Initialized);
        pipeline.terminate().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start:first",
                "start:second",
                "start:third",
                "stop:second",
                "stop:first"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_deduplicator_start_stops_every_receiver() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut deduplicator = MockDeviceEventDeduplicator::new();
        deduplicator
            .expect_start()
            .times(1)
            .returning(|| Err(DomainError::EventStoreUnavailable("down".to_string())));
        deduplicator.expect_stop().never();

        let pipeline = IngestionPipeline::new(Arc::new(MockDecodedEventHandler::new()))
            .with_decoder(Arc::new(MockDeviceRequestDecoder::new()))
            .with_deduplicator(Arc::new(deduplicator))
            .with_receiver(Arc::new(unstarted_receiver("first", true, log.clone())))
            .with_receiver(Arc::new(unstarted_receiver("second", true, log.clone())));

        let result = pipeline.run(CancellationToken::new()).await;

        assert!(result.is_err());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:first", "start:second", "stop:second", "stop:first"]
        );
    }
}
