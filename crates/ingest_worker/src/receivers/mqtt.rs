use crate::domain::{InboundReceiver, PayloadSink};
use crate::receivers::parse_topic;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use common::domain::{PayloadMetadata, METADATA_DEVICE_TOKEN};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

#[derive(Debug, Clone)]
pub struct MqttReceiverConfig {
    /// `mqtt://host:port`, `tcp://host:port` or `host:port`
    pub broker_url: String,
    pub client_id: String,
    /// Subscription is `{tenant_id}/+`
    pub tenant_id: String,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
}

/// Consecutive connection failures. A broker `ConnAck` starts the count over,
/// so only an unbroken run of failures exhausts the budget.
#[derive(Debug)]
struct ConnectionAttempts {
    failures: u32,
    max: u32,
}

impl ConnectionAttempts {
    fn new(max: u32) -> Self {
        Self { failures: 0, max }
    }

    fn connected(&mut self) {
        self.failures = 0;
    }

    /// Record a failure; true once the budget is used up
    fn failed(&mut self) -> bool {
        self.failures += 1;
        self.failures >= self.max
    }
}

/// MQTT subscriber feeding the pipeline.
///
/// Runs a single connection; after `max_retry_attempts` consecutive
/// connection errors it gives up, waiting `retry_delay` between attempts.
pub struct MqttReceiver {
    config: MqttReceiverConfig,
    source_id: String,
}

impl MqttReceiver {
    pub fn new(config: MqttReceiverConfig) -> Self {
        Self {
            source_id: format!("mqtt:{}", config.tenant_id),
            config,
        }
    }

    #[instrument(
        name = "mqtt_connection",
        skip_all,
        fields(broker_url = %self.config.broker_url, tenant_id = %self.config.tenant_id)
    )]
    async fn run_connection(
        &self,
        sink: &dyn PayloadSink,
        ctx: &CancellationToken,
        attempts: &mut ConnectionAttempts,
    ) -> Result<()> {
        let (host, port) = parse_broker_url(&self.config.broker_url)?;

        let mut mqtt_options = MqttOptions::new(&self.config.client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

        let subscribe_topic = format!("{}/+", self.config.tenant_id);
        client
            .subscribe(&subscribe_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| anyhow!("failed to subscribe to {}: {}", subscribe_topic, e))?;
        info!(topic = %subscribe_topic, "subscribed to MQTT topic");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("cancellation received, disconnecting");
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.handle_message(&publish.topic, publish.payload, sink).await;
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("connected to MQTT broker");
                            attempts.connected();
                        }
                        Ok(Event::Incoming(Packet::SubAck(_))) => {
                            debug!("subscription acknowledged");
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow!("MQTT event loop error: {}", e)),
                    }
                }
            }
        }
    }

    /// Each message gets its own root span rather than nesting under the
    /// long-lived connection span.
    pub(crate) async fn handle_message(&self, topic: &str, payload: Bytes, sink: &dyn PayloadSink) {
        let span = info_span!(
            parent: Span::none(),
            "mqtt_message",
            tenant_id = %self.config.tenant_id,
            topic = %topic,
            payload_size = payload.len(),
            device_token = tracing::field::Empty,
        );

        async {
            let parsed = match parse_topic(topic) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "failed to parse MQTT topic, skipping message");
                    return;
                }
            };
            Span::current().record("device_token", parsed.device_token.as_str());

            if parsed.tenant_id != self.config.tenant_id {
                warn!(topic_tenant = %parsed.tenant_id, "tenant mismatch, skipping message");
                return;
            }

            let mut metadata = PayloadMetadata::new();
            metadata.insert("topic".to_string(), serde_json::Value::String(topic.to_string()));
            metadata.insert(
                METADATA_DEVICE_TOKEN.to_string(),
                serde_json::Value::String(parsed.device_token),
            );

            let outcome = sink
                .on_payload_received(&self.source_id, payload, metadata)
                .await;
            if outcome.should_retry() {
                // QoS 1 acks are sent by the client; nothing to redeliver
                warn!(retryable = outcome.retryable, "message needed a retry and was dropped");
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl InboundReceiver for MqttReceiver {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn worker_count(&self) -> usize {
        1
    }

    async fn start(&self) -> Result<()> {
        parse_broker_url(&self.config.broker_url)?;
        info!(
            broker_url = %self.config.broker_url,
            tenant_id = %self.config.tenant_id,
            "mqtt receiver starting"
        );
        Ok(())
    }

    async fn run_worker(
        &self,
        _worker: usize,
        sink: Arc<dyn PayloadSink>,
        ctx: CancellationToken,
    ) -> Result<()> {
        let mut attempts = ConnectionAttempts::new(self.config.max_retry_attempts);

        loop {
            if ctx.is_cancelled() {
                break;
            }

            match self.run_connection(sink.as_ref(), &ctx, &mut attempts).await {
                Ok(()) => break,
                Err(e) => {
                    error!(source_id = %self.source_id, error = %e, "MQTT connection error");

                    if attempts.failed() {
                        return Err(e.context(format!(
                            "giving up after {} consecutive connection attempts",
                            attempts.failures
                        )));
                    }

                    warn!(
                        attempt = attempts.failures,
                        max_attempts = self.config.max_retry_attempts,
                        "retrying MQTT connection"
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }

        info!(source_id = %self.source_id, "MQTT subscriber stopped");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
pub fn parse_broker_url(url: &str) -> Result<(&str, u16)> {
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    match url.split(':').collect::<Vec<_>>().as_slice() {
        [host] if !host.is_empty() => Ok((*host, 1883)),
        [host, port] if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| anyhow!("invalid port in broker URL: {}", port))?;
            Ok((*host, port))
        }
        _ => Err(anyhow!("invalid broker URL format: {}", url)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IngestOutcome, MockPayloadSink};

    fn receiver() -> MqttReceiver {
        MqttReceiver::new(MqttReceiverConfig {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: "telemetry-test".to_string(),
            tenant_id: "acme".to_string(),
            max_retry_attempts: 2,
            retry_delay: Duration::from_millis(10),
        })
    }

    #[test]
    fn test_parse_broker_url_with_port() {
        assert_eq!(parse_broker_url("mqtt://localhost:1883").unwrap(), ("localhost", 1883));
    }

    #[test]
    fn test_parse_broker_url_without_scheme() {
        assert_eq!(
            parse_broker_url("emqx.example.com:8883").unwrap(),
            ("emqx.example.com", 8883)
        );
    }

    #[test]
    fn test_parse_broker_url_default_port() {
        assert_eq!(parse_broker_url("tcp://broker.local").unwrap(), ("broker.local", 1883));
    }

    #[test]
    fn test_parse_broker_url_rejects_garbage() {
        assert!(parse_broker_url("mqtt://host:notaport").is_err());
        assert!(parse_broker_url("a:b:c").is_err());
        assert!(parse_broker_url("mqtt://").is_err());
    }

    #[tokio::test]
    async fn test_message_carries_device_token_from_topic() {
        let mut sink = MockPayloadSink::new();
        sink.expect_on_payload_received()
            .withf(|source, payload, metadata| {
                source == "mqtt:acme"
                    && payload.as_ref() == b"\x01\x02"
                    && metadata.get("deviceToken").and_then(|v| v.as_str()) == Some("truck-17")
                    && metadata.get("topic").and_then(|v| v.as_str()) == Some("acme/truck-17")
            })
            .times(1)
            .returning(|_, _, _| IngestOutcome::default());

        receiver()
            .handle_message("acme/truck-17", Bytes::from_static(&[0x01, 0x02]), &sink)
            .await;
    }

    #[tokio::test]
    async fn test_message_for_other_tenant_is_skipped() {
        let mut sink = MockPayloadSink::new();
        sink.expect_on_payload_received().never();

        receiver()
            .handle_message("globex/truck-17", Bytes::new(), &sink)
            .await;
        receiver()
            .handle_message("not-a-topic", Bytes::new(), &sink)
            .await;
    }

    #[test]
    fn test_connack_resets_connection_attempts() {
        let mut attempts = ConnectionAttempts::new(2);

        assert!(!attempts.failed());
        attempts.connected();
        assert!(!attempts.failed());
        assert!(attempts.failed());
        assert_eq!(attempts.failures, 2);
    }

    #[tokio::test]
    async fn test_worker_gives_up_after_consecutive_failures() {
        let receiver = MqttReceiver::new(MqttReceiverConfig {
            broker_url: "127.0.0.1:1".to_string(),
            client_id: "telemetry-test".to_string(),
            tenant_id: "acme".to_string(),
            max_retry_attempts: 2,
            retry_delay: Duration::from_millis(10),
        });

        let err = receiver
            .run_worker(0, Arc::new(MockPayloadSink::new()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 consecutive connection attempts"));
    }

    #[tokio::test]
    async fn test_worker_stops_when_cancelled_before_connecting() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        receiver()
            .run_worker(0, Arc::new(MockPayloadSink::new()), ctx)
            .await
            .unwrap();
    }
}
