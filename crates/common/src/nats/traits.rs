use anyhow::Result;
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;

/// Trait for JetStream consumer operations
/// Abstracts the operations needed to create a durable pull consumer
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamConsumer: Send + Sync {
    /// Create (or bind to) a durable pull consumer on a stream
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>>;
}

/// Trait for pull consumer operations
/// Abstracts the fetch operation so consumers can be driven without a live server
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Fetch up to `max_messages`, waiting at most `expires` for the batch to fill
    async fn fetch_messages(
        &self,
        max_messages: usize,
        expires: std::time::Duration,
    ) -> Result<Vec<FetchedMessage>>;
}

/// Acknowledgement handle for one fetched message
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement; the server redelivers the message
    async fn nak(&self) -> Result<()>;
}

/// Owned view of a JetStream message plus its acknowledgement handle
pub struct FetchedMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Vec<(String, String)>,
    acker: Box<dyn MessageAcker>,
}

impl FetchedMessage {
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        headers: Vec<(String, String)>,
        acker: Box<dyn MessageAcker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nak(&self) -> Result<()> {
        self.acker.nak().await
    }
}

impl std::fmt::Debug for FetchedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedMessage")
            .field("subject", &self.subject)
            .field("payload_size", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}
