use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::domain::IndexDimension;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

/// Dimension index write that did not complete
#[derive(Debug, Clone, PartialEq)]
pub struct IndexWriteFailure {
    pub event_id: Uuid,
    pub dimension: IndexDimension,
    pub entity_id: Uuid,
    pub cause: String,
    pub failed_at: DateTime<Utc>,
}

/// Receives dimension index writes that failed or timed out.
///
/// A failed dimension write never fails the originating `put`; this sink is
/// the only place the loss becomes visible.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait IndexWriteFailureSink: Send + Sync {
    async fn record(&self, failure: IndexWriteFailure);
}

/// Default sink: one error log line per lost index entry
#[derive(Debug, Default, Clone)]
pub struct LoggingFailureSink;

#[async_trait]
impl IndexWriteFailureSink for LoggingFailureSink {
    async fn record(&self, failure: IndexWriteFailure) {
        error!(
            event_id = %failure.event_id,
            dimension = %failure.dimension,
            entity_id = %failure.entity_id,
            cause = %failure.cause,
            "index write lost"
        );
    }
}

/// Keeps every failure in memory for later inspection
#[derive(Debug, Default)]
pub struct RecordingFailureSink {
    failures: Mutex<Vec<IndexWriteFailure>>,
}

impl RecordingFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn failures(&self) -> Vec<IndexWriteFailure> {
        self.failures.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.failures.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.failures.lock().await.is_empty()
    }
}

#[async_trait]
impl IndexWriteFailureSink for RecordingFailureSink {
    async fn record(&self, failure: IndexWriteFailure) {
        self.failures.lock().await.push(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_sink_keeps_failures_in_order() {
        let sink = RecordingFailureSink::new();
        assert!(sink.is_empty().await);

        for dimension in [IndexDimension::Customer, IndexDimension::Asset] {
            sink.record(IndexWriteFailure {
                event_id: Uuid::new_v4(),
                dimension,
                entity_id: Uuid::new_v4(),
                cause: "connection reset".to_string(),
                failed_at: Utc::now(),
            })
            .await;
        }

        let failures = sink.failures().await;
        assert_eq!(sink.len().await, 2);
        assert_eq!(failures[0].dimension, IndexDimension::Customer);
        assert_eq!(failures[1].dimension, IndexDimension::Asset);
    }
}
