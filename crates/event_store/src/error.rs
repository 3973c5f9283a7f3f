use common::domain::DomainError;
use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("event codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    InvalidStoredValue(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("query cancelled")]
    Cancelled,

    #[error("query range spans {buckets} buckets, more than the allowed {max}")]
    RangeTooWide { buckets: u64, max: u64 },
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(limit) => DomainError::QueryTimeout(limit.as_millis() as u64),
            StoreError::Cancelled => DomainError::QueryCancelled,
            StoreError::Backend(e) => DomainError::EventStoreUnavailable(format!("{:#}", e)),
            err @ StoreError::RangeTooWide { .. } => DomainError::InvalidQuery(err.to_string()),
            other => DomainError::RepositoryError(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_domain_errors() {
        let timeout: DomainError = StoreError::Timeout(Duration::from_millis(250)).into();
        assert!(matches!(timeout, DomainError::QueryTimeout(250)));

        let cancelled: DomainError = StoreError::Cancelled.into();
        assert!(matches!(cancelled, DomainError::QueryCancelled));

        let backend: DomainError = StoreError::Backend(anyhow::anyhow!("connection refused")).into();
        assert!(matches!(backend, DomainError::EventStoreUnavailable(ref msg) if msg.contains("connection refused")));
        assert!(backend.is_transient());

        let too_wide: DomainError = StoreError::RangeTooWide { buckets: 9_000, max: 100 }.into();
        assert!(matches!(too_wide, DomainError::InvalidQuery(ref msg) if msg.contains("9000")));
        assert!(!too_wide.is_transient());
    }
}
