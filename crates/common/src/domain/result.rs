use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("No active device assignment for device token: {0}")]
    AssignmentNotFound(String),

    #[error("Device event with alternate id already exists: {0}")]
    DuplicateAlternateId(String),

    #[error("Invalid device event request: {0}")]
    InvalidEventRequest(String),

    #[error("Event store unavailable: {0}")]
    EventStoreUnavailable(String),

    #[error("Invalid event query: {0}")]
    InvalidQuery(String),

    #[error("Event query timed out after {0} ms")]
    QueryTimeout(u64),

    #[error("Event query cancelled")]
    QueryCancelled,

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

impl DomainError {
    /// Whether redelivering the same input could succeed later.
    ///
    /// Validation failures are permanent; backend failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DomainError::EventStoreUnavailable(_)
                | DomainError::QueryTimeout(_)
                | DomainError::RepositoryError(_)
        )
    }
}
