use engage_contracts::InvalidIdentity;
use engage_store::StoreError;

/// Errors surfaced by the engagement components.
#[derive(Debug, thiserror::Error)]
pub enum EngageError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("identity material is missing or blank")]
    InvalidIdentity,

    #[error("subject {0} not found")]
    SubjectNotFound(String),

    /// Conflict retries were exhausted.
    #[error("concurrent update conflict; retry later")]
    StorageConflict,

    #[error("too many failed attempts; retry after {retry_after_secs}s")]
    RateLimited {
        reset_at_epoch_ms: i64,
        retry_after_secs: u64,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngageError {
    pub fn code(&self) -> &'static str {
        match self {
            EngageError::InvalidInput(_) => "ERR_INVALID_INPUT",
            EngageError::InvalidIdentity => "ERR_INVALID_IDENTITY",
            EngageError::SubjectNotFound(_) => "ERR_SUBJECT_NOT_FOUND",
            EngageError::StorageConflict => "ERR_STORAGE_CONFLICT",
            EngageError::RateLimited { .. } => "ERR_RATE_LIMITED",
            EngageError::StoreUnavailable(_) => "ERR_STORE_UNAVAILABLE",
        }
    }
}

impl From<InvalidIdentity> for EngageError {
    fn from(_: InvalidIdentity) -> Self {
        EngageError::InvalidIdentity
    }
}

impl From<StoreError> for EngageError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict => EngageError::StorageConflict,
            StoreError::SubjectNotFound(subject_id) => EngageError::SubjectNotFound(subject_id),
            StoreError::Timeout => {
                EngageError::StoreUnavailable("store operation timed out".to_string())
            }
            other => EngageError::StoreUnavailable(other.to_string()),
        }
    }
}
