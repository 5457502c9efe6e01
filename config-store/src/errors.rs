use crate::backend::BackendError;
use crate::filter::FilterError;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict(_)
                | StoreError::Aborted(_)
                | StoreError::Unavailable(_)
                | StoreError::DeadlineExceeded
        )
    }

    /// Short label used in metrics.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Conflict(_) => "conflict",
            StoreError::InvalidArgument(_) => "invalid_argument",
            StoreError::AlreadyExists(_) => "already_exists",
            StoreError::Aborted(_) => "aborted",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::DeadlineExceeded => "deadline_exceeded",
            StoreError::Internal(_) => "internal",
        }
    }
}

impl From<FilterError> for StoreError {
    fn from(e: FilterError) -> Self {
        StoreError::InvalidArgument(e.to_string())
    }
}

impl From<BackendError> for StoreError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::DuplicateVersion { .. } => StoreError::Conflict(e.to_string()),
            BackendError::Io(_) | BackendError::Unavailable(_) => {
                StoreError::Unavailable(e.to_string())
            }
            BackendError::Encode(_) | BackendError::Decode(_) => StoreError::Internal(e.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::DeadlineExceeded
    }
}
