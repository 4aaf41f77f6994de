use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl RealtimeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Authorization(_) => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Unauthenticated(_) => ErrorCode::Unauthorized,
            Self::Upstream(_) => ErrorCode::Internal,
        }
    }
}

/// Store and gateway failures keep their detail for the logs only.
pub(crate) fn upstream(err: anyhow::Error) -> RealtimeError {
    RealtimeError::Upstream(format!("{err:#}"))
}

impl From<RealtimeError> for ApiError {
    fn from(value: RealtimeError) -> Self {
        match value {
            RealtimeError::Upstream(_) => {
                ApiError::new(ErrorCode::Internal, "temporarily unable to complete request")
            }
            other => ApiError::new(other.code(), other.to_string()),
        }
    }
}
