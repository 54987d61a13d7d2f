use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Rejected locally before any network call.
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not authenticated")]
    NotAuthenticated,
    /// The backend's error, message untouched.
    #[error(transparent)]
    Remote(#[from] ApiError),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("realtime error: {0}")]
    Realtime(String),
}

impl ClientError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote(err) => Some(err.code),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.code(),
            Some(ErrorCode::Conflict | ErrorCode::IllegalTransition)
        )
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
