use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a rejected call request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    CallNotFound,
    ParticipantNotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    /// Permission denials are an expected outcome of optimistic edits.
    pub fn is_permission_denied(self) -> bool {
        matches!(self, ErrorCode::Unauthorized | ErrorCode::Forbidden)
    }
}

/// Error a call collaborator raises for a request the server rejected.
/// Travels inside `anyhow::Error`; the engine downcasts to pick a log level.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiException {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiException {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
