use std::fmt;

use serde::Serialize;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotSignedIn,
    PermissionDenied,
    Closed,
    Timeout,
    NoResponders,
    InvalidSubject,
    InvalidArgument,
    Connect,
    Storage,
    Cancelled,
    Internal,
}

/// Error type shared by every bus-client operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusError {
    pub code: ErrorCode,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_signed_in() -> Self {
        Self::new(ErrorCode::NotSignedIn, "not signed in")
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn closed() -> Self {
        Self::new(ErrorCode::Closed, "connection closed")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn no_responders(subject: &str) -> Self {
        Self::new(ErrorCode::NoResponders, format!("no responders on {subject}"))
    }

    pub fn invalid_subject(subject: &str) -> Self {
        Self::new(ErrorCode::InvalidSubject, format!("invalid subject {subject:?}"))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Connect, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Storage, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "operation cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Whether a retry loop should keep going after this error. Anything a
    /// connector reports may be transient; only a missing sign-in and an
    /// explicit cancel are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.code, ErrorCode::NotSignedIn | ErrorCode::Cancelled)
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for BusError {}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        tracing::debug!(?err, "json error");
        Self::invalid_argument(format!("malformed payload: {err}"))
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        tracing::debug!(?err, "io error");
        Self::storage(err.to_string())
    }
}

impl From<bus_common::SemVerError> for BusError {
    fn from(err: bus_common::SemVerError) -> Self {
        Self::invalid_argument(err.to_string())
    }
}
