//! Error taxonomy shared by every transport. One enum, one place that knows
//! how a core failure maps onto an HTTP status code (spec §7).

use std::fmt;

/// Numeric status surfaced to HTTP callers. Kept as a plain u16 here so this
/// crate does not depend on axum; the server crate maps it onto `StatusCode`.
pub type HttpStatus = u16;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    /// Session has exited; the HTTP mapping is deliberately 400, not 410 —
    /// existing clients use "400 on input" as the signal to transition their
    /// view to `exited` (spec §9, "load-bearing" note).
    #[error("gone: {0}")]
    Gone(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn http_status(&self) -> HttpStatus {
        match self {
            CoreError::InvalidArgument(_) => 400,
            CoreError::Unauthorized => 401,
            CoreError::NotFound(_) => 404,
            CoreError::Gone(_) => 400,
            CoreError::Conflict(_) => 409,
            CoreError::Busy(_) => 429,
            CoreError::Io(_) => 500,
            CoreError::Internal(_) => 500,
        }
    }

    /// Short machine-readable kind, used in control-plane ERROR payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "invalid-argument",
            CoreError::Unauthorized => "unauthorized",
            CoreError::NotFound(_) => "not-found",
            CoreError::Gone(_) => "gone",
            CoreError::Conflict(_) => "conflict",
            CoreError::Busy(_) => "busy",
            CoreError::Io(_) => "io",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Wire-friendly error payload, mirrors spec §3 `ControlMessage` `ERROR` type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&CoreError> for ErrorPayload {
    fn from(e: &CoreError) -> Self {
        ErrorPayload {
            code: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gone_maps_to_400_not_410() {
        let e = CoreError::Gone("session exited".into());
        assert_eq!(e.http_status(), 400);
        assert_eq!(e.kind(), "gone");
    }

    #[test]
    fn busy_maps_to_429() {
        assert_eq!(CoreError::Busy("backpressure".into()).http_status(), 429);
    }

    #[test]
    fn unauthorized_maps_to_401() {
        assert_eq!(CoreError::Unauthorized.http_status(), 401);
    }
}
