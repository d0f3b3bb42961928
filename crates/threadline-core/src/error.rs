use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThreadlineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Thread {0} already has a running invocation")]
    AlreadyRunning(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ThreadlineError>;

/// Coarse classification of an upstream (agent runtime) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthError,
    RateLimitError,
    InvalidRequest,
    InternalError,
}

impl ErrorCode {
    /// Classify a failure by inspecting its message text.
    ///
    /// Checks run in order: authentication, rate limiting, malformed request.
    /// Anything unrecognised is an internal error.
    pub fn classify(message: &str) -> Self {
        if message.contains("401") || message.contains("Unauthorized") {
            Self::AuthError
        } else if message.contains("429") || message.to_lowercase().contains("rate limit") {
            Self::RateLimitError
        } else if message.contains("400") {
            Self::InvalidRequest
        } else {
            Self::InternalError
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthError => "auth_error",
            Self::RateLimitError => "rate_limit_error",
            Self::InvalidRequest => "invalid_request",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth() {
        assert_eq!(
            ErrorCode::classify("Error code: 401 - invalid api key"),
            ErrorCode::AuthError
        );
        assert_eq!(ErrorCode::classify("Unauthorized"), ErrorCode::AuthError);
    }

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            ErrorCode::classify("HTTP 429 Too Many Requests"),
            ErrorCode::RateLimitError
        );
        assert_eq!(
            ErrorCode::classify("Rate limit reached for model"),
            ErrorCode::RateLimitError
        );
    }

    #[test]
    fn test_classify_invalid_request() {
        assert_eq!(
            ErrorCode::classify("status 400: bad tool schema"),
            ErrorCode::InvalidRequest
        );
    }

    #[test]
    fn test_classify_order_prefers_auth() {
        // Both markers present: authentication wins.
        assert_eq!(
            ErrorCode::classify("401 after 429 retry"),
            ErrorCode::AuthError
        );
    }

    #[test]
    fn test_classify_default_internal() {
        assert_eq!(
            ErrorCode::classify("connection reset by peer"),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn test_error_code_wire_name() {
        let json = serde_json::to_string(&ErrorCode::RateLimitError).unwrap();
        assert_eq!(json, r#""rate_limit_error""#);
        assert_eq!(ErrorCode::InternalError.to_string(), "internal_error");
    }
}
