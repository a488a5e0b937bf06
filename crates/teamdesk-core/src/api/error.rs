use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The server answered with a well-formed envelope whose `success` is false.
    #[error("Request rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Fatal session failures.
///
/// Cloneable because a single refresh failure is delivered to every caller
/// queued behind that refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No refresh token available - please log in again")]
    MissingRefreshToken,

    #[error("Token refresh rejected ({code}): {message}")]
    RefreshRejected { code: i64, message: String },

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("Token refresh was abandoned before it completed")]
    Abandoned,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True when the error ended the session and the user must log in again.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ApiError::Session(_))
    }
}
