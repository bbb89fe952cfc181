use std::time::Duration;
use thiserror::Error;

/// Input problems caught before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Please select an image")]
    MissingFile,
    #[error("Please choose a value for {0}")]
    MissingField(String),
    #[error("Unknown field: {0}")]
    UnknownField(String),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("{0} is not a supported image")]
    UnsupportedImage(String),
}

/// Failures talking to the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    /// Non-2xx response. `message` is the server's `error` field when it sent one.
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    UnexpectedResponse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Network(e.to_string())
    }
}
