//! Error types for modelfetch core

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while resolving or downloading a model
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resource not found: {url} (HTTP {status})")]
    NotFound { url: String, status: u16 },

    #[error("Get model file name failed: {0}")]
    NameResolution(String),

    #[error("Invalid model type: {0}")]
    InvalidCategory(String),

    #[error("Invalid destination {}: {reason}", path.display())]
    InvalidDestination { path: PathBuf, reason: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Size mismatch: expected {expected} bytes but {actual} are on disk")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Download failed, reached max try count ({attempts} attempts): {last_error}")]
    DownloadExhausted { attempts: u32, last_error: String },

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Download task failed: {0}")]
    Task(String),
}

impl FetchError {
    /// Check if this error is a transient, connection-level failure
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
            }
            FetchError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        FetchError::Serialization(error.to_string())
    }
}

impl From<modelfetch_types::ParseCategoryError> for FetchError {
    fn from(error: modelfetch_types::ParseCategoryError) -> Self {
        FetchError::InvalidCategory(error.0)
    }
}

// Allow hosts that only render a message to convert directly
impl From<FetchError> for String {
    fn from(error: FetchError) -> Self {
        error.to_string()
    }
}
