use std::io;
use thiserror::Error;

/// Error types for the download core.
///
/// Failures are split by how far they reach:
/// - Per-URL: extraction, network and not-found errors from the engine
/// - Per-task: download failures captured on the task's handle
/// - Recoverable: configuration problems that fall back to defaults
/// - Session: an explicit stop request
/// - Fatal: contract violations by the caller

/// Represents all possible errors that can occur in the application.
///
/// # Error Categories
///
/// - IO: File system operations
/// - Extraction: The engine could not resolve a URL to formats
/// - Download: The engine failed mid-transfer
/// - Config: Malformed profile, override or config file
/// - Cancelled: The session was stopped on request
/// - Precondition: A job was handed to the scheduler in an invalid state
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Youtube error: {0}")]
    Youtube(#[from] yt_dlp::error::Error),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Custom(String),
}

impl AppError {
    /// True for errors that describe a URL the engine could not resolve.
    pub fn is_extraction(&self) -> bool {
        matches!(
            self,
            AppError::Extraction(_) | AppError::Network(_) | AppError::NotFound(_)
        )
    }

    /// Cancellation is an expected outcome, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

impl From<&str> for AppError {
    fn from(error: &str) -> Self {
        AppError::Custom(error.to_string())
    }
}

impl From<String> for AppError {
    fn from(error: String) -> Self {
        AppError::Custom(error)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
