//! Error types for the drive_upload crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while authenticating or uploading to Google Drive.
#[derive(Error, Debug)]
pub enum DriveError {
    #[error("Source path does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error(
        "No credentials provided. Supply --credentials / -c or set the \
         GOOGLE_DRIVE_CREDENTIALS environment variable"
    )]
    MissingCredentials,

    #[error("Invalid credentials file: {0}")]
    InvalidCredentials(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Authorization was denied: {0}")]
    ConsentDenied(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Upload failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Upload session expired")]
    SessionExpired,

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Failed to build archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl DriveError {
    /// Whether the error belongs to the authentication family.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            DriveError::Auth(_)
                | DriveError::ConsentDenied(_)
                | DriveError::MissingCredentials
                | DriveError::InvalidCredentials(_)
                | DriveError::InvalidToken(_)
        )
    }

    /// Whether the error belongs to the upload family.
    pub fn is_upload(&self) -> bool {
        matches!(
            self,
            DriveError::Upload(_) | DriveError::RetriesExhausted { .. } | DriveError::SessionExpired
        )
    }
}

/// Result type alias for DriveError.
pub type Result<T> = std::result::Result<T, DriveError>;
