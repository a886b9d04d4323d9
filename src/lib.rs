//! drive_upload - Upload a local file or directory to Google Drive.
//!
//! This library provides functionality to:
//! - Resolve OAuth client credentials and ready-made tokens
//! - Run the installed-app OAuth2 flow and keep tokens refreshed
//! - Zip a directory into a temporary archive that is removed afterwards
//! - Upload with the resumable protocol, resuming after transient failures
//!
//! # Example
//!
//! ```no_run
//! use drive_upload::{source, Authenticator, DriveClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let auth = Authenticator::from_credentials_file("credentials.json").await?;
//!     let client = DriveClient::new(auth)?;
//!
//!     let prepared = source::prepare("./photos")?;
//!     let file = client.upload(&prepared, |_, _| {}).await?;
//!     println!("{}", file.id);
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod credentials;
pub mod error;
pub mod flow;
pub mod models;
pub mod retry;
pub mod source;

// Re-exports for convenience
pub use auth::Authenticator;
pub use client::{DriveClient, UploadConfig};
pub use error::{DriveError, Result};
pub use models::{FileMetadata, StoredToken};
pub use source::PreparedSource;
