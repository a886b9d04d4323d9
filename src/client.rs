//! Google Drive resumable upload client.
//!
//! # Protocol
//! 1. POST the file metadata with `uploadType=resumable`; the `Location` header
//!    is the session URL
//! 2. PUT chunks with `Content-Range: bytes {start}-{end}/{total}`; `308` with a
//!    `Range: bytes=0-{last}` header acknowledges a prefix, `200`/`201` finishes
//! 3. After a transient failure, PUT with `Content-Range: bytes */{total}` to
//!    learn the acknowledged offset and continue from there

use std::io::SeekFrom;
use std::path::Path;

use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::error::{DriveError, Result};
use crate::models::{ApiErrorResponse, FileMetadata};
use crate::retry::{is_transient_status, RetryConfig};
use crate::source::PreparedSource;

/// Upload URL for Google Drive API.
pub const UPLOAD_API_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Chunk sizes must be a multiple of 256 KiB.
pub const CHUNK_GRANULARITY: usize = 256 * 1024;

/// Default chunk size (8 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const FILE_FIELDS: &str = "id, name, size, mimeType, webViewLink";

/// Settings for the upload client.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub upload_base: String,
    pub chunk_size: usize,
    pub retry: RetryConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_base: UPLOAD_API_BASE.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

/// Resumable upload session: the session URL plus the acknowledged offset.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub url: String,
    pub total_size: u64,
    pub offset: u64,
}

/// Result of a chunk PUT or status query that the server answered.
#[derive(Debug)]
enum ChunkOutcome {
    Incomplete(u64),
    Complete(FileMetadata),
}

/// Failure of a single request, split by whether it is worth retrying.
#[derive(Debug)]
enum Attempt {
    Transient(String),
    Fatal(DriveError),
}

impl From<DriveError> for Attempt {
    fn from(e: DriveError) -> Self {
        Attempt::Fatal(e)
    }
}

impl From<std::io::Error> for Attempt {
    fn from(e: std::io::Error) -> Self {
        Attempt::Fatal(e.into())
    }
}

fn send_failure(e: reqwest::Error) -> Attempt {
    if e.is_builder() {
        Attempt::Fatal(e.into())
    } else {
        Attempt::Transient(e.to_string())
    }
}

/// Client for uploading files to Google Drive.
pub struct DriveClient {
    auth: Authenticator,
    http: Client,
    config: UploadConfig,
}

impl DriveClient {
    /// Create a client with the default upload settings.
    pub fn new(auth: Authenticator) -> Result<Self> {
        Self::with_config(auth, UploadConfig::default())
    }

    /// Create a client with custom settings.
    pub fn with_config(auth: Authenticator, config: UploadConfig) -> Result<Self> {
        if config.chunk_size == 0 || config.chunk_size % CHUNK_GRANULARITY != 0 {
            return Err(DriveError::Upload(format!(
                "chunk size must be a positive multiple of {} bytes",
                CHUNK_GRANULARITY
            )));
        }

        // 308 is the resumable protocol's "incomplete" answer, not a redirect.
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { auth, http, config })
    }

    /// Upload a prepared source, reporting `(bytes_acknowledged, total)` as it goes.
    pub async fn upload<F>(&self, source: &PreparedSource, on_progress: F) -> Result<FileMetadata>
    where
        F: FnMut(u64, u64),
    {
        self.upload_file(source.path(), source.name(), source.mime_type(), on_progress)
            .await
    }

    /// Upload a local file under `name` with the resumable protocol.
    pub async fn upload_file<P, F>(
        &self,
        local_path: P,
        name: &str,
        mime_type: &str,
        mut on_progress: F,
    ) -> Result<FileMetadata>
    where
        P: AsRef<Path>,
        F: FnMut(u64, u64),
    {
        let local_path = local_path.as_ref();
        let mut file = File::open(local_path).await?;
        let total_size = file.metadata().await?.len();

        info!(
            path = %local_path.display(),
            file_name = name,
            mime_type,
            total_size,
            "Starting resumable upload"
        );

        let mut session = self.start_session(name, mime_type, total_size).await?;
        on_progress(0, total_size);

        let mut failures = 0u32;
        let mut needs_status = false;

        loop {
            // Everything sent but not yet confirmed: only a status query can finish it.
            let sent_everything = total_size > 0 && session.offset >= total_size;
            let status_query = needs_status || sent_everything;
            let attempt = if status_query {
                self.query_status(&session).await
            } else {
                self.put_chunk(&session, &mut file).await
            };

            let reason = match attempt {
                Ok(ChunkOutcome::Complete(metadata)) => {
                    on_progress(total_size, total_size);
                    info!(id = %metadata.id, "Upload complete");
                    return Ok(metadata);
                }
                Ok(ChunkOutcome::Incomplete(acknowledged)) => {
                    if status_query && total_size > 0 && acknowledged >= total_size {
                        return Err(DriveError::Upload(
                            "server holds every byte but did not finalize the upload".to_string(),
                        ));
                    }
                    let advanced = acknowledged > session.offset;
                    session.offset = acknowledged;
                    needs_status = false;
                    on_progress(acknowledged, total_size);

                    if advanced {
                        failures = 0;
                    }
                    if advanced || status_query {
                        continue;
                    }
                    // A chunk the server did not take counts against the budget.
                    format!("no bytes acknowledged past offset {}", acknowledged)
                }
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Transient(reason)) => reason,
            };

            failures += 1;
            if failures > self.config.retry.max_retries {
                return Err(DriveError::RetriesExhausted {
                    attempts: failures,
                    last_error: reason,
                });
            }

            let delay = self.config.retry.backoff(failures);
            warn!(
                %reason,
                attempt = failures,
                offset = session.offset,
                delay_ms = delay.as_millis() as u64,
                "Upload made no progress, will resume"
            );
            tokio::time::sleep(delay).await;
            needs_status = true;
        }
    }

    /// Open a resumable session, retrying transient failures.
    pub async fn start_session(
        &self,
        name: &str,
        mime_type: &str,
        total_size: u64,
    ) -> Result<UploadSession> {
        let mut failures = 0u32;
        loop {
            match self.try_start_session(name, mime_type, total_size).await {
                Ok(session) => return Ok(session),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Transient(reason)) => {
                    failures += 1;
                    if failures > self.config.retry.max_retries {
                        return Err(DriveError::RetriesExhausted {
                            attempts: failures,
                            last_error: reason,
                        });
                    }
                    let delay = self.config.retry.backoff(failures);
                    warn!(%reason, attempt = failures, "Failed to start upload session, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_start_session(
        &self,
        name: &str,
        mime_type: &str,
        total_size: u64,
    ) -> std::result::Result<UploadSession, Attempt> {
        let token = self.auth.get_access_token().await?;
        let metadata = serde_json::json!({ "name": name });

        let response = self
            .http
            .post(format!("{}/files", self.config.upload_base))
            .bearer_auth(&token)
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", total_size.to_string())
            .json(&metadata)
            .send()
            .await
            .map_err(send_failure)?;

        let status = response.status();
        if is_transient_status(status) {
            return Err(Attempt::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(Attempt::Fatal(api_error(response).await));
        }

        let url = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DriveError::Upload("No upload URL in response".to_string()))?
            .to_string();

        debug!(%url, "Upload session started");
        Ok(UploadSession {
            url,
            total_size,
            offset: 0,
        })
    }

    /// Send the chunk starting at the session's acknowledged offset.
    async fn put_chunk(
        &self,
        session: &UploadSession,
        file: &mut File,
    ) -> std::result::Result<ChunkOutcome, Attempt> {
        let token = self.auth.get_access_token().await?;

        let (content_range, body) = if session.total_size == 0 {
            ("bytes */0".to_string(), Vec::new())
        } else {
            let remaining = session.total_size - session.offset;
            let len = remaining.min(self.config.chunk_size as u64);

            file.seek(SeekFrom::Start(session.offset)).await?;
            let mut body = Vec::with_capacity(len as usize);
            (&mut *file).take(len).read_to_end(&mut body).await?;
            if (body.len() as u64) < len {
                return Err(Attempt::Fatal(DriveError::Upload(
                    "source file shrank during upload".to_string(),
                )));
            }

            let end = session.offset + len - 1;
            (
                format!("bytes {}-{}/{}", session.offset, end, session.total_size),
                body,
            )
        };

        debug!(%content_range, "Uploading chunk");

        let response = self
            .http
            .put(&session.url)
            .bearer_auth(&token)
            .header(CONTENT_RANGE, content_range)
            .body(body)
            .send()
            .await
            .map_err(send_failure)?;

        outcome(response).await
    }

    /// Ask the server how many bytes of the session it holds.
    async fn query_status(
        &self,
        session: &UploadSession,
    ) -> std::result::Result<ChunkOutcome, Attempt> {
        let token = self.auth.get_access_token().await?;
        debug!(url = %session.url, "Querying upload status");

        let response = self
            .http
            .put(&session.url)
            .bearer_auth(&token)
            .header(CONTENT_RANGE, format!("bytes */{}", session.total_size))
            .body(Vec::new())
            .send()
            .await
            .map_err(send_failure)?;

        outcome(response).await
    }
}

async fn outcome(response: Response) -> std::result::Result<ChunkOutcome, Attempt> {
    let status = response.status();
    match status {
        StatusCode::OK | StatusCode::CREATED => {
            let metadata: FileMetadata = response.json().await.map_err(|e| {
                Attempt::Fatal(DriveError::Upload(format!("Invalid completion response: {}", e)))
            })?;
            Ok(ChunkOutcome::Complete(metadata))
        }
        StatusCode::PERMANENT_REDIRECT => {
            let acknowledged = acknowledged_bytes(
                response.headers().get(RANGE).and_then(|v| v.to_str().ok()),
            )?;
            debug!(acknowledged, "Upload incomplete");
            Ok(ChunkOutcome::Incomplete(acknowledged))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(Attempt::Fatal(DriveError::SessionExpired)),
        s if is_transient_status(s) => Err(Attempt::Transient(format!("HTTP {}", s))),
        _ => Err(Attempt::Fatal(api_error(response).await)),
    }
}

/// Bytes held by the server given a `Range: bytes=0-{last}` header; none yet without one.
fn acknowledged_bytes(range: Option<&str>) -> std::result::Result<u64, Attempt> {
    let Some(range) = range else {
        return Ok(0);
    };

    range
        .strip_prefix("bytes=0-")
        .and_then(|last| last.trim().parse::<u64>().ok())
        .map(|last| last + 1)
        .ok_or_else(|| {
            Attempt::Fatal(DriveError::Upload(format!(
                "Invalid Range header in upload response: {}",
                range
            )))
        })
}

async fn api_error(response: Response) -> DriveError {
    let status = response.status();
    let error_body = response.text().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&error_body) {
        return DriveError::ApiError {
            status: api_error.error.code,
            message: api_error.error.message,
        };
    }
    DriveError::ApiError {
        status: status.as_u16(),
        message: error_body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledged_bytes() {
        assert_eq!(acknowledged_bytes(None).unwrap(), 0);
        assert_eq!(acknowledged_bytes(Some("bytes=0-262143")).unwrap(), 262144);
        assert!(acknowledged_bytes(Some("bytes=5-10")).is_err());
        assert!(acknowledged_bytes(Some("garbage")).is_err());
    }

    #[test]
    fn test_chunk_size_validation() {
        let auth = Authenticator::new(
            serde_json::from_str(r#"{"token": "t"}"#).unwrap(),
            None,
        );

        let bad = UploadConfig {
            chunk_size: 300 * 1024,
            ..UploadConfig::default()
        };
        assert!(DriveClient::with_config(auth.clone(), bad).is_err());

        let zero = UploadConfig {
            chunk_size: 0,
            ..UploadConfig::default()
        };
        assert!(DriveClient::with_config(auth.clone(), zero).is_err());

        assert!(DriveClient::new(auth).is_ok());
    }
}
