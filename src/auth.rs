//! OAuth2 token management for Google Drive.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::credentials::{load_client_credentials, token_path_for, TokenSource};
use crate::error::{DriveError, Result};
use crate::flow::{AuthMode, InstalledFlow};
use crate::models::{OAuthErrorResponse, StoredToken, TokenResponse};

/// How the current token was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOrigin {
    /// Loaded from a cache, file, or literal and still valid.
    Cached,
    /// Loaded and then refreshed with the refresh token.
    Refreshed,
    /// Obtained through the interactive consent flow.
    Authorized,
}

/// Hands out valid access tokens, refreshing and persisting them as needed.
#[derive(Debug, Clone)]
pub struct Authenticator {
    client: Client,
    token: Arc<RwLock<StoredToken>>,
    persist_to: Option<PathBuf>,
    origin: TokenOrigin,
}

impl Authenticator {
    /// Wrap an existing token. Refreshed tokens are written to `persist_to` if set.
    pub fn new(token: StoredToken, persist_to: Option<PathBuf>) -> Self {
        Self {
            client: Client::new(),
            token: Arc::new(RwLock::new(token)),
            persist_to,
            origin: TokenOrigin::Cached,
        }
    }

    /// Build from a token supplied with `--token` or `GOOGLE_DRIVE_TOKEN`.
    ///
    /// An expired token is refreshed up front when it carries client credentials.
    pub async fn from_token_source(source: &TokenSource) -> Result<Self> {
        let token = source.load()?;
        let persist_to = source.persist_path().map(Path::to_path_buf);
        let mut auth = Self::new(token, persist_to);

        if auth.token().await.is_expired() {
            info!("Token expired, refreshing");
            auth.force_refresh().await?;
            auth.origin = TokenOrigin::Refreshed;
        }

        Ok(auth)
    }

    /// Standard flow: use `token.json` next to `credentials.json`, refreshing it
    /// when expired, or run the interactive consent flow when there is none.
    pub async fn from_credentials_file<P: AsRef<Path>>(credentials_path: P) -> Result<Self> {
        let client = load_client_credentials(credentials_path.as_ref())?;
        let token_path = token_path_for(credentials_path.as_ref())?;

        if token_path.is_file() {
            match TokenSource::File(token_path.clone()).load() {
                Ok(token) => {
                    let token = if token.client_id.is_none() {
                        token.with_client(&client)
                    } else {
                        token
                    };

                    if !token.is_expired() {
                        debug!(path = %token_path.display(), "Using cached token");
                        return Ok(Self::new(token, Some(token_path)));
                    }

                    if token.can_refresh() {
                        let mut auth = Self::new(token, Some(token_path));
                        info!("Cached token expired, refreshing");
                        auth.force_refresh().await?;
                        auth.origin = TokenOrigin::Refreshed;
                        return Ok(auth);
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring unreadable cached token"),
            }
        }

        let flow = InstalledFlow::new(client);
        let token = flow.run(AuthMode::detect()).await?;
        write_token_file(&token_path, &token)?;
        info!(path = %token_path.display(), "Saved token");

        let mut auth = Self::new(token, Some(token_path));
        auth.origin = TokenOrigin::Authorized;
        Ok(auth)
    }

    /// How the token held by this authenticator was obtained.
    pub fn origin(&self) -> TokenOrigin {
        self.origin
    }

    /// Snapshot of the current token.
    pub async fn token(&self) -> StoredToken {
        self.token.read().await.clone()
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_access_token(&self) -> Result<String> {
        {
            let token = self.token.read().await;
            if !token.is_expired() {
                return Ok(token.access_token.clone());
            }
        }

        let mut token = self.token.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if !token.is_expired() {
            return Ok(token.access_token.clone());
        }

        self.refresh_locked(&mut token).await?;
        Ok(token.access_token.clone())
    }

    /// Refresh regardless of the recorded expiry.
    pub async fn force_refresh(&self) -> Result<()> {
        let mut token = self.token.write().await;
        self.refresh_locked(&mut token).await
    }

    async fn refresh_locked(&self, token: &mut StoredToken) -> Result<()> {
        if !token.can_refresh() {
            return Err(DriveError::Auth(
                "token expired and cannot be refreshed (missing refresh_token or client_id)"
                    .to_string(),
            ));
        }

        let response = refresh_token(&self.client, token).await?;
        token.apply_refresh(response);
        debug!(expiry = ?token.expiry, "Access token refreshed");

        if let Some(path) = &self.persist_to {
            write_token_file(path, token)?;
            debug!(path = %path.display(), "Persisted refreshed token");
        }

        Ok(())
    }
}

/// Obtain a token through `credentials.json` and write a portable copy, with the
/// client credentials embedded, to `output`.
pub async fn generate_token_file<P, Q>(credentials_path: P, output: Q) -> Result<Authenticator>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let client = load_client_credentials(credentials_path.as_ref())?;
    let auth = Authenticator::from_credentials_file(credentials_path.as_ref()).await?;

    let token = auth.token().await.with_client(&client);
    write_token_file(output.as_ref(), &token)?;
    info!(path = %output.as_ref().display(), "Wrote portable token");

    Ok(auth)
}

/// Shell line exporting the token for headless reuse.
pub fn export_hint(token: &StoredToken) -> Result<String> {
    let json = serde_json::to_string(token)?;
    Ok(format!(
        "export GOOGLE_DRIVE_TOKEN='{}'",
        json.replace('\'', "'\"'\"'")
    ))
}

/// Exchange a refresh token for a new access token.
async fn refresh_token(client: &Client, token: &StoredToken) -> Result<TokenResponse> {
    let refresh_token = token.refresh_token.as_deref().unwrap_or_default();
    let client_id = token.client_id.as_deref().unwrap_or_default();
    let client_secret = token.client_secret.as_deref().unwrap_or_default();

    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ];

    let response = client
        .post(&token.token_uri)
        .form(&params)
        .send()
        .await
        .map_err(|e| DriveError::Auth(format!("Token refresh request failed: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let reason = match serde_json::from_str::<OAuthErrorResponse>(&body) {
            Ok(error) => error.to_string(),
            Err(_) => format!("Status {}: {}", status, body),
        };
        return Err(DriveError::Auth(format!("Token refresh failed: {}", reason)));
    }

    Ok(response.json().await?)
}

/// Write a token as JSON, readable only by the owner on Unix.
pub fn write_token_file(path: &Path, token: &StoredToken) -> Result<()> {
    let json = serde_json::to_string_pretty(token)?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    // `mode` only applies on creation; tighten an existing file too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(json.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn token(expiry_offset_secs: i64) -> StoredToken {
        StoredToken {
            access_token: "ya29.current".to_string(),
            refresh_token: None,
            token_uri: "http://127.0.0.1:9/token".to_string(),
            client_id: None,
            client_secret: None,
            scopes: Vec::new(),
            expiry: Some(Utc::now() + Duration::seconds(expiry_offset_secs)),
        }
    }

    #[tokio::test]
    async fn test_valid_token_is_returned_without_refresh() {
        let auth = Authenticator::new(token(3600), None);
        assert_eq!(auth.get_access_token().await.unwrap(), "ya29.current");
        assert_eq!(auth.origin(), TokenOrigin::Cached);
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_material_fails() {
        let auth = Authenticator::new(token(-10), None);
        let err = auth.get_access_token().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[test]
    fn test_write_token_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let original = token(3600);

        write_token_file(&path, &original).unwrap();
        let loaded = TokenSource::File(path).load().unwrap();

        assert_eq!(loaded.access_token, original.access_token);
        assert_eq!(loaded.token_uri, original.token_uri);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_token_file_restricts_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_token_file(&path, &token(3600)).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
