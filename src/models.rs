//! Data models for OAuth material and Google Drive API responses.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Google OAuth2 authorization endpoint.
pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";

/// Google OAuth2 token endpoint.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Only files created or opened by this app are reachable.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Seconds before the recorded expiry at which a token is treated as expired.
const EXPIRY_BUFFER_SECS: i64 = 60;

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Metadata for an uploaded file, as returned by the Drive API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub web_view_link: Option<String>,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        Some(s) => s.parse::<u64>().map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Format bytes into human-readable size.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format seconds into human-readable time (e.g., "2m 15s", "1h 5m", "< 1s").
pub fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "--".to_string();
    }

    let secs = seconds.round() as u64;

    if secs == 0 {
        return "< 1s".to_string();
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let remaining_secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, remaining_secs)
    } else {
        format!("{}s", remaining_secs)
    }
}

/// Google API error response.
#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    pub code: u16,
    pub message: String,
}

/// OAuth client registration as downloaded from the Google Cloud Console.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

/// Top level of `credentials.json`; desktop clients use `installed`, web clients `web`.
#[derive(Debug, Deserialize)]
pub struct ClientSecretsFile {
    pub installed: Option<ClientCredentials>,
    pub web: Option<ClientCredentials>,
}

impl ClientSecretsFile {
    pub fn into_credentials(self) -> Option<ClientCredentials> {
        self.installed.or(self.web)
    }
}

/// Persisted OAuth token in the Google "authorized user" layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(rename = "token", alias = "access_token")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl StoredToken {
    /// Build a token from a successful token endpoint response.
    pub fn from_response(response: TokenResponse, client: &ClientCredentials) -> Self {
        let expiry = response.expiry_from(Utc::now());
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_uri: client.token_uri.clone(),
            client_id: Some(client.client_id.clone()),
            client_secret: Some(client.client_secret.clone()),
            scopes: vec![DRIVE_FILE_SCOPE.to_string()],
            expiry,
        }
    }

    /// A token without a recorded expiry is assumed to be valid.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= now + ChronoDuration::seconds(EXPIRY_BUFFER_SECS),
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the token carries everything needed for a refresh-token grant.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.client_id.is_some()
    }

    /// Apply a refresh response in place. Google omits the refresh token on refresh.
    pub fn apply_refresh(&mut self, response: TokenResponse) {
        self.expiry = response.expiry_from(Utc::now());
        self.access_token = response.access_token;
        if let Some(refresh_token) = response.refresh_token {
            self.refresh_token = Some(refresh_token);
        }
    }

    /// Embed client credentials so the token can be refreshed without `credentials.json`.
    pub fn with_client(mut self, client: &ClientCredentials) -> Self {
        self.client_id = Some(client.client_id.clone());
        self.client_secret = Some(client.client_secret.clone());
        self
    }
}

/// OAuth2 token endpoint response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| now + ChronoDuration::seconds(secs as i64))
    }
}

/// OAuth2 error body (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl std::fmt::Display for OAuthErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {}", self.error, description),
            None => write!(f, "{}", self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(1048576), "1.00 MB");
        assert_eq!(format_size(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0.4), "< 1s");
        assert_eq!(format_eta(5.0), "5s");
        assert_eq!(format_eta(65.0), "1m 5s");
        assert_eq!(format_eta(3665.0), "1h 1m");
        assert_eq!(format_eta(f64::INFINITY), "--");
        assert_eq!(format_eta(-5.0), "--");
        assert_eq!(format_eta(f64::NAN), "--");
    }

    #[test]
    fn test_token_accepts_access_token_alias() {
        let json = r#"{"access_token": "ya29.abc", "refresh_token": "1//r"}"#;
        let token: StoredToken = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "ya29.abc");
        assert_eq!(token.token_uri, DEFAULT_TOKEN_URI);
        assert!(token.expiry.is_none());
        assert!(!token.is_expired());
    }

    #[test]
    fn test_token_serializes_authorized_user_layout() {
        let token = StoredToken {
            access_token: "ya29.abc".to_string(),
            refresh_token: Some("1//r".to_string()),
            token_uri: DEFAULT_TOKEN_URI.to_string(),
            client_id: None,
            client_secret: None,
            scopes: vec![DRIVE_FILE_SCOPE.to_string()],
            expiry: None,
        };

        let value = serde_json::to_value(&token).unwrap();
        assert_eq!(value["token"], "ya29.abc");
        assert!(value.get("access_token").is_none());
        assert!(value.get("client_id").is_none());
    }

    #[test]
    fn test_token_expiry_buffer() {
        let now = Utc::now();
        let mut token: StoredToken =
            serde_json::from_str(r#"{"token": "t"}"#).unwrap();

        token.expiry = Some(now + ChronoDuration::seconds(30));
        assert!(token.is_expired_at(now));

        token.expiry = Some(now + ChronoDuration::seconds(600));
        assert!(!token.is_expired_at(now));
    }

    #[test]
    fn test_apply_refresh_keeps_refresh_token() {
        let mut token: StoredToken =
            serde_json::from_str(r#"{"token": "old", "refresh_token": "keep-me"}"#).unwrap();

        token.apply_refresh(TokenResponse {
            access_token: "new".to_string(),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(3599),
            refresh_token: None,
            scope: None,
        });

        assert_eq!(token.access_token, "new");
        assert_eq!(token.refresh_token.as_deref(), Some("keep-me"));
        assert!(token.expiry.is_some());
        assert!(!token.is_expired());
    }

    #[test]
    fn test_file_metadata_size_from_string() {
        let metadata: FileMetadata = serde_json::from_str(
            r#"{"id": "abc123", "name": "test.txt", "mimeType": "text/plain", "size": "1024"}"#,
        )
        .unwrap();

        assert_eq!(metadata.size, Some(1024));
        assert_eq!(metadata.mime_type.as_deref(), Some("text/plain"));

        let without_size: FileMetadata =
            serde_json::from_str(r#"{"id": "abc123", "name": "test.txt"}"#).unwrap();
        assert_eq!(without_size.size, None);
        assert_eq!(without_size.web_view_link, None);
    }
}
