//! Resolution of OAuth client credentials and token material.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DriveError, Result};
use crate::models::{ClientCredentials, ClientSecretsFile, StoredToken};

/// Environment variable holding the path to `credentials.json`.
pub const CREDENTIALS_ENV: &str = "GOOGLE_DRIVE_CREDENTIALS";

/// Environment variable holding token JSON or a token file path.
pub const TOKEN_ENV: &str = "GOOGLE_DRIVE_TOKEN";

/// File name of the cached token.
pub const TOKEN_FILENAME: &str = "token.json";

/// Literal `--token` value that requests token generation.
pub const GENERATE: &str = "generate";

/// Where a ready-made token comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// A token file; refreshed tokens are written back to it.
    File(PathBuf),
    /// Raw token JSON from the command line or environment.
    Literal(String),
}

/// Interpretation of the `--token` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenArg {
    Generate,
    Provided(TokenSource),
}

impl TokenArg {
    /// An existing file path wins over literal JSON.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed == GENERATE {
            return TokenArg::Generate;
        }

        let path = Path::new(trimmed);
        if path.is_file() {
            TokenArg::Provided(TokenSource::File(path.to_path_buf()))
        } else {
            TokenArg::Provided(TokenSource::Literal(trimmed.to_string()))
        }
    }
}

impl TokenSource {
    /// Load and validate the token.
    pub fn load(&self) -> Result<StoredToken> {
        match self {
            TokenSource::File(path) => {
                debug!(path = %path.display(), "Reading token file");
                let content = fs::read_to_string(path)?;
                parse_token(content.trim())
            }
            TokenSource::Literal(json) => parse_token(json),
        }
    }

    /// Path refreshed tokens should be written back to, if any.
    pub fn persist_path(&self) -> Option<&Path> {
        match self {
            TokenSource::File(path) => Some(path),
            TokenSource::Literal(_) => None,
        }
    }
}

/// Parse token JSON, accepting either a `token` or an `access_token` field.
pub fn parse_token(json: &str) -> Result<StoredToken> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| DriveError::InvalidToken(format!("Invalid JSON in token: {}", e)))?;

    let has_access_token = ["access_token", "token"]
        .iter()
        .any(|key| value.get(key).and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty()));

    if !has_access_token {
        return Err(DriveError::InvalidToken(
            "Token must contain 'access_token' or 'token' field".to_string(),
        ));
    }

    serde_json::from_value(value).map_err(|e| DriveError::InvalidToken(e.to_string()))
}

/// Return the credentials path or fail if none was supplied or it is not a file.
pub fn resolve_credentials_path(cli_value: Option<PathBuf>) -> Result<PathBuf> {
    let path = cli_value.ok_or(DriveError::MissingCredentials)?;
    if !path.is_file() {
        return Err(DriveError::InvalidCredentials(format!(
            "credentials file not found: {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Load OAuth client credentials from `credentials.json`.
pub fn load_client_credentials<P: AsRef<Path>>(path: P) -> Result<ClientCredentials> {
    let content = fs::read_to_string(path.as_ref())?;
    let secrets: ClientSecretsFile = serde_json::from_str(&content)
        .map_err(|e| DriveError::InvalidCredentials(e.to_string()))?;

    secrets.into_credentials().ok_or_else(|| {
        DriveError::InvalidCredentials(
            "expected an 'installed' or 'web' client section".to_string(),
        )
    })
}

/// The cached token lives alongside the credentials file.
pub fn token_path_for<P: AsRef<Path>>(credentials_path: P) -> Result<PathBuf> {
    let absolute = std::path::absolute(credentials_path.as_ref())?;
    let dir = absolute.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(TOKEN_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_generate() {
        assert_eq!(TokenArg::parse("generate"), TokenArg::Generate);
        assert_eq!(TokenArg::parse(" generate "), TokenArg::Generate);
    }

    #[test]
    fn test_parse_file_path() {
        let file = NamedTempFile::new().unwrap();
        let arg = TokenArg::parse(file.path().to_str().unwrap());
        assert_eq!(
            arg,
            TokenArg::Provided(TokenSource::File(file.path().to_path_buf()))
        );
    }

    #[test]
    fn test_parse_literal_json() {
        let arg = TokenArg::parse(r#"{"token": "abc"}"#);
        assert_eq!(
            arg,
            TokenArg::Provided(TokenSource::Literal(r#"{"token": "abc"}"#.to_string()))
        );
    }

    #[test]
    fn test_parse_token_requires_access_token() {
        let err = parse_token(r#"{"refresh_token": "r"}"#).unwrap_err();
        assert!(err.to_string().contains("'access_token' or 'token'"));
    }

    #[test]
    fn test_parse_token_invalid_json() {
        let err = parse_token("not json").unwrap_err();
        assert!(matches!(err, DriveError::InvalidToken(_)));
        assert!(err.is_auth());
    }

    #[test]
    fn test_load_client_credentials_installed() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"{"installed": {"client_id": "id.apps", "client_secret": "s3cret"}}"#,
        )
        .unwrap();

        let creds = load_client_credentials(file.path()).unwrap();
        assert_eq!(creds.client_id, "id.apps");
        assert_eq!(creds.token_uri, crate::models::DEFAULT_TOKEN_URI);
    }

    #[test]
    fn test_load_client_credentials_missing_section() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"other": {}}"#).unwrap();

        let err = load_client_credentials(file.path()).unwrap_err();
        assert!(matches!(err, DriveError::InvalidCredentials(_)));
    }

    #[test]
    fn test_resolve_credentials_missing() {
        assert!(matches!(
            resolve_credentials_path(None),
            Err(DriveError::MissingCredentials)
        ));
        assert!(matches!(
            resolve_credentials_path(Some(PathBuf::from("/nonexistent/credentials.json"))),
            Err(DriveError::InvalidCredentials(_))
        ));
    }

    #[test]
    fn test_token_path_next_to_credentials() {
        let path = token_path_for("/etc/app/credentials.json").unwrap();
        assert_eq!(path, PathBuf::from("/etc/app/token.json"));
    }
}
