//! Interactive OAuth2 authorization-code flow with a loopback redirect.
//!
//! 1. Bind a listener on `127.0.0.1` (ephemeral port on desktops, 8080 headless)
//! 2. Send the user to the consent page with a `state` value and PKCE challenge
//! 3. Google redirects the browser to the listener with `code` and `state`
//! 4. Exchange the code for access and refresh tokens

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{DriveError, Result};
use crate::models::{
    ClientCredentials, OAuthErrorResponse, StoredToken, TokenResponse, DRIVE_FILE_SCOPE,
};

/// Port used when the callback has to be reached through an SSH tunnel.
pub const HEADLESS_PORT: u16 = 8080;

const SUCCESS_PAGE: &str = "<html><body>The authentication flow has completed. \
You may close this window.</body></html>";

const DENIED_PAGE: &str = "<html><body>Authorization was not granted. \
You may close this window.</body></html>";

/// Whether a browser can be opened on this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Desktop,
    Headless,
}

impl AuthMode {
    pub fn detect() -> Self {
        if is_headless() {
            AuthMode::Headless
        } else {
            AuthMode::Desktop
        }
    }
}

/// Best-effort detection of a session without a display.
pub fn is_headless() -> bool {
    headless_from_env(|key| std::env::var(key).ok(), cfg!(target_os = "macos"))
}

fn headless_from_env<F>(get: F, is_macos: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let set = |key: &str| get(key).is_some_and(|v| !v.is_empty());

    if set("SSH_CONNECTION") || set("SSH_CLIENT") {
        return true;
    }
    if is_macos {
        return false;
    }
    !set("DISPLAY") && !set("WAYLAND_DISPLAY")
}

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 48];
        rand::thread_rng().fill(&mut bytes[..]);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = Self::challenge_for(&verifier);
        Self { verifier, challenge }
    }

    /// BASE64URL(SHA256(verifier)).
    pub fn challenge_for(verifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    }
}

fn random_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(30)
        .map(char::from)
        .collect()
}

/// Authorization-code flow for an installed (desktop) OAuth client.
pub struct InstalledFlow {
    client: ClientCredentials,
    http: Client,
}

impl InstalledFlow {
    pub fn new(client: ClientCredentials) -> Self {
        Self {
            client,
            http: Client::new(),
        }
    }

    /// Consent page URL for the given redirect target.
    pub fn authorization_url(&self, redirect_uri: &str, state: &str, pkce: &Pkce) -> Result<Url> {
        let mut url = Url::parse(&self.client.auth_uri)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", DRIVE_FILE_SCOPE)
            .append_pair("state", state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        Ok(url)
    }

    /// Run the full consent flow and return a token with client credentials embedded.
    pub async fn run(&self, mode: AuthMode) -> Result<StoredToken> {
        let port = match mode {
            AuthMode::Desktop => 0,
            AuthMode::Headless => HEADLESS_PORT,
        };

        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
            DriveError::Auth(format!(
                "Failed to start the authorization server on port {}: {}",
                port, e
            ))
        })?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://localhost:{}/", port);

        let state = random_state();
        let pkce = Pkce::generate();
        let url = self.authorization_url(&redirect_uri, &state, &pkce)?;
        debug!(%redirect_uri, "Authorization server listening");

        match mode {
            AuthMode::Headless => {
                eprintln!("\n=== HEADLESS AUTHENTICATION ===");
                eprintln!("Running on a server without browser access.");
                eprintln!("The authorization server is listening on port {}.", port);
                eprintln!();
                eprintln!("If this server is not directly accessible:");
                eprintln!("  1. Run: ssh -L {}:localhost:{} <your-server>", port, port);
                eprintln!("  2. Keep the SSH session open during authentication");
                eprintln!();
                eprintln!("Otherwise, just copy the URL below and open it in any browser:");
                print_url(&url);
            }
            AuthMode::Desktop => {
                if open_browser(url.as_str()) {
                    eprintln!("Opened the authorization page in your browser.");
                } else {
                    warn!("Could not open a browser, falling back to manual mode");
                    print_url(&url);
                }
            }
        }

        let code = wait_for_callback(&listener, &state).await?;
        info!("Authorization code received");

        let response = self.exchange_code(&code, &redirect_uri, &pkce.verifier).await?;
        Ok(StoredToken::from_response(response, &self.client))
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client.client_id.as_str()),
            ("client_secret", self.client.client_secret.as_str()),
            ("code_verifier", code_verifier),
        ];

        let response = self
            .http
            .post(&self.client.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|e| DriveError::Auth(format!("Code exchange request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let reason = match serde_json::from_str::<OAuthErrorResponse>(&body) {
                Ok(error) => error.to_string(),
                Err(_) => format!("Status {}: {}", status, body),
            };
            return Err(DriveError::Auth(format!("Code exchange failed: {}", reason)));
        }

        Ok(response.json().await?)
    }
}

fn print_url(url: &Url) {
    eprintln!("\n\nCOPY THIS URL TO YOUR BROWSER:\n{}\n", url);
    eprintln!("After authorization, return to this terminal.\n");
}

/// Ask the platform to open `url` in the default browser.
fn open_browser(url: &str) -> bool {
    #[cfg(target_os = "macos")]
    let result = std::process::Command::new("open").arg(url).spawn();
    #[cfg(target_os = "windows")]
    let result = std::process::Command::new("cmd")
        .args(["/C", "start", "", url])
        .spawn();
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let result = std::process::Command::new("xdg-open").arg(url).spawn();

    result.is_ok()
}

/// Accept redirects on `listener` until one carries a code or an error.
///
/// Requests without either (such as `/favicon.ico`) get a 404 and are ignored.
pub async fn wait_for_callback(listener: &TcpListener, expected_state: &str) -> Result<String> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        debug!(%peer, "Callback connection");

        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;

        // Drain the headers so closing the socket does not reset the browser.
        let mut header = String::new();
        while reader.read_line(&mut header).await? > 2 {
            header.clear();
        }

        let target = request_line.split_whitespace().nth(1).unwrap_or("/");
        let url = Url::parse(&format!("http://localhost{}", target))?;

        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut error_description = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => error_description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            respond(&mut writer, "200 OK", DENIED_PAGE).await;
            let reason = OAuthErrorResponse {
                error,
                error_description,
            };
            return Err(DriveError::ConsentDenied(reason.to_string()));
        }

        let Some(code) = code else {
            respond(&mut writer, "404 Not Found", "").await;
            continue;
        };

        if state.as_deref() != Some(expected_state) {
            respond(&mut writer, "400 Bad Request", DENIED_PAGE).await;
            return Err(DriveError::Auth(
                "State mismatch in authorization callback".to_string(),
            ));
        }

        respond(&mut writer, "200 OK", SUCCESS_PAGE).await;
        return Ok(code);
    }
}

async fn respond<W: AsyncWrite + Unpin>(writer: &mut W, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    if let Err(e) = writer.write_all(response.as_bytes()).await {
        debug!(error = %e, "Failed to answer callback request");
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn flow() -> InstalledFlow {
        InstalledFlow::new(ClientCredentials {
            client_id: "id.apps.googleusercontent.com".to_string(),
            client_secret: "secret".to_string(),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
        })
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_headless_detection() {
        assert!(headless_from_env(env(&[("SSH_CONNECTION", "1 2 3 4")]), true));
        assert!(!headless_from_env(env(&[]), true));
        assert!(headless_from_env(env(&[]), false));
        assert!(!headless_from_env(env(&[("DISPLAY", ":0")]), false));
        assert!(!headless_from_env(env(&[("WAYLAND_DISPLAY", "wayland-0")]), false));
    }

    #[test]
    fn test_pkce_challenge() {
        // RFC 7636 appendix B
        let challenge = Pkce::challenge_for("dBjftJeZ4CVP-mJ92K9bNZ6h-A7SvpMnI7lwnhRvaOo");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");

        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier.len(), 64);
        assert_eq!(Pkce::challenge_for(&pkce.verifier), pkce.challenge);
    }

    #[test]
    fn test_authorization_url() {
        let pkce = Pkce::generate();
        let url = flow()
            .authorization_url("http://localhost:8080/", "xyz", &pkce)
            .unwrap();

        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["redirect_uri"], "http://localhost:8080/");
        assert_eq!(pairs["scope"], DRIVE_FILE_SCOPE);
        assert_eq!(pairs["state"], "xyz");
        assert_eq!(pairs["code_challenge"], pkce.challenge);
        assert_eq!(pairs["access_type"], "offline");
    }

    #[tokio::test]
    async fn test_wait_for_callback_returns_code() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move { wait_for_callback(&listener, "st4te").await });

        let body = reqwest::get(format!("http://127.0.0.1:{}/?state=st4te&code=4%2Fabc", port))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(body.contains("completed"));
        assert_eq!(server.await.unwrap().unwrap(), "4/abc");
    }

    #[tokio::test]
    async fn test_wait_for_callback_consent_denied() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move { wait_for_callback(&listener, "st4te").await });

        let _ = reqwest::get(format!("http://127.0.0.1:{}/?error=access_denied&state=st4te", port))
            .await;

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, DriveError::ConsentDenied(_)));
        assert!(err.to_string().contains("access_denied"));
    }

    #[tokio::test]
    async fn test_wait_for_callback_rejects_state_mismatch() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move { wait_for_callback(&listener, "expected").await });

        let _ = reqwest::get(format!("http://127.0.0.1:{}/?state=forged&code=abc", port)).await;

        assert!(server.await.unwrap().is_err());
    }
}
