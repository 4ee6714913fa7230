//! OAuth2 Authorization Code flow with PKCE for CLI authentication.
//!
//! Flow:
//! 1. Generate a code verifier/challenge pair and a random state
//! 2. Open the authorize URL in the browser
//! 3. Capture the redirect on a loopback listener (127.0.0.1)
//! 4. Exchange the code (plus verifier) for access + refresh tokens
//!
//! Refresh tokens are long-lived; access tokens are refreshed on demand.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use indicatif::{ProgressBar, ProgressStyle};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Dropbox OAuth endpoints
pub const DROPBOX_AUTHORIZE_URL: &str = "https://www.dropbox.com/oauth2/authorize";
pub const DROPBOX_TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";

/// Default loopback port (must match the redirect URI registered for the app)
pub const DEFAULT_CALLBACK_PORT: u16 = 53682;

const CALLBACK_PATH: &str = "/callback";
const LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

/// PKCE verifier/challenge pair plus CSRF state.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl PkceChallenge {
    /// Random 64-char verifier, S256 challenge.
    pub fn generate() -> Self {
        let verifier = random_string(64);
        Self {
            challenge: challenge_for(&verifier),
            verifier,
            state: random_string(24),
        }
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Response from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Tokens obtained by a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// PKCE login / refresh client.
pub struct PkceFlow {
    client: Client,
    app_key: String,
    authorize_url: String,
    token_url: String,
    port: u16,
}

impl PkceFlow {
    /// Flow against the Dropbox endpoints.
    pub fn dropbox(app_key: &str) -> Self {
        Self::with_endpoints(app_key, DROPBOX_AUTHORIZE_URL, DROPBOX_TOKEN_URL)
    }

    /// Flow with custom endpoints (for testing)
    pub fn with_endpoints(app_key: &str, authorize_url: &str, token_url: &str) -> Self {
        Self {
            client: Client::new(),
            app_key: app_key.to_string(),
            authorize_url: authorize_url.to_string(),
            token_url: token_url.to_string(),
            port: DEFAULT_CALLBACK_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, CALLBACK_PATH)
    }

    /// Browser URL for the consent page.
    pub fn authorize_url(&self, pkce: &PkceChallenge) -> Result<String> {
        let mut url = url::Url::parse(&self.authorize_url).context("Invalid authorize URL")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.app_key)
            .append_pair("response_type", "code")
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("redirect_uri", &self.redirect_uri())
            .append_pair("state", &pkce.state)
            .append_pair("token_access_type", "offline");
        Ok(url.to_string())
    }

    fn post_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .context("Cannot reach token endpoint")?;

        let status = response.status();
        let text = response.text().context("Cannot read token response")?;
        let token: TokenResponse = serde_json::from_str(&text)
            .with_context(|| format!("Cannot parse token response ({}): {}", status, text))?;

        if let Some(error) = &token.error {
            let desc = token.error_description.as_deref().unwrap_or("Unknown error");
            bail!("OAuth error: {} - {}", error, desc);
        }
        if !status.is_success() {
            bail!("Token endpoint returned {}: {}", status, text);
        }
        Ok(token)
    }

    /// Exchange an authorization code for tokens.
    pub fn exchange_code(&self, code: &str, pkce: &PkceChallenge) -> Result<OAuthTokens> {
        let redirect_uri = self.redirect_uri();
        let token = self.post_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.app_key),
            ("code_verifier", &pkce.verifier),
            ("redirect_uri", &redirect_uri),
        ])?;

        match (token.access_token, token.refresh_token) {
            (Some(access_token), Some(refresh_token)) => Ok(OAuthTokens {
                access_token,
                refresh_token,
            }),
            _ => bail!("Token response is missing access_token or refresh_token"),
        }
    }

    /// Get a fresh access token from a refresh token.
    pub fn refresh(&self, refresh_token: &str) -> Result<String> {
        let token = self.post_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.app_key),
        ])?;
        token
            .access_token
            .context("Refresh response has no access_token")
    }

    /// Wait for the browser redirect and return the authorization code.
    pub fn wait_for_code(
        &self,
        listener: &TcpListener,
        expected_state: &str,
        timeout: Duration,
    ) -> Result<String> {
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() > deadline {
                bail!("Timed out waiting for the browser login. Please try again.");
            }

            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
                Err(e) => return Err(e).context("Loopback listener failed"),
            };

            if let Some(code) = handle_callback(stream, expected_state)? {
                return Ok(code);
            }
        }
    }

    /// Full flow: open consent page, capture redirect, exchange code.
    /// `display_instructions` receives the URL in case no browser can be opened.
    pub fn authenticate<F>(&self, display_instructions: F) -> Result<OAuthTokens>
    where
        F: FnOnce(&str),
    {
        let pkce = PkceChallenge::generate();
        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .with_context(|| format!("Cannot listen on 127.0.0.1:{}", self.port))?;
        let url = self.authorize_url(&pkce)?;

        display_instructions(&url);
        if !crate::utils::browser::open_browser(&url) {
            info!("[OAuth] Could not open a browser, waiting for manual login");
        }

        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message("Waiting for authorization in the browser...");
        spinner.enable_steady_tick(Duration::from_millis(100));

        let code = self.wait_for_code(&listener, &pkce.state, LOGIN_TIMEOUT);
        spinner.finish_and_clear();

        self.exchange_code(&code?, &pkce)
    }
}

/// Serve one loopback request. `Ok(None)` for unrelated requests (favicon etc).
fn handle_callback(mut stream: TcpStream, expected_state: &str) -> Result<Option<String>> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut reader = BufReader::new(&stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    // Drain headers so closing the socket does not reset the connection.
    let mut header = String::new();
    while reader.read_line(&mut header)? > 0 && !header.trim().is_empty() {
        header.clear();
    }
    drop(reader);
    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    debug!("[OAuth] Loopback request: {}", target);

    let url = url::Url::parse(&format!("http://127.0.0.1{}", target))
        .context("Bad callback request")?;
    if url.path() != CALLBACK_PATH {
        respond(&mut stream, "404 Not Found", "Not found")?;
        return Ok(None);
    }

    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.to_string())
    };

    if let Some(error) = param("error") {
        respond(&mut stream, "400 Bad Request", "Authorization was denied.")?;
        bail!("Authorization failed: {}", error);
    }
    if param("state").as_deref() != Some(expected_state) {
        respond(&mut stream, "400 Bad Request", "State mismatch.")?;
        bail!("OAuth state mismatch, possible CSRF. Please try again.");
    }
    let Some(code) = param("code") else {
        respond(&mut stream, "400 Bad Request", "Missing code.")?;
        bail!("Callback did not include an authorization code");
    };

    respond(
        &mut stream,
        "200 OK",
        "Login complete. You can close this window and return to the terminal.",
    )?;
    Ok(Some(code))
}

fn respond(stream: &mut TcpStream, status: &str, message: &str) -> Result<()> {
    let body = format!("<html><body><p>{}</p></body></html>", message);
    write!(
        stream,
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )?;
    stream.flush()?;
    Ok(())
}
