//! Dropbox backend (API v2).
//!
//! Every path lives under an app folder root. Tokens are kept behind a mutex so
//! a 401 can refresh the access token through `&self` and retry once.

use crate::error::ConfigError;
use crate::progress::percent;
use crate::sync::oauth::{PkceFlow, DROPBOX_AUTHORIZE_URL, DROPBOX_TOKEN_URL};
use crate::sync::provider::{join_remote, RemoteEntry, StorageProvider};
use crate::sync::ProviderParams;
use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upload session chunk size; smaller files use a single upload call.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

const API_URL: &str = "https://api.dropboxapi.com";
const CONTENT_URL: &str = "https://content.dropboxapi.com";

/// Settings and tokens of the Dropbox backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropboxParams {
    /// App key (public client id, no secret with PKCE)
    pub app_key: String,
    #[serde(default)]
    pub access_token: String,
    pub refresh_token: String,
    /// Folder every path lives under
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_content_url")]
    pub content_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

fn default_root() -> String {
    "SaveSync".to_string()
}

fn default_api_url() -> String {
    API_URL.to_string()
}

fn default_content_url() -> String {
    CONTENT_URL.to_string()
}

fn default_token_url() -> String {
    DROPBOX_TOKEN_URL.to_string()
}

impl DropboxParams {
    /// Params for freshly obtained tokens against the real service.
    pub fn new(app_key: &str, access_token: &str, refresh_token: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            root: default_root(),
            api_url: default_api_url(),
            content_url: default_content_url(),
            token_url: default_token_url(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential {
                provider: "dropbox",
                field: "app_key",
            });
        }
        if self.refresh_token.trim().is_empty() {
            return Err(ConfigError::MissingCredential {
                provider: "dropbox",
                field: "refresh_token",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<ListEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    #[serde(rename = ".tag")]
    tag: String,
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

/// Dropbox storage provider.
pub struct DropboxProvider {
    client: Client,
    flow: PkceFlow,
    params: Mutex<DropboxParams>,
    refreshed: Mutex<bool>,
}

impl DropboxProvider {
    pub fn new(params: &DropboxParams) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Cannot build HTTP client")?;
        let flow =
            PkceFlow::with_endpoints(&params.app_key, DROPBOX_AUTHORIZE_URL, &params.token_url);

        info!("[Dropbox] Using app folder '/{}'", params.root.trim_matches('/'));
        Ok(Self {
            client,
            flow,
            params: Mutex::new(params.clone()),
            refreshed: Mutex::new(false),
        })
    }

    fn snapshot(&self) -> Result<DropboxParams> {
        self.params
            .lock()
            .map(|p| p.clone())
            .map_err(|_| anyhow::anyhow!("Dropbox token lock poisoned"))
    }

    /// Absolute Dropbox path of `rel`.
    fn path(&self, root: &str, rel: &str) -> String {
        format!("/{}", join_remote(root, rel))
    }

    fn refresh_access_token(&self) -> Result<String> {
        let refresh_token = self.snapshot()?.refresh_token;
        info!("[Dropbox] Access token expired, refreshing");
        let access_token = self.flow.refresh(&refresh_token)?;

        let mut params = self
            .params
            .lock()
            .map_err(|_| anyhow::anyhow!("Dropbox token lock poisoned"))?;
        params.access_token = access_token.clone();
        if let Ok(mut flag) = self.refreshed.lock() {
            *flag = true;
        }
        Ok(access_token)
    }

    /// Send an authenticated request; on 401 refresh once and resend.
    fn send_authed<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&DropboxParams, &str) -> RequestBuilder,
    {
        let params = self.snapshot()?;
        let response = build(&params, &params.access_token)
            .send()
            .context("Dropbox request failed")?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let token = self.refresh_access_token()?;
        build(&params, &token)
            .send()
            .context("Dropbox request failed after token refresh")
    }

    fn rpc(&self, endpoint: &str, body: Value) -> Result<Response> {
        self.send_authed(|p, token| {
            self.client
                .post(format!("{}/2/{}", p.api_url.trim_end_matches('/'), endpoint))
                .bearer_auth(token)
                .json(&body)
        })
    }

    fn content(&self, endpoint: &str, arg: &Value, body: Option<Vec<u8>>) -> Result<Response> {
        let header = api_arg(arg);
        self.send_authed(|p, token| {
            let request = self
                .client
                .post(format!(
                    "{}/2/{}",
                    p.content_url.trim_end_matches('/'),
                    endpoint
                ))
                .bearer_auth(token)
                .header("Dropbox-API-Arg", header.as_str());
            match &body {
                Some(bytes) => request
                    .header("Content-Type", "application/octet-stream")
                    .body(bytes.clone()),
                None => request,
            }
        })
    }

    fn upload_bytes(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let arg = json!({"path": path, "mode": "overwrite", "mute": true});
        let response = self.content("files/upload", &arg, Some(bytes))?;
        expect_success(response, "upload")?;
        Ok(())
    }

    fn upload_session(
        &self,
        path: &str,
        file: &mut File,
        size_hint: u64,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        let mut chunk = read_chunk(file)?;
        let mut offset = chunk.len() as u64;

        let response = self.content(
            "files/upload_session/start",
            &json!({"close": false}),
            Some(chunk),
        )?;
        let session: SessionStart = expect_success(response, "upload_session/start")?
            .json()
            .context("Cannot parse upload session")?;
        on_progress(percent(offset, size_hint).min(99));

        loop {
            chunk = read_chunk(file)?;
            let cursor = json!({"session_id": session.session_id, "offset": offset});

            if chunk.len() < CHUNK_SIZE {
                let arg = json!({
                    "cursor": cursor,
                    "commit": {"path": path, "mode": "overwrite", "mute": true}
                });
                let response = self.content("files/upload_session/finish", &arg, Some(chunk))?;
                expect_success(response, "upload_session/finish")?;
                return Ok(());
            }

            let len = chunk.len() as u64;
            let arg = json!({"cursor": cursor, "close": false});
            let response = self.content("files/upload_session/append_v2", &arg, Some(chunk))?;
            expect_success(response, "upload_session/append_v2")?;
            offset += len;
            on_progress(percent(offset, size_hint).min(99));
        }
    }

    /// Download into a response, `None` on path/not_found.
    fn download(&self, rel: &str) -> Result<Option<Response>> {
        let root = self.snapshot()?.root;
        let response = self.content(
            "files/download",
            &json!({"path": self.path(&root, rel)}),
            None,
        )?;
        match response.status() {
            s if s.is_success() => Ok(Some(response)),
            StatusCode::CONFLICT => {
                let body = response.text().unwrap_or_default();
                if body.contains("not_found") {
                    Ok(None)
                } else {
                    bail!("Dropbox download of {} failed: {}", rel, body)
                }
            }
            s => bail!(
                "Dropbox download of {} failed with {}: {}",
                rel,
                s,
                response.text().unwrap_or_default()
            ),
        }
    }
}

/// Turn a non-2xx response into an error with status and body.
fn expect_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    bail!(
        "Dropbox {} failed with {}: {}",
        what,
        status,
        response.text().unwrap_or_default()
    )
}

/// Up to one chunk from the file.
fn read_chunk(file: &mut File) -> Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(CHUNK_SIZE);
    file.by_ref()
        .take(CHUNK_SIZE as u64)
        .read_to_end(&mut chunk)?;
    Ok(chunk)
}

/// `Dropbox-API-Arg` header value: JSON with non-ASCII escaped as `\uXXXX`.
pub fn api_arg(value: &Value) -> String {
    let json = value.to_string();
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Strip `/<root>/` from a Dropbox display path, ignoring ASCII case.
fn strip_root(path_display: &str, root: &str) -> Option<String> {
    let prefix = format!("/{}/", root.trim_matches('/'));
    let head = path_display.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(&prefix) {
        return None;
    }
    Some(path_display[prefix.len()..].to_string())
}

impl StorageProvider for DropboxProvider {
    fn name(&self) -> &'static str {
        "dropbox"
    }

    fn read_text(&self, rel: &str) -> Result<Option<String>> {
        match self.download(rel)? {
            Some(response) => Ok(Some(
                response
                    .text()
                    .with_context(|| format!("Cannot read body of {}", rel))?,
            )),
            None => Ok(None),
        }
    }

    fn write_text(&self, rel: &str, text: &str) -> Result<()> {
        let root = self.snapshot()?.root;
        self.upload_bytes(&self.path(&root, rel), text.as_bytes().to_vec())
    }

    fn upload_file(
        &self,
        rel: &str,
        local: &Path,
        size_hint: u64,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        on_progress(0);
        let root = self.snapshot()?.root;
        let path = self.path(&root, rel);
        let mut file =
            File::open(local).with_context(|| format!("Cannot open {}", local.display()))?;
        let size = file.metadata()?.len();

        if size <= CHUNK_SIZE as u64 {
            self.upload_bytes(&path, read_chunk(&mut file)?)?;
        } else {
            debug!("[Dropbox] Using upload session for {} ({} bytes)", rel, size);
            self.upload_session(&path, &mut file, size_hint.max(size), on_progress)?;
        }

        on_progress(100);
        Ok(())
    }

    fn download_file(&self, rel: &str, local: &Path) -> Result<()> {
        let Some(mut response) = self.download(rel)? else {
            bail!("{} does not exist in Dropbox", rel);
        };
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out =
            File::create(local).with_context(|| format!("Cannot create {}", local.display()))?;
        response
            .copy_to(&mut out)
            .with_context(|| format!("Cannot download {}", rel))?;
        Ok(())
    }

    fn delete_file(&self, rel: &str) -> Result<()> {
        let root = self.snapshot()?.root;
        let response = self.rpc("files/delete_v2", json!({"path": self.path(&root, rel)}))?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                let body = response.text().unwrap_or_default();
                if body.contains("not_found") {
                    Ok(())
                } else {
                    bail!("Dropbox delete of {} failed: {}", rel, body)
                }
            }
            s => bail!(
                "Dropbox delete of {} failed with {}: {}",
                rel,
                s,
                response.text().unwrap_or_default()
            ),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let root = self.snapshot()?.root;
        let response = self.rpc(
            "files/list_folder",
            json!({"path": self.path(&root, prefix), "recursive": true}),
        )?;

        if response.status() == StatusCode::CONFLICT {
            let body = response.text().unwrap_or_default();
            if body.contains("not_found") {
                return Ok(Vec::new());
            }
            bail!("Dropbox list of {} failed: {}", prefix, body);
        }

        let mut page: ListFolderResponse = expect_success(response, "list_folder")?
            .json()
            .context("Cannot parse list_folder response")?;
        let mut entries = Vec::new();

        loop {
            for entry in page.entries.drain(..) {
                if entry.tag != "file" {
                    continue;
                }
                match entry.path_display.as_deref().and_then(|p| strip_root(p, &root)) {
                    Some(filename) => entries.push(RemoteEntry::file(filename, entry.size)),
                    None => warn!("[Dropbox] Ignoring entry outside root: {:?}", entry.path_display),
                }
            }
            if !page.has_more {
                break;
            }
            let response = self.rpc("files/list_folder/continue", json!({"cursor": page.cursor}))?;
            page = expect_success(response, "list_folder/continue")?
                .json()
                .context("Cannot parse list_folder/continue response")?;
        }

        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }

    fn refreshed_params(&self) -> Option<ProviderParams> {
        let refreshed = self.refreshed.lock().map(|f| *f).unwrap_or(false);
        if !refreshed {
            return None;
        }
        self.snapshot().ok().map(ProviderParams::Dropbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_arg_escapes_non_ascii() {
        let arg = api_arg(&json!({"path": "/SaveSync/données/🎮.rms"}));
        assert_eq!(
            arg,
            r#"{"path":"/SaveSync/donn\u00e9es/\ud83c\udfae.rms"}"#
        );
    }

    #[test]
    fn test_strip_root_ignores_case() {
        assert_eq!(
            strip_root("/savesync/data/config.yml", "SaveSync"),
            Some("data/config.yml".to_string())
        );
        assert_eq!(strip_root("/Other/data/config.yml", "SaveSync"), None);
    }

    #[test]
    fn test_validate_requires_refresh_token() {
        let mut params = DropboxParams::new("key", "", "refresh");
        assert!(params.validate().is_ok());
        params.refresh_token.clear();
        assert_eq!(
            params.validate(),
            Err(ConfigError::MissingCredential {
                provider: "dropbox",
                field: "refresh_token"
            })
        );
    }

    #[test]
    fn test_params_defaults_from_json() -> Result<()> {
        let params: DropboxParams =
            serde_json::from_str(r#"{"app_key":"k","refresh_token":"r"}"#)?;
        assert_eq!(params.root, "SaveSync");
        assert_eq!(params.api_url, API_URL);
        assert!(params.access_token.is_empty());
        Ok(())
    }
}
