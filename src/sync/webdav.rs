//! WebDAV backend (Nextcloud, ownCloud, Apache mod_dav, ...).
//!
//! - Directory chains are created with MKCOL before every write
//! - PUT and MKCOL are retried on "busy" statuses with linear backoff
//! - Listing uses a single `PROPFIND Depth: infinity`

use crate::error::ConfigError;
use crate::sync::provider::{join_remote, RemoteEntry, StorageProvider};
use crate::sync::retry::{retry_on_status, RetryPolicy};
use anyhow::{bail, Context, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Characters kept as-is in a path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
  </d:prop>
</d:propfind>"#;

/// Settings of the WebDAV backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebDavParams {
    /// Server URL, e.g. `https://cloud.example.com/remote.php/dav/files/alice`
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Folder under the server URL that holds the backup
    #[serde(default = "default_root")]
    pub root: String,
}

fn default_root() -> String {
    "SaveSync".to_string()
}

impl WebDavParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingCredential {
                provider: "webdav",
                field: "url",
            });
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::MissingCredential {
                provider: "webdav",
                field: "username",
            });
        }
        let parsed = url::Url::parse(&self.url).map_err(|e| ConfigError::InvalidSetting {
            provider: "webdav",
            field: "url",
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidSetting {
                provider: "webdav",
                field: "url",
                reason: format!("unsupported scheme `{}`", parsed.scheme()),
            });
        }
        Ok(())
    }
}

/// WebDAV storage provider.
pub struct WebDavProvider {
    client: Client,
    base_url: String,
    /// Decoded path of `base_url`, used to relativize PROPFIND hrefs
    base_path: String,
    root: String,
    username: String,
    password: String,
    retry: RetryPolicy,
}

impl WebDavProvider {
    pub fn new(params: &WebDavParams) -> Result<Self> {
        let parsed = url::Url::parse(&params.url).context("Invalid WebDAV url")?;
        let base_path = percent_decode_str(parsed.path().trim_end_matches('/'))
            .decode_utf8_lossy()
            .to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Cannot build HTTP client")?;

        info!("[WebDAV] Using {} (root '{}')", params.url, params.root);
        Ok(Self {
            client,
            base_url: params.url.trim_end_matches('/').to_string(),
            base_path,
            root: params.root.trim_matches('/').to_string(),
            username: params.username.clone(),
            password: params.password.clone(),
            retry: RetryPolicy::default(),
        })
    }

    /// Override the linear backoff step (tests use a tiny one).
    pub fn with_retry_step(mut self, step: Duration) -> Self {
        self.retry.step = step;
        self
    }

    fn url_for(&self, remote_path: &str) -> String {
        let mut url = self.base_url.clone();
        for seg in remote_path.split('/').filter(|s| !s.is_empty()) {
            url.push('/');
            url.push_str(&utf8_percent_encode(seg, SEGMENT).to_string());
        }
        if remote_path.ends_with('/') {
            url.push('/');
        }
        url
    }

    fn request(&self, method: Method, remote_path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url_for(remote_path))
            .basic_auth(&self.username, Some(&self.password))
    }

    /// MKCOL the root and every parent segment of `rel`.
    fn ensure_dirs(&self, rel: &str) -> Result<()> {
        let full = join_remote(&self.root, rel);
        let segments: Vec<&str> = full.split('/').filter(|s| !s.is_empty()).collect();
        let Some((_, parents)) = segments.split_last() else {
            return Ok(());
        };

        let mut current = String::new();
        for seg in parents {
            current = join_remote(&current, seg);
            let mkcol = || -> Result<Response> {
                Ok(self.request(Method::from_bytes(b"MKCOL")?, &current).send()?)
            };
            let response = retry_on_status(self.retry, "[WebDAV] MKCOL", mkcol)?;
            let status = response.status();
            if !(status.is_success()
                || status == StatusCode::METHOD_NOT_ALLOWED
                || status == StatusCode::PRECONDITION_FAILED)
            {
                bail!(
                    "MKCOL {} failed with {}: {}",
                    current,
                    status,
                    response.text().unwrap_or_default()
                );
            }
        }
        Ok(())
    }

    fn put<F>(&self, rel: &str, body: F) -> Result<()>
    where
        F: Fn() -> Result<Body>,
    {
        let path = join_remote(&self.root, rel);
        let response = retry_on_status(self.retry, "[WebDAV] PUT", || {
            self.ensure_dirs(rel)?;
            Ok(self.request(Method::PUT, &path).body(body()?).send()?)
        })?;

        let status = response.status();
        if !status.is_success() {
            bail!(
                "PUT {} failed with {}: {}",
                rel,
                status,
                response.text().unwrap_or_default()
            );
        }
        Ok(())
    }

    fn get(&self, rel: &str) -> Result<Option<Response>> {
        let response = self
            .request(Method::GET, &join_remote(&self.root, rel))
            .send()
            .with_context(|| format!("GET {} failed", rel))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response)),
            s => bail!(
                "GET {} failed with {}: {}",
                rel,
                s,
                response.text().unwrap_or_default()
            ),
        }
    }

    /// Turn an href into a path relative to the backup root.
    fn relative_href(&self, href: &str) -> Option<String> {
        let path = if href.starts_with("http://") || href.starts_with("https://") {
            url::Url::parse(href).ok()?.path().to_string()
        } else {
            href.to_string()
        };
        let decoded = percent_decode_str(&path).decode_utf8_lossy().to_string();

        let root_path = format!("{}/{}", self.base_path, self.root);
        let rest = decoded.strip_prefix(root_path.trim_end_matches('/'))?;
        if !(rest.is_empty() || rest.starts_with('/')) {
            return None;
        }
        let rest = rest.trim_matches('/');
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// One `<response>` of a multistatus document.
#[derive(Debug, Default)]
struct DavResponse {
    href: String,
    is_collection: bool,
    size: u64,
}

/// Parse a PROPFIND multistatus body. Missing optional properties default.
fn parse_multistatus(xml: &str) -> Result<Vec<DavResponse>> {
    #[derive(PartialEq)]
    enum Field {
        None,
        Href,
        Length,
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = Vec::new();
    let mut current: Option<DavResponse> = None;
    let mut field = Field::None;

    loop {
        match reader.read_event().context("Malformed PROPFIND response")? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"response" => current = Some(DavResponse::default()),
                b"href" => field = Field::Href,
                b"getcontentlength" => field = Field::Length,
                b"collection" => {
                    if let Some(r) = current.as_mut() {
                        r.is_collection = true;
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(r) = current.as_mut() {
                        r.is_collection = true;
                    }
                }
            }
            Event::Text(t) => {
                let text = t.unescape().context("Bad text in PROPFIND response")?;
                if let Some(r) = current.as_mut() {
                    match field {
                        Field::Href => r.href = text.trim().to_string(),
                        Field::Length => r.size = text.trim().parse().unwrap_or(0),
                        Field::None => {}
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(r) = current.take() {
                        out.push(r);
                    }
                }
                b"href" | b"getcontentlength" => field = Field::None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(out)
}

impl StorageProvider for WebDavProvider {
    fn name(&self) -> &'static str {
        "webdav"
    }

    fn read_text(&self, rel: &str) -> Result<Option<String>> {
        match self.get(rel)? {
            Some(response) => Ok(Some(
                response
                    .text()
                    .with_context(|| format!("Cannot read body of {}", rel))?,
            )),
            None => Ok(None),
        }
    }

    fn write_text(&self, rel: &str, text: &str) -> Result<()> {
        let bytes = text.as_bytes().to_vec();
        self.put(rel, || Ok(Body::from(bytes.clone())))
    }

    fn upload_file(
        &self,
        rel: &str,
        local: &Path,
        _size_hint: u64,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        on_progress(0);
        // A streamed body is consumed by the first attempt; reopen the file each time.
        self.put(rel, || {
            let file = File::open(local)
                .with_context(|| format!("Cannot open {}", local.display()))?;
            let len = file.metadata()?.len();
            Ok(Body::sized(file, len))
        })?;
        on_progress(100);
        debug!("[WebDAV] Uploaded {}", rel);
        Ok(())
    }

    fn download_file(&self, rel: &str, local: &Path) -> Result<()> {
        let Some(mut response) = self.get(rel)? else {
            bail!("{} does not exist on the server", rel);
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
        let response = self
            .request(Method::DELETE, &join_remote(&self.root, rel))
            .send()
            .with_context(|| format!("DELETE {} failed", rel))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => bail!(
                "DELETE {} failed with {}: {}",
                rel,
                s,
                response.text().unwrap_or_default()
            ),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let dir = join_remote(&self.root, prefix);
        let response = self
            .request(Method::from_bytes(b"PROPFIND")?, &format!("{}/", dir))
            .header("Depth", "infinity")
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .with_context(|| format!("PROPFIND {} failed", dir))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            bail!(
                "PROPFIND {} failed with {}: {}",
                dir,
                status,
                response.text().unwrap_or_default()
            );
        }

        let body = response.text().context("Cannot read PROPFIND body")?;
        let mut entries: Vec<RemoteEntry> = parse_multistatus(&body)?
            .into_iter()
            .filter(|r| !r.is_collection && !r.href.ends_with('/'))
            .filter_map(|r| Some(RemoteEntry::file(self.relative_href(&r.href)?, r.size)))
            .collect();
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> WebDavProvider {
        WebDavProvider::new(&WebDavParams {
            url: "https://dav.example.com/remote.php/dav/files/alice/".to_string(),
            username: "alice".to_string(),
            password: "pw".to_string(),
            root: "Save Sync".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_url_encodes_segments() {
        let p = provider();
        assert_eq!(
            p.url_for("Save Sync/data/config.yml"),
            "https://dav.example.com/remote.php/dav/files/alice/Save%20Sync/data/config.yml"
        );
    }

    #[test]
    fn test_relative_href_variants() {
        let p = provider();
        assert_eq!(
            p.relative_href("/remote.php/dav/files/alice/Save%20Sync/data/config.yml"),
            Some("data/config.yml".to_string())
        );
        assert_eq!(
            p.relative_href(
                "https://dav.example.com/remote.php/dav/files/alice/Save%20Sync/index.tsv"
            ),
            Some("index.tsv".to_string())
        );
        assert_eq!(p.relative_href("/remote.php/dav/files/alice/Save%20Sync/"), None);
        assert_eq!(p.relative_href("/elsewhere/file"), None);
    }

    #[test]
    fn test_parse_multistatus_tolerates_missing_props() -> Result<()> {
        let xml = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/SaveSync/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/SaveSync/index.tsv</d:href>
    <d:propstat><d:prop><d:resourcetype/><d:getcontentlength>42</d:getcontentlength></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/SaveSync/data/keybindings.json</d:href>
    <d:propstat><d:prop><d:resourcetype/></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

        let parsed = parse_multistatus(xml)?;
        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].is_collection);
        assert_eq!(parsed[1].size, 42);
        assert!(!parsed[2].is_collection);
        assert_eq!(parsed[2].size, 0);
        Ok(())
    }

    #[test]
    fn test_validate() {
        let mut params = WebDavParams {
            url: "ftp://example.com".to_string(),
            username: "u".to_string(),
            password: String::new(),
            root: default_root(),
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::InvalidSetting { field: "url", .. })
        ));
        params.url = "https://example.com/dav".to_string();
        assert!(params.validate().is_ok());
        params.username.clear();
        assert_eq!(
            params.validate(),
            Err(ConfigError::MissingCredential {
                provider: "webdav",
                field: "username"
            })
        );
    }
}
