//! S3-compatible object storage backend.
//!
//! Built on an OpenDAL operator with a blocking layer. Path-style addressing is
//! used so MinIO, R2 and other self-hosted endpoints work without DNS tricks.

use crate::error::ConfigError;
use crate::progress::percent;
use crate::sync::provider::{join_remote, RemoteEntry, StorageProvider};
use anyhow::{Context, Result};
use opendal::layers::BlockingLayer;
use opendal::services::S3;
use opendal::{BlockingOperator, ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::OnceLock;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Multipart part size and download chunk size.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Settings of the S3 backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Params {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO, R2, ...). AWS when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Key prefix every path lives under
    #[serde(default)]
    pub prefix: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl S3Params {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("bucket", &self.bucket),
            ("access_key_id", &self.access_key_id),
            ("secret_access_key", &self.secret_access_key),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingCredential {
                    provider: "s3",
                    field,
                });
            }
        }
        if let Some(endpoint) = &self.endpoint {
            url::Url::parse(endpoint).map_err(|e| ConfigError::InvalidSetting {
                provider: "s3",
                field: "endpoint",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

fn runtime() -> Result<&'static Runtime> {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Cannot start async runtime for S3")?;
    Ok(RUNTIME.get_or_init(|| rt))
}

/// S3 object storage provider.
pub struct S3Provider {
    operator: BlockingOperator,
    prefix: String,
}

impl S3Provider {
    pub fn new(params: &S3Params) -> Result<Self> {
        let mut builder = S3::default()
            .root("/")
            .bucket(&params.bucket)
            .region(&params.region)
            .access_key_id(&params.access_key_id)
            .secret_access_key(&params.secret_access_key)
            .disable_config_load();
        if let Some(endpoint) = &params.endpoint {
            builder = builder.endpoint(endpoint);
        }

        let _guard = runtime()?.enter();
        let operator = Operator::new(builder)?
            .finish()
            .layer(BlockingLayer::create()?)
            .blocking();

        info!("[S3] Using bucket '{}' ({})", params.bucket, params.region);
        Ok(Self {
            operator,
            prefix: params.prefix.trim_matches('/').to_string(),
        })
    }

    fn key(&self, rel: &str) -> String {
        join_remote(&self.prefix, rel)
    }
}

impl StorageProvider for S3Provider {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn read_text(&self, rel: &str) -> Result<Option<String>> {
        match self.operator.read(&self.key(rel)) {
            Ok(buffer) => {
                let text = String::from_utf8(buffer.to_vec())
                    .with_context(|| format!("{} is not valid UTF-8", rel))?;
                Ok(Some(text))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Cannot read {}", rel)),
        }
    }

    fn write_text(&self, rel: &str, text: &str) -> Result<()> {
        self.operator
            .write(&self.key(rel), text.as_bytes().to_vec())
            .with_context(|| format!("Cannot write {}", rel))?;
        Ok(())
    }

    fn upload_file(
        &self,
        rel: &str,
        local: &Path,
        size_hint: u64,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        on_progress(0);
        let mut file =
            File::open(local).with_context(|| format!("Cannot open {}", local.display()))?;
        let mut writer = self
            .operator
            .writer_with(&self.key(rel))
            .chunk(PART_SIZE)
            .call()
            .with_context(|| format!("Cannot start upload of {}", rel))?;

        let mut buf = vec![0u8; PART_SIZE];
        let mut sent = 0u64;
        loop {
            let n = read_full(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }
            writer
                .write(buf[..n].to_vec())
                .with_context(|| format!("Upload of {} failed", rel))?;
            sent += n as u64;
            on_progress(percent(sent, size_hint).min(99));
        }
        writer
            .close()
            .with_context(|| format!("Cannot complete upload of {}", rel))?;

        on_progress(100);
        debug!("[S3] Uploaded {} ({} bytes)", rel, sent);
        Ok(())
    }

    fn download_file(&self, rel: &str, local: &Path) -> Result<()> {
        let key = self.key(rel);
        let size = self
            .operator
            .stat(&key)
            .with_context(|| format!("Cannot stat {}", rel))?
            .content_length();

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out =
            File::create(local).with_context(|| format!("Cannot create {}", local.display()))?;

        let mut offset = 0u64;
        while offset < size {
            let end = (offset + PART_SIZE as u64).min(size);
            let chunk = self
                .operator
                .read_with(&key)
                .range(offset..end)
                .call()
                .with_context(|| format!("Cannot download {}", rel))?;
            out.write_all(&chunk.to_vec())?;
            offset = end;
        }
        out.flush()?;
        Ok(())
    }

    fn delete_file(&self, rel: &str) -> Result<()> {
        match self.operator.delete(&self.key(rel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Cannot delete {}", rel)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let dir = format!("{}/", self.key(prefix));
        let entries = match self.operator.list_with(&dir).recursive(true).call() {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Cannot list {}", prefix)),
        };

        let root = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        Ok(entries
            .into_iter()
            .filter(|e| e.metadata().is_file())
            .filter_map(|e| {
                let filename = e.path().strip_prefix(&root)?.to_string();
                Some(RemoteEntry::file(filename, e.metadata().content_length()))
            })
            .collect())
    }
}

/// Fill `buf` as far as the reader allows; returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
