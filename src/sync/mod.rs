//! Sync module - Remote storage backends for backups.
//!
//! This module contains:
//! - StorageProvider trait for abstraction
//! - S3-compatible object storage (OpenDAL)
//! - Dropbox (PKCE OAuth, token refresh)
//! - WebDAV (auto directory creation, retry)
//! - Local provider (USB drive, NAS mount)
//! - Credential store (`credentials.json`)

pub mod credentials;
pub mod dropbox;
pub mod local;
pub mod oauth;
pub mod provider;
pub mod retry;
pub mod s3;
pub mod webdav;

pub use credentials::CredentialStore;
pub use dropbox::{DropboxParams, DropboxProvider};
pub use local::{LocalParams, LocalProvider};
pub use provider::{RemoteEntry, StorageProvider};
pub use s3::{S3Params, S3Provider};
pub use webdav::{WebDavParams, WebDavProvider};

use crate::error::ConfigError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Registered backend names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    S3,
    Dropbox,
    WebDav,
    Local,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::S3,
        ProviderKind::Dropbox,
        ProviderKind::WebDav,
        ProviderKind::Local,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Dropbox => "dropbox",
            Self::WebDav => "webdav",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.name() == key)
            .ok_or_else(|| ConfigError::UnknownProvider(s.to_string()))
    }
}

/// Backend-specific settings and credentials, one variant per backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderParams {
    S3(S3Params),
    Dropbox(DropboxParams),
    #[serde(rename = "webdav")]
    WebDav(WebDavParams),
    Local(LocalParams),
}

impl ProviderParams {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::S3(_) => ProviderKind::S3,
            Self::Dropbox(_) => ProviderKind::Dropbox,
            Self::WebDav(_) => ProviderKind::WebDav,
            Self::Local(_) => ProviderKind::Local,
        }
    }

    /// Check required settings without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::S3(p) => p.validate(),
            Self::Dropbox(p) => p.validate(),
            Self::WebDav(p) => p.validate(),
            Self::Local(p) => p.validate(),
        }
    }
}

/// Build the provider for `params`. Configuration errors surface as [`ConfigError`]
/// before any I/O happens.
pub fn build_provider(params: &ProviderParams) -> Result<Box<dyn StorageProvider>> {
    params.validate()?;
    debug!("[Sync] Building {} provider", params.kind());

    Ok(match params {
        ProviderParams::S3(p) => Box::new(S3Provider::new(p)?),
        ProviderParams::Dropbox(p) => Box::new(DropboxProvider::new(p)?),
        ProviderParams::WebDav(p) => Box::new(WebDavProvider::new(p)?),
        ProviderParams::Local(p) => Box::new(LocalProvider::new(&p.path)),
    })
}
