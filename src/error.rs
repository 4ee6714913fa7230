//! Typed errors that callers are expected to match on.
//!
//! Everything else in the crate propagates `anyhow::Error` with context.

use thiserror::Error;

/// Configuration errors. Raised before any I/O is attempted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Provider name does not match any registered backend
    #[error("unknown storage provider `{0}` (expected one of: s3, dropbox, webdav, local)")]
    UnknownProvider(String),

    /// A credential or setting the backend cannot work without
    #[error("provider `{provider}` is missing required setting `{field}`")]
    MissingCredential {
        provider: &'static str,
        field: &'static str,
    },

    /// Backend setting that is present but unusable
    #[error("provider `{provider}` has an invalid `{field}`: {reason}")]
    InvalidSetting {
        provider: &'static str,
        field: &'static str,
        reason: String,
    },

    /// Group key not in the group table
    #[error("unknown backup group `{0}` (expected one of: config, database, rms, emuConfig)")]
    UnknownGroup(String),
}
