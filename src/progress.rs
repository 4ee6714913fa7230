//! Progress events emitted by backup and restore runs.
//!
//! The engine only knows [`ProgressSink`]; how events reach a UI (terminal, IPC,
//! desktop window) is the caller's business.

use serde::Serialize;
use std::cell::Cell;
use tracing::warn;

/// Stage a per-file failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Snapshot,
    Hash,
    Upload,
    Delete,
    Download,
    Manifest,
}

/// A discrete progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProgressEvent {
    /// Upload percentage of one file (0-100)
    UploadProgress { path: String, percent: u8 },
    /// One file finished uploading
    UploadDone { path: String },
    /// One remote file was deleted (full mode)
    Delete { path: String },
    /// One file finished downloading (restore)
    Restored { path: String },
    /// A per-file failure; the run continues
    Error {
        path: String,
        stage: Stage,
        message: String,
    },
}

/// Receiver of progress events.
pub trait ProgressSink {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent),
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Sink wrapper counting error events for a run summary.
pub(crate) struct CountingSink<'a> {
    inner: &'a dyn ProgressSink,
    tag: &'static str,
    errors: Cell<usize>,
}

impl<'a> CountingSink<'a> {
    pub(crate) fn new(inner: &'a dyn ProgressSink, tag: &'static str) -> Self {
        Self {
            inner,
            tag,
            errors: Cell::new(0),
        }
    }

    pub(crate) fn errors(&self) -> usize {
        self.errors.get()
    }

    /// Log and emit a per-file failure.
    pub(crate) fn error(&self, path: &str, stage: Stage, err: &anyhow::Error) {
        warn!("[{}] {:?} failed for {}: {:#}", self.tag, stage, path, err);
        self.emit(ProgressEvent::Error {
            path: path.to_string(),
            stage,
            message: format!("{:#}", err),
        });
    }
}

impl ProgressSink for CountingSink<'_> {
    fn emit(&self, event: ProgressEvent) {
        if matches!(event, ProgressEvent::Error { .. }) {
            self.errors.set(self.errors.get() + 1);
        }
        self.inner.emit(event);
    }
}

/// Percent of `done` over `total`, clamped to 0..=100. An unknown total counts as done.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}
