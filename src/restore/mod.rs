//! Restore module - Conflict planning and best-effort download of a backup.
//!
//! - [`plan_restore`] compares local and remote state without touching anything
//! - [`execute_restore`] downloads the selected groups back into place

mod executor;
mod ignore;
mod planner;

pub use executor::{execute_restore, RestoreOptions, RestoreSummary};
pub use ignore::PathMatcher;
pub use planner::{plan_restore, ConflictDetail, FileState, RestoreDecision, RestorePlan};

/// Host hook asking the game library to rescan after the database changed.
///
/// Fire-and-forget: implementations must return immediately.
pub trait LibraryRescan {
    fn request_rescan(&self);
}

impl<F> LibraryRescan for F
where
    F: Fn(),
{
    fn request_rescan(&self) {
        self()
    }
}
