//! Utility functions for SaveSync.

pub mod browser;

pub use browser::open_browser;
