//! Per-function manifest loading.
//!
//! Each function is a directory under the functions root carrying an
//! `alyx.toml` that declares its runtime plus the hooks, schedules and
//! webhook routes it owns. The loader diffs the discovered set against the
//! live one and applies upserts/removals; never in-place mutation of a
//! running dispatcher.

pub mod error;
pub mod loader;
pub mod types;
pub mod watch;

pub use error::{ManifestError, Result};
pub use loader::{LoadSummary, ManifestLoader};
pub use types::Manifest;
pub use watch::start_watcher;
