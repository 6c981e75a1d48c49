//! Hook registry: maps `(event_type, source, action)` patterns onto
//! functions, with an in-memory cache over the store.

pub mod error;
pub mod registry;

pub use alyx_store::{Hook, HookConfig, HookMode, HookUpdate, NewHook, OnFailure};
pub use error::{HookError, Result};
pub use registry::HookRegistry;
