//! Single-writer relational store.
//!
//! All five persisted entities (events, hooks, schedules, webhook endpoints,
//! execution logs) live in one SQLite database behind one connection. Every
//! other crate goes through [`Store`]; nothing else holds a connection.

mod db;
pub mod error;
pub mod events;
pub mod executions;
pub mod hooks;
pub mod schedules;
mod store;
pub mod webhooks;

pub use error::{Result, StoreError};
pub use events::{Event, EventDraft, EventMeta, EventOutcome, EventStatus, Fingerprint};
pub use executions::{
    ExecutionFilter, ExecutionRecord, ExecutionStatus, NewExecution, redact,
};
pub use hooks::{Hook, HookConfig, HookMode, HookUpdate, NewHook, OnFailure};
pub use schedules::{NewSchedule, Schedule, ScheduleConfig, ScheduleKind, ScheduleUpdate};
pub use store::Store;
pub use webhooks::{
    NewWebhook, SignatureAlgorithm, Verification, WebhookEndpoint, WebhookUpdate,
};

/// Rows created by the manifest loader carry this owner tag; the loader only
/// ever touches its own rows, never API-created ones.
pub const MANAGED_BY_MANIFEST: &str = "manifest";
pub const MANAGED_BY_API: &str = "api";
