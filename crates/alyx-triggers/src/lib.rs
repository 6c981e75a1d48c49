//! Source triggers: adapters that turn record-store mutations and identity
//! lifecycle moments into bus events, running sync hooks inline so a
//! binding can reject the operation that caused them.

pub mod error;
pub mod identity;
pub mod record;
mod sync;
pub mod triggers;

pub use error::{Result, TriggerError};
pub use identity::IdentityEventKind;
pub use record::{MutationOrigin, RecordAction, RecordMutation};
pub use triggers::{PreparedPublish, SourceTriggers};
