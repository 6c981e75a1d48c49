//! Time-based event publisher: cron, interval and one-shot schedules with
//! overlap limiting and failure retries.

pub mod cadence;
pub mod engine;
pub mod error;

pub use alyx_store::{NewSchedule, Schedule, ScheduleConfig, ScheduleKind, ScheduleUpdate};
pub use engine::Scheduler;
pub use error::{Result, ScheduleError};
