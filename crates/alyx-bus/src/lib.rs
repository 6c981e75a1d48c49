//! The durable event bus: publish API, claim-driven dispatcher pool, and
//! retention sweeper.
//!
//! Delivery is at-least-once; handlers must be idempotent. There is no DLQ:
//! persistent failures stay on the event row and in the execution log.

pub mod bus;
mod dispatcher;
pub mod error;
mod sweeper;

pub use bus::{derive_request_id, EventBus, EventCompletion};
pub use error::{BusError, Result};
