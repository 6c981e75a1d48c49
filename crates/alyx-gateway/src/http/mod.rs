pub mod error;
pub mod executions;
pub mod functions;
pub mod health;
pub mod hooks;
pub mod ingress;
pub mod schedules;
pub mod webhooks_api;
