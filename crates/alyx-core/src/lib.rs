pub mod config;
pub mod error;
pub mod supervisor;
pub mod types;

pub use config::AlyxConfig;
pub use error::{CoreError, Result};
pub use supervisor::Supervisor;
