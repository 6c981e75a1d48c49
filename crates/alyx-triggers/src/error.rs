use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
    /// A sync hook with `on_failure=reject` failed; the source operation
    /// must be aborted and this error surfaced to its caller verbatim.
    #[error("{message}")]
    Rejected { code: String, message: String },

    /// Shutdown interrupted an in-flight sync hook; the outer mutation
    /// aborts with a cancellation error.
    #[error("Sync hook cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] alyx_store::StoreError),

    #[error(transparent)]
    Bus(#[from] alyx_bus::BusError),
}

impl TriggerError {
    pub fn code(&self) -> &str {
        match self {
            TriggerError::Rejected { code, .. } => code,
            TriggerError::Cancelled => "CANCELLED",
            TriggerError::Store(e) => e.code(),
            TriggerError::Bus(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TriggerError>;
