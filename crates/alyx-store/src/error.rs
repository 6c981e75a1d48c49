use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database busy after {attempts} attempts: {source}")]
    Busy {
        attempts: u32,
        source: rusqlite::Error,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {value}")]
    Conflict { kind: &'static str, value: String },

    #[error("Invalid stored {field}: {reason}")]
    Corrupt { field: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Behavioral error kind for the wire envelope.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Busy { .. } => "TRANSIENT_STORE",
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::Conflict { .. } => "CONFLICT",
            StoreError::Corrupt { .. } => "STORE_CORRUPT",
            StoreError::Database(_) => "STORE_ERROR",
            StoreError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
