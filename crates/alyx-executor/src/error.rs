use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Subprocess I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Executor is shutting down")]
    ShuttingDown,

    #[error("Failed to serialize invocation request: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ExecutorError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::UnknownFunction(_) => "VALIDATION",
            ExecutorError::Spawn { .. } => "RUNTIME_ERROR",
            ExecutorError::Io(_) => "RUNTIME_ERROR",
            ExecutorError::ShuttingDown => "SHUTTING_DOWN",
            ExecutorError::Serialize(_) => "PROTOCOL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
