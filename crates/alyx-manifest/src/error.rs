use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Invalid manifest for {function}: {reason}")]
    Validation { function: String, reason: String },

    #[error("Functions directory {0} is not readable")]
    RootUnreadable(String),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] alyx_store::StoreError),

    #[error(transparent)]
    Hooks(#[from] alyx_hooks::HookError),

    #[error(transparent)]
    Bus(#[from] alyx_bus::BusError),
}

impl ManifestError {
    pub fn code(&self) -> &'static str {
        match self {
            ManifestError::Validation { .. } => "VALIDATION",
            ManifestError::RootUnreadable(_) => "VALIDATION",
            ManifestError::Watch(_) => "WATCH_ERROR",
            ManifestError::Io(_) => "IO_ERROR",
            ManifestError::Store(e) => e.code(),
            ManifestError::Hooks(e) => e.code(),
            ManifestError::Bus(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ManifestError>;
