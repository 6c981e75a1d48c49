use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Store(#[from] alyx_store::StoreError),

    #[error(transparent)]
    Hooks(#[from] alyx_hooks::HookError),

    #[error("Invalid event: {0}")]
    Invalid(String),
}

impl BusError {
    pub fn code(&self) -> &'static str {
        match self {
            BusError::Store(e) => e.code(),
            BusError::Hooks(e) => e.code(),
            BusError::Invalid(_) => "VALIDATION",
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
