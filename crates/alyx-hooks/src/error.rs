use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error(transparent)]
    Store(#[from] alyx_store::StoreError),

    #[error("Invalid hook: {0}")]
    Invalid(String),
}

impl HookError {
    pub fn code(&self) -> &'static str {
        match self {
            HookError::Store(e) => e.code(),
            HookError::Invalid(_) => "VALIDATION",
        }
    }
}

pub type Result<T> = std::result::Result<T, HookError>;
