use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Schedule {id} is at its overlap limit")]
    OverlapLimit { id: String },

    #[error(transparent)]
    Store(#[from] alyx_store::StoreError),

    #[error(transparent)]
    Bus(#[from] alyx_bus::BusError),
}

impl ScheduleError {
    pub fn code(&self) -> &'static str {
        match self {
            ScheduleError::InvalidExpression { .. } => "VALIDATION",
            ScheduleError::UnknownTimezone(_) => "VALIDATION",
            ScheduleError::OverlapLimit { .. } => "CONFLICT",
            ScheduleError::Store(e) => e.code(),
            ScheduleError::Bus(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
