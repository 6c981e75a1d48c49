use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The JSON error envelope every non-2xx management response carries.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{what} {id} not found"),
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION", message)
    }

    /// Map a behavioral error code onto its HTTP status.
    pub fn from_code(code: &str, message: String) -> Self {
        let status = match code {
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "VALIDATION" => StatusCode::UNPROCESSABLE_ENTITY,
            "CONFLICT" => StatusCode::CONFLICT,
            "VERIFICATION_FAILED" => StatusCode::UNAUTHORIZED,
            "TRANSIENT_STORE" => StatusCode::SERVICE_UNAVAILABLE,
            "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "request_id": uuid::Uuid::new_v4().to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<alyx_store::StoreError> for ApiError {
    fn from(e: alyx_store::StoreError) -> Self {
        Self::from_code(e.code(), e.to_string())
    }
}

impl From<alyx_hooks::HookError> for ApiError {
    fn from(e: alyx_hooks::HookError) -> Self {
        Self::from_code(e.code(), e.to_string())
    }
}

impl From<alyx_scheduler::ScheduleError> for ApiError {
    fn from(e: alyx_scheduler::ScheduleError) -> Self {
        Self::from_code(e.code(), e.to_string())
    }
}

impl From<alyx_bus::BusError> for ApiError {
    fn from(e: alyx_bus::BusError) -> Self {
        Self::from_code(e.code(), e.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
