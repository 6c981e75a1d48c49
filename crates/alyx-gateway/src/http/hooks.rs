use std::sync::Arc;

use alyx_core::types::EventType;
use alyx_hooks::{Hook, HookConfig, HookMode, HookUpdate, NewHook};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::app::AppState;
use crate::http::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateHookRequest {
    pub name: String,
    pub function_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub event_source: Option<String>,
    #[serde(default)]
    pub event_action: Option<String>,
    #[serde(default)]
    pub mode: Option<HookMode>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub config: Option<HookConfig>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// GET /api/hooks
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Hook>>> {
    Ok(Json(state.registry.list()?))
}

/// POST /api/hooks
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateHookRequest>,
) -> ApiResult<(StatusCode, Json<Hook>)> {
    let mut new = NewHook::new(body.name, body.function_id, body.event_type);
    if let Some(source) = body.event_source {
        new.event_source = source;
    }
    if let Some(action) = body.event_action {
        new.event_action = action;
    }
    if let Some(mode) = body.mode {
        new.mode = mode;
    }
    if let Some(priority) = body.priority {
        new.priority = priority;
    }
    if let Some(config) = body.config {
        new.config = config;
    }
    if let Some(enabled) = body.enabled {
        new.enabled = enabled;
    }
    let hook = state.registry.register(new)?;
    Ok((StatusCode::CREATED, Json(hook)))
}

/// GET /api/hooks/{id}
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Hook>> {
    Ok(Json(state.registry.get(&id)?))
}

/// PATCH /api/hooks/{id}
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<HookUpdate>,
) -> ApiResult<Json<Hook>> {
    Ok(Json(state.registry.update(&id, body)?))
}

/// DELETE /api/hooks/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.registry.unregister(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("hook", &id))
    }
}

/// GET /api/functions/{name}/hooks
pub async fn list_for_function(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<Hook>>> {
    Ok(Json(state.registry.list_by_function(&name)?))
}
