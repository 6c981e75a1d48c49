use std::sync::Arc;

use alyx_store::{NewWebhook, Verification, WebhookEndpoint, WebhookUpdate};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::app::AppState;
use crate::http::error::{ApiError, ApiResult};

/// Ingress paths that would shadow the management surface.
const RESERVED_PATH_PREFIXES: &[&str] = &["api", "health", "webhooks"];

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub path: String,
    #[serde(default)]
    pub function_id: Option<String>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub verification: Option<Verification>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

fn validate_path(path: &str) -> Result<String, ApiError> {
    let normalized = path.trim().trim_matches('/').to_string();
    if normalized.is_empty() {
        return Err(ApiError::validation("webhook path must not be empty"));
    }
    let head = normalized.split('/').next().unwrap_or_default();
    if RESERVED_PATH_PREFIXES.contains(&head) {
        return Err(ApiError::validation(format!(
            "webhook path '{normalized}' collides with a reserved route"
        )));
    }
    Ok(normalized)
}

/// GET /api/webhooks
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<WebhookEndpoint>>> {
    Ok(Json(state.store.list_webhooks()?))
}

/// POST /api/webhooks
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateWebhookRequest>,
) -> ApiResult<(StatusCode, Json<WebhookEndpoint>)> {
    let mut new = NewWebhook::new(validate_path(&body.path)?);
    new.function_id = body.function_id;
    if let Some(methods) = body.methods {
        if methods.is_empty() {
            return Err(ApiError::validation("webhook must allow at least one method"));
        }
        new.methods = methods.iter().map(|m| m.to_uppercase()).collect();
    }
    new.verification = body.verification;
    if let Some(enabled) = body.enabled {
        new.enabled = enabled;
    }
    let webhook = state.store.insert_webhook(new)?;
    Ok((StatusCode::CREATED, Json(webhook)))
}

/// GET /api/webhooks/{id}
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<WebhookEndpoint>> {
    Ok(Json(state.store.get_webhook(&id)?))
}

/// PATCH /api/webhooks/{id}
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut body): Json<WebhookUpdate>,
) -> ApiResult<Json<WebhookEndpoint>> {
    if let Some(ref path) = body.path {
        body.path = Some(validate_path(path)?);
    }
    if let Some(ref methods) = body.methods {
        if methods.is_empty() {
            return Err(ApiError::validation("webhook must allow at least one method"));
        }
    }
    Ok(Json(state.store.update_webhook(&id, body)?))
}

/// DELETE /api/webhooks/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.store.delete_webhook(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("webhook", &id))
    }
}
