use std::sync::Arc;

use alyx_store::{ExecutionFilter, ExecutionRecord, ExecutionStatus};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::app::AppState;
use crate::http::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub trigger_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// GET /api/executions; newest first, paginated.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ExecutionRecord>>> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            s.parse::<ExecutionStatus>()
                .map_err(ApiError::validation)
        })
        .transpose()?;

    let filter = ExecutionFilter {
        function_id: query.function,
        status,
        trigger_type: query.trigger_type,
        trigger_id: query.trigger_id,
        limit: query.limit.unwrap_or(50).min(500),
        offset: query.offset.unwrap_or(0),
    };
    Ok(Json(state.store.list_executions(&filter)?))
}

/// GET /api/executions/{id}; one execution with full payloads.
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    Ok(Json(state.store.get_execution(&id)?))
}
