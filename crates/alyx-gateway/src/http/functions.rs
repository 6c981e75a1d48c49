use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::http::error::ApiResult;

/// GET /api/functions; summaries of every loaded descriptor.
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Value>>> {
    let mut summaries: Vec<Value> = state
        .functions
        .snapshot()
        .iter()
        .map(|d| {
            json!({
                "name": d.name,
                "runtime": d.runtime.to_string(),
                "source_path": d.source_path.display().to_string(),
                "has_build": d.has_build,
                "timeout_secs": d.timeout.as_secs(),
                "memory_mb": d.memory_hint_mb,
            })
        })
        .collect();
    summaries.sort_by_key(|v| v["name"].as_str().map(String::from));
    Ok(Json(summaries))
}
