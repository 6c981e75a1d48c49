use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::http::error::ApiResult;

/// GET /health; liveness plus queue depth by status.
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let counts = state.store.count_events_by_status()?;
    let mut events = serde_json::Map::new();
    for (status, count) in counts {
        events.insert(status, json!(count));
    }
    Ok(Json(json!({
        "status": "ok",
        "functions": state.functions.len(),
        "events": events,
    })))
}
