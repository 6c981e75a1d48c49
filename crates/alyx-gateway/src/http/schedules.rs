use std::sync::Arc;

use alyx_scheduler::cadence;
use alyx_store::{Event, NewSchedule, Schedule, ScheduleConfig, ScheduleKind, ScheduleUpdate};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::app::AppState;
use crate::http::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub function_id: String,
    pub kind: ScheduleKind,
    pub expression: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub config: Option<ScheduleConfig>,
}

/// GET /api/schedules
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Schedule>>> {
    Ok(Json(state.store.list_schedules()?))
}

/// POST /api/schedules
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateScheduleRequest>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let timezone = body.timezone.unwrap_or_else(|| "UTC".to_string());
    cadence::validate(body.kind, &body.expression, &timezone)?;
    let next_run = cadence::next_fire(body.kind, &body.expression, &timezone, Utc::now())?;

    let mut new = NewSchedule::new(body.name, body.function_id, body.kind, body.expression);
    new.timezone = timezone;
    new.next_run = next_run;
    if let Some(enabled) = body.enabled {
        new.enabled = enabled;
    }
    if let Some(config) = body.config {
        new.config = config;
    }
    let schedule = state.store.insert_schedule(new)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /api/schedules/{id}
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(state.store.get_schedule(&id)?))
}

/// PATCH /api/schedules/{id}
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ScheduleUpdate>,
) -> ApiResult<Json<Schedule>> {
    let cadence_changed =
        body.kind.is_some() || body.expression.is_some() || body.timezone.is_some();

    // Validate the merged cadence before anything is persisted.
    let current = state.store.get_schedule(&id)?;
    let kind = body.kind.unwrap_or(current.kind);
    let expression = body
        .expression
        .clone()
        .unwrap_or_else(|| current.expression.clone());
    let timezone = body
        .timezone
        .clone()
        .unwrap_or_else(|| current.timezone.clone());
    if cadence_changed {
        cadence::validate(kind, &expression, &timezone)?;
    }

    let schedule = state.store.update_schedule(&id, body)?;

    // A new cadence starts from now; the old next_run belongs to the old
    // expression.
    if cadence_changed {
        let next = cadence::next_fire(kind, &expression, &timezone, Utc::now())?;
        state.store.set_next_run(&id, next)?;
        return Ok(Json(state.store.get_schedule(&id)?));
    }
    Ok(Json(schedule))
}

/// DELETE /api/schedules/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.store.delete_schedule(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("schedule", &id))
    }
}

/// POST /api/schedules/{id}/trigger; fire immediately.
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    let event = state.scheduler.trigger_now(&id)?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}
