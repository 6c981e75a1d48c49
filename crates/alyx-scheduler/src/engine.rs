use std::sync::Arc;
use std::time::Duration;

use alyx_bus::{EventBus, EventCompletion};
use alyx_core::config::SchedulerConfig;
use alyx_core::types::{new_id, EventType};
use alyx_core::Supervisor;
use alyx_store::{
    Event, EventDraft, EventMeta, EventStatus, Schedule, ScheduleKind, Store,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cadence;
use crate::error::{Result, ScheduleError};

const RETRY_BACKOFF_BASE_SECS: u64 = 10;
const RETRY_BACKOFF_CAP_SECS: u64 = 300;

/// Drives schedules: polls for due rows, publishes `schedule` events, and
/// tracks per-schedule overlap and retry state from bus completions.
pub struct Scheduler {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    config: SchedulerConfig,
    /// Live fired-event count per schedule id, for `skip_if_running`.
    running: DashMap<String, u32>,
    /// Consecutive failed attempts per schedule id, for `retry_on_failure`.
    retries: DashMap<String, u32>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, config: SchedulerConfig) -> Self {
        Self {
            store,
            bus,
            config,
            running: DashMap::new(),
            retries: DashMap::new(),
        }
    }

    /// Spawn the tick loop and the completion listener under the supervisor.
    pub fn start(self: Arc<Self>, supervisor: &Supervisor) {
        info!(tick_ms = self.config.tick_ms, "starting scheduler");

        let scheduler = Arc::clone(&self);
        let token = supervisor.cancellation_token();
        supervisor.spawn(async move {
            scheduler.tick_loop(token).await;
        });

        let token = supervisor.cancellation_token();
        supervisor.spawn(async move {
            self.completion_loop(token).await;
        });
    }

    async fn tick_loop(&self, shutdown: CancellationToken) {
        if let Err(e) = self.advance_missed_on_startup() {
            error!("startup schedule advance failed: {e}");
        }

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.tick() {
                        error!("scheduler tick error: {e}");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn completion_loop(&self, shutdown: CancellationToken) {
        let mut completions = self.bus.completions();
        loop {
            tokio::select! {
                received = completions.recv() => match received {
                    Ok(completion) => self.on_completion(completion),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // Overlap counts may now overestimate; they self-heal
                        // as newer completions arrive.
                        warn!(missed, "completion stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Missed windows are logged and skipped, never replayed.
    fn advance_missed_on_startup(&self) -> Result<()> {
        let now = Utc::now();
        for schedule in self.store.list_schedules()? {
            if !schedule.enabled {
                continue;
            }
            let needs_advance = match schedule.next_run.as_deref() {
                None => true,
                Some(next) => next < now.to_rfc3339().as_str(),
            };
            if !needs_advance {
                continue;
            }
            if schedule.next_run.is_some() {
                warn!(
                    schedule = %schedule.name,
                    missed_at = schedule.next_run.as_deref().unwrap_or(""),
                    "missed schedule window, advancing"
                );
            }
            match self.compute_next(&schedule, now) {
                Ok(next) => {
                    let still_enabled = next.is_some();
                    if !still_enabled {
                        debug!(schedule = %schedule.name, "schedule exhausted at startup");
                    }
                    self.store.set_next_run(&schedule.id, next)?;
                    if !still_enabled {
                        self.store.record_fire(
                            &schedule.id,
                            now,
                            None,
                            schedule.last_status.as_deref().unwrap_or("missed"),
                            false,
                        )?;
                    }
                }
                Err(e) => {
                    error!(schedule = %schedule.name, "cannot compute next run: {e}");
                }
            }
        }
        Ok(())
    }

    /// Fire everything due at this instant, in `(next_run, id)` order.
    fn tick(&self) -> Result<()> {
        let now = Utc::now();
        for schedule in self.store.due_schedules(now)? {
            if let Err(e) = self.fire(&schedule, now) {
                error!(schedule = %schedule.name, "fire failed: {e}");
                self.store
                    .set_schedule_last_status(&schedule.id, "failed")?;
            }
        }
        Ok(())
    }

    /// One firing: overlap policy and event publication, with the cadence
    /// advance persisted in one store update.
    fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<Event>> {
        let next = self.compute_next(schedule, now)?;

        if schedule.config.skip_if_running && self.running_count(&schedule.id) >= schedule.config.max_overlap {
            debug!(
                schedule = %schedule.name,
                "previous firing still running, skipping this window"
            );
            self.store.record_skip(&schedule.id, next)?;
            return Ok(None);
        }

        let event = self.publish_fire_event(schedule, now, None)?;
        let still_enabled = !(schedule.kind == ScheduleKind::OneTime || next.is_none());
        self.store
            .record_fire(&schedule.id, now, next, "fired", still_enabled)?;

        info!(
            schedule = %schedule.name,
            event_id = %event.id,
            next_run = ?next.map(|dt| dt.to_rfc3339()),
            "schedule fired"
        );
        Ok(Some(event))
    }

    /// Fire a schedule immediately, bypassing the cadence but honoring the
    /// overlap policy. `next_run` is left untouched.
    pub fn trigger_now(&self, id: &str) -> Result<Event> {
        let schedule = self.store.get_schedule(id)?;
        if schedule.config.skip_if_running
            && self.running_count(&schedule.id) >= schedule.config.max_overlap
        {
            return Err(ScheduleError::OverlapLimit { id: id.to_string() });
        }

        let now = Utc::now();
        let event = self.publish_fire_event(&schedule, now, None)?;
        let next = schedule
            .next_run
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        self.store
            .record_fire(&schedule.id, now, next, "fired", schedule.enabled)?;
        info!(schedule = %schedule.name, event_id = %event.id, "schedule triggered manually");
        Ok(event)
    }

    fn publish_fire_event(
        &self,
        schedule: &Schedule,
        fire_time: DateTime<Utc>,
        process_at: Option<DateTime<Utc>>,
    ) -> Result<Event> {
        let mut payload = match schedule.config.input.clone() {
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => json!({"input": other}),
            None => json!({}),
        };
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("schedule_id".to_string(), json!(schedule.id));
            obj.insert("fire_time".to_string(), json!(fire_time.to_rfc3339()));
        }

        let meta = EventMeta::new(new_id())
            .with_extra("schedule_id", json!(schedule.id));

        let mut draft = EventDraft::new(
            EventType::Schedule,
            schedule.name.clone(),
            "fire",
            payload,
        )
        .with_metadata(meta);
        if let Some(at) = process_at {
            draft = draft.with_process_at(at);
        }

        let event = self.bus.publish(draft)?;
        *self.running.entry(schedule.id.clone()).or_insert(0) += 1;
        Ok(event)
    }

    /// Cadence advance for one fire at `now`. Interval schedules anchor on
    /// the due time to stay drift-free.
    fn compute_next(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match schedule.kind {
            ScheduleKind::Interval => {
                let anchor = schedule
                    .next_run
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(now);
                Ok(Some(cadence::interval_next(
                    &schedule.expression,
                    anchor,
                    now,
                )?))
            }
            _ => cadence::next_fire(schedule.kind, &schedule.expression, &schedule.timezone, now),
        }
    }

    fn running_count(&self, schedule_id: &str) -> u32 {
        self.running.get(schedule_id).map(|c| *c).unwrap_or(0)
    }

    /// React to a settled schedule event: release the overlap slot, track
    /// the outcome, and re-queue failed firings when the policy says so.
    fn on_completion(&self, completion: EventCompletion) {
        if completion.event_type != EventType::Schedule {
            return;
        }
        let Some(schedule_id) = completion
            .metadata
            .extra
            .get("schedule_id")
            .and_then(|v| v.as_str())
            .map(String::from)
        else {
            return;
        };

        if let Some(mut count) = self.running.get_mut(&schedule_id) {
            *count = count.saturating_sub(1);
        }

        match completion.status {
            EventStatus::Completed => {
                self.retries.remove(&schedule_id);
                if let Err(e) = self.store.set_schedule_last_status(&schedule_id, "success") {
                    error!(schedule_id, "failed to record success: {e}");
                }
            }
            EventStatus::Failed => self.handle_failure(&schedule_id),
            _ => {}
        }
    }

    fn handle_failure(&self, schedule_id: &str) {
        let schedule = match self.store.get_schedule(schedule_id) {
            Ok(s) => s,
            Err(e) => {
                // Deleted while its event was in flight.
                debug!(schedule_id, "completion for unknown schedule: {e}");
                return;
            }
        };

        let attempt = self
            .retries
            .get(schedule_id)
            .map(|c| *c)
            .unwrap_or(0);
        if !schedule.config.retry_on_failure || attempt >= schedule.config.max_retries {
            self.retries.remove(schedule_id);
            if let Err(e) = self.store.set_schedule_last_status(schedule_id, "failed") {
                error!(schedule_id, "failed to record failure: {e}");
            }
            return;
        }

        let attempt = attempt + 1;
        self.retries.insert(schedule_id.to_string(), attempt);
        let backoff_secs =
            (RETRY_BACKOFF_BASE_SECS << (attempt - 1)).min(RETRY_BACKOFF_CAP_SECS);
        let process_at = Utc::now() + chrono::Duration::seconds(backoff_secs as i64);
        warn!(
            schedule = %schedule.name,
            attempt,
            backoff_secs,
            "schedule execution failed, re-queueing"
        );

        match self.publish_fire_event(&schedule, Utc::now(), Some(process_at)) {
            Ok(_) => {
                if let Err(e) = self.store.set_schedule_last_status(schedule_id, "retrying") {
                    error!(schedule_id, "failed to record retry: {e}");
                }
            }
            Err(e) => error!(schedule = %schedule.name, "retry publish failed: {e}"),
        }
    }
}
