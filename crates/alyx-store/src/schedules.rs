use alyx_core::types::{new_id, now_rfc3339};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::{is_constraint, Store};

/// The three cadence flavours a schedule can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Standard 5-field cron expression, evaluated in the schedule's timezone.
    Cron,
    /// Duration string such as `30s`, `5m`, `1h30m`.
    Interval,
    /// Absolute RFC 3339 timestamp; disabled after firing.
    OneTime,
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleKind::Cron => "cron",
            ScheduleKind::Interval => "interval",
            ScheduleKind::OneTime => "one_time",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleKind::Cron),
            "interval" => Ok(ScheduleKind::Interval),
            "one_time" => Ok(ScheduleKind::OneTime),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// Concurrency and retry policy plus the static payload merged into every
/// fired event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub skip_if_running: bool,
    #[serde(default = "default_overlap")]
    pub max_overlap: u32,
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            skip_if_running: true,
            max_overlap: 1,
            retry_on_failure: false,
            max_retries: default_retries(),
            input: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_overlap() -> u32 {
    1
}
fn default_retries() -> u32 {
    3
}

/// A persisted schedule row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub function_id: String,
    pub kind: ScheduleKind,
    pub expression: String,
    /// IANA timezone name; cadence computation happens in this zone.
    pub timezone: String,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_status: Option<String>,
    pub enabled: bool,
    pub config: ScheduleConfig,
    pub managed_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub function_id: String,
    pub kind: ScheduleKind,
    pub expression: String,
    pub timezone: String,
    pub next_run: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub config: ScheduleConfig,
    pub managed_by: String,
}

impl NewSchedule {
    pub fn new(
        name: impl Into<String>,
        function_id: impl Into<String>,
        kind: ScheduleKind,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            function_id: function_id.into(),
            kind,
            expression: expression.into(),
            timezone: "UTC".to_string(),
            next_run: None,
            enabled: true,
            config: ScheduleConfig::default(),
            managed_by: crate::MANAGED_BY_API.to_string(),
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub function_id: Option<String>,
    pub kind: Option<ScheduleKind>,
    pub expression: Option<String>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
    pub config: Option<ScheduleConfig>,
}

const SCHEDULE_COLS: &str = "id, name, function_id, kind, expression, timezone,
                             next_run, last_run, last_status, enabled, config,
                             managed_by, created_at, updated_at";

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let kind_str: String = row.get(3)?;
    let config_json: String = row.get(10)?;
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        function_id: row.get(2)?,
        kind: kind_str.parse().unwrap_or(ScheduleKind::OneTime),
        expression: row.get(4)?,
        timezone: row.get(5)?,
        next_run: row.get(6)?,
        last_run: row.get(7)?,
        last_status: row.get(8)?,
        enabled: row.get(9)?,
        config: serde_json::from_str(&config_json).unwrap_or_default(),
        managed_by: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl Store {
    pub fn insert_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        let id = new_id();
        let now = now_rfc3339();
        let config = serde_json::to_string(&new.config).map_err(|e| StoreError::Corrupt {
            field: "schedule config",
            reason: e.to_string(),
        })?;
        let next_run = new.next_run.map(|dt| dt.to_rfc3339());
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO schedules
                 (id, name, function_id, kind, expression, timezone, next_run,
                  enabled, config, managed_by, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?11)",
                params![
                    id,
                    new.name,
                    new.function_id,
                    new.kind.to_string(),
                    new.expression,
                    new.timezone,
                    next_run,
                    new.enabled,
                    config,
                    new.managed_by,
                    now,
                ],
            )
            .map(|_| ())
        })
        .map_err(|e| match e {
            StoreError::Database(ref inner) if is_constraint(inner) => StoreError::Conflict {
                kind: "schedule",
                value: new.name.clone(),
            },
            other => other,
        })?;
        self.get_schedule(&id)
    }

    pub fn get_schedule(&self, id: &str) -> Result<Schedule> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT {SCHEDULE_COLS} FROM schedules WHERE id = ?1"),
                params![id],
                row_to_schedule,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?
        .ok_or_else(|| StoreError::NotFound {
            kind: "schedule",
            id: id.to_string(),
        })
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedules ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map([], row_to_schedule)?
                .collect::<rusqlite::Result<_>>();
            rows
        })
    }

    pub fn schedules_by_function(&self, function_id: &str) -> Result<Vec<Schedule>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedules WHERE function_id = ?1
                 ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map(params![function_id], row_to_schedule)?
                .collect::<rusqlite::Result<_>>();
            rows
        })
    }

    /// Enabled schedules due at `now`, ordered by `(next_run, id)`; the id
    /// tiebreak makes same-instant firings deterministic.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedules
                 WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run, id"
            ))?;
            let rows = stmt.query_map(params![now.to_rfc3339()], row_to_schedule)?
                .collect::<rusqlite::Result<_>>();
            rows
        })
    }

    /// Persist one firing: `last_run`, `last_status`, the new `next_run`,
    /// and (for exhausted one-shots) the enabled flag, in one statement.
    pub fn record_fire(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        last_status: &str,
        still_enabled: bool,
    ) -> Result<()> {
        let now = now_rfc3339();
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE schedules
                 SET last_run = ?1, next_run = ?2, last_status = ?3,
                     enabled = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    last_run.to_rfc3339(),
                    next_run.map(|dt| dt.to_rfc3339()),
                    last_status,
                    still_enabled,
                    now,
                    id,
                ],
            )
            .map(|_| ())
        })
    }

    /// A firing skipped by the overlap policy: the cadence still advances,
    /// `last_run` stays untouched.
    pub fn record_skip(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE schedules
                 SET next_run = ?1, last_status = 'skipped', updated_at = ?2
                 WHERE id = ?3",
                params![next_run.map(|dt| dt.to_rfc3339()), now_rfc3339(), id],
            )
            .map(|_| ())
        })
    }

    /// Overwrite `next_run` without touching the last-fire bookkeeping.
    /// Used at startup to advance past missed windows.
    pub fn set_next_run(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE schedules SET next_run = ?1, updated_at = ?2 WHERE id = ?3",
                params![next_run.map(|dt| dt.to_rfc3339()), now_rfc3339(), id],
            )
            .map(|_| ())
        })
    }

    pub fn set_schedule_last_status(&self, id: &str, last_status: &str) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE schedules SET last_status = ?1, updated_at = ?2 WHERE id = ?3",
                params![last_status, now_rfc3339(), id],
            )
            .map(|_| ())
        })
    }

    pub fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> Result<Schedule> {
        let mut s = self.get_schedule(id)?;
        if let Some(name) = update.name {
            s.name = name;
        }
        if let Some(function_id) = update.function_id {
            s.function_id = function_id;
        }
        if let Some(kind) = update.kind {
            s.kind = kind;
        }
        if let Some(expression) = update.expression {
            s.expression = expression;
        }
        if let Some(timezone) = update.timezone {
            s.timezone = timezone;
        }
        if let Some(enabled) = update.enabled {
            s.enabled = enabled;
        }
        if let Some(config) = update.config {
            s.config = config;
        }

        let config = serde_json::to_string(&s.config).map_err(|e| StoreError::Corrupt {
            field: "schedule config",
            reason: e.to_string(),
        })?;
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE schedules
                 SET name=?1, function_id=?2, kind=?3, expression=?4, timezone=?5,
                     enabled=?6, config=?7, updated_at=?8
                 WHERE id=?9",
                params![
                    s.name,
                    s.function_id,
                    s.kind.to_string(),
                    s.expression,
                    s.timezone,
                    s.enabled,
                    config,
                    now_rfc3339(),
                    id,
                ],
            )
            .map(|_| ())
        })?;
        self.get_schedule(id)
    }

    pub fn delete_schedule(&self, id: &str) -> Result<bool> {
        let n = self.with_retry(|conn| {
            conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])
        })?;
        Ok(n > 0)
    }

    pub fn delete_manifest_schedules(&self, function_id: &str) -> Result<usize> {
        self.with_retry(|conn| {
            conn.execute(
                "DELETE FROM schedules WHERE function_id = ?1 AND managed_by = ?2",
                params![function_id, crate::MANAGED_BY_MANIFEST],
            )
        })
    }
}
