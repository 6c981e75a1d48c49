use alyx_core::types::{new_id, now_rfc3339};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::Store;

/// Lifecycle of one function invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timed_out" => Ok(ExecutionStatus::TimedOut),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One row of the append-only invocation audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub function_id: String,
    pub request_id: String,
    pub trigger_type: String,
    pub trigger_id: String,
    pub status: ExecutionStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub function_id: String,
    pub request_id: String,
    pub trigger_type: String,
    pub trigger_id: String,
    /// Already redacted by the caller; stored verbatim.
    pub input: Option<Value>,
}

/// Filters for the listing endpoint; all optional, ANDed together.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub function_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub trigger_type: Option<String>,
    pub trigger_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

fn descend<'a>(value: &'a mut Value, segs: &[&str]) -> Option<&'a mut Value> {
    match segs.split_first() {
        None => Some(value),
        Some((seg, rest)) => value.get_mut(*seg).and_then(|v| descend(v, rest)),
    }
}

/// Replace the values at `paths` (dotted, e.g. `user.password`) with a
/// redaction marker. Missing paths are ignored.
pub fn redact(input: &Value, paths: &[String]) -> Value {
    let mut out = input.clone();
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            continue;
        };
        if let Some(cursor) = descend(&mut out, parents) {
            if let Some(obj) = cursor.as_object_mut() {
                if obj.contains_key(*last) {
                    obj.insert((*last).to_string(), Value::String("[redacted]".into()));
                }
            }
        }
    }
    out
}

const EXECUTION_COLS: &str = "id, function_id, request_id, trigger_type, trigger_id, status,
                              started_at, completed_at, duration_ms, input, output, error, logs";

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status_str: String = row.get(5)?;
    let input_json: Option<String> = row.get(9)?;
    let output_json: Option<String> = row.get(10)?;
    let logs_json: String = row.get(12)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        function_id: row.get(1)?,
        request_id: row.get(2)?,
        trigger_type: row.get(3)?,
        trigger_id: row.get(4)?,
        status: status_str.parse().unwrap_or(ExecutionStatus::Pending),
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        duration_ms: row.get(8)?,
        input: input_json.as_deref().and_then(|v| serde_json::from_str(v).ok()),
        output: output_json.as_deref().and_then(|v| serde_json::from_str(v).ok()),
        error: row.get(11)?,
        logs: serde_json::from_str(&logs_json).unwrap_or_default(),
    })
}

impl Store {
    /// Append the `pending` row written before dispatch.
    pub fn append_execution(&self, new: NewExecution) -> Result<ExecutionRecord> {
        let id = new_id();
        let now = now_rfc3339();
        let input = new
            .input
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                field: "execution input",
                reason: e.to_string(),
            })?;
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO executions
                 (id, function_id, request_id, trigger_type, trigger_id,
                  status, started_at, input)
                 VALUES (?1,?2,?3,?4,?5,'pending',?6,?7)",
                params![
                    id,
                    new.function_id,
                    new.request_id,
                    new.trigger_type,
                    new.trigger_id,
                    now,
                    input,
                ],
            )
            .map(|_| ())
        })?;
        self.get_execution(&id)
    }

    pub fn mark_execution_running(&self, id: &str) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE executions SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now_rfc3339(), id],
            )
            .map(|_| ())
        })
    }

    /// Record the terminal outcome of one invocation.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        output: Option<&Value>,
        error: Option<&str>,
        logs: &[String],
        duration_ms: i64,
    ) -> Result<()> {
        let output_json = output
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                field: "execution output",
                reason: e.to_string(),
            })?;
        let logs_json = serde_json::to_string(logs).map_err(|e| StoreError::Corrupt {
            field: "execution logs",
            reason: e.to_string(),
        })?;
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE executions
                 SET status = ?1, completed_at = ?2, duration_ms = ?3,
                     output = ?4, error = ?5, logs = ?6
                 WHERE id = ?7",
                params![
                    status.to_string(),
                    now_rfc3339(),
                    duration_ms,
                    output_json,
                    error,
                    logs_json,
                    id,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn get_execution(&self, id: &str) -> Result<ExecutionRecord> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT {EXECUTION_COLS} FROM executions WHERE id = ?1"),
                params![id],
                row_to_execution,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?
        .ok_or_else(|| StoreError::NotFound {
            kind: "execution",
            id: id.to_string(),
        })
    }

    /// Newest-first listing with optional filters.
    pub fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let mut sql = format!("SELECT {EXECUTION_COLS} FROM executions WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(ref function_id) = filter.function_id {
            sql.push_str(" AND function_id = ?");
            args.push(Box::new(function_id.clone()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.to_string()));
        }
        if let Some(ref trigger_type) = filter.trigger_type {
            sql.push_str(" AND trigger_type = ?");
            args.push(Box::new(trigger_type.clone()));
        }
        if let Some(ref trigger_id) = filter.trigger_id {
            sql.push_str(" AND trigger_id = ?");
            args.push(Box::new(trigger_id.clone()));
        }
        sql.push_str(" ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?");
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        args.push(Box::new(limit as i64));
        args.push(Box::new(filter.offset as i64));

        self.with_retry(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(args.iter().map(|b| b.as_ref()));
            let rows = stmt.query_map(params, row_to_execution)?
                .collect::<rusqlite::Result<_>>();
            rows
        })
    }

    /// Delete rows whose run started before `cutoff`, same cadence as the
    /// event sweep.
    pub fn sweep_executions(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_retry(|conn| {
            conn.execute(
                "DELETE FROM executions WHERE started_at < ?1",
                params![cutoff.to_rfc3339()],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(s: &Store, function: &str, status: ExecutionStatus) -> ExecutionRecord {
        let rec = s
            .append_execution(NewExecution {
                function_id: function.to_string(),
                request_id: "req-1".to_string(),
                trigger_type: "database".to_string(),
                trigger_id: "ev-1".to_string(),
                input: Some(json!({"a": 1})),
            })
            .unwrap();
        if status != ExecutionStatus::Pending {
            s.mark_execution_running(&rec.id).unwrap();
            s.finish_execution(&rec.id, status, None, None, &[], 5).unwrap();
        }
        s.get_execution(&rec.id).unwrap()
    }

    #[test]
    fn lifecycle_pending_running_terminal() {
        let s = Store::open_in_memory().unwrap();
        let rec = s
            .append_execution(NewExecution {
                function_id: "notify".into(),
                request_id: "req-1".into(),
                trigger_type: "database".into(),
                trigger_id: "ev-1".into(),
                input: None,
            })
            .unwrap();
        assert_eq!(rec.status, ExecutionStatus::Pending);

        s.mark_execution_running(&rec.id).unwrap();
        s.finish_execution(
            &rec.id,
            ExecutionStatus::Success,
            Some(&json!({"sent": true})),
            None,
            &["delivered".to_string()],
            42,
        )
        .unwrap();

        let done = s.get_execution(&rec.id).unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.duration_ms, Some(42));
        assert_eq!(done.output, Some(json!({"sent": true})));
        assert_eq!(done.logs, vec!["delivered".to_string()]);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn filters_compose() {
        let s = Store::open_in_memory().unwrap();
        record(&s, "a", ExecutionStatus::Success);
        record(&s, "a", ExecutionStatus::Failed);
        record(&s, "b", ExecutionStatus::Success);

        let by_function = s
            .list_executions(&ExecutionFilter {
                function_id: Some("a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_function.len(), 2);

        let failed_a = s
            .list_executions(&ExecutionFilter {
                function_id: Some("a".into()),
                status: Some(ExecutionStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed_a.len(), 1);

        let by_trigger = s
            .list_executions(&ExecutionFilter {
                trigger_type: Some("database".into()),
                trigger_id: Some("ev-1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_trigger.len(), 3);
    }

    #[test]
    fn sweep_deletes_old_rows() {
        let s = Store::open_in_memory().unwrap();
        record(&s, "a", ExecutionStatus::Success);
        let removed = s
            .sweep_executions(Utc::now() + chrono::Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(s
            .list_executions(&ExecutionFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn redaction_replaces_declared_paths() {
        let input = json!({
            "email": "a@b",
            "password": "hunter2",
            "profile": {"token": "t0", "name": "al"}
        });
        let out = redact(
            &input,
            &["password".to_string(), "profile.token".to_string(), "missing.path".to_string()],
        );
        assert_eq!(out["password"], "[redacted]");
        assert_eq!(out["profile"]["token"], "[redacted]");
        assert_eq!(out["profile"]["name"], "al");
        assert_eq!(out["email"], "a@b");
    }
}
