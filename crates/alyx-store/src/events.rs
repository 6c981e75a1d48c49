use std::time::Duration;

use alyx_core::types::{new_id, EventType};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::Store;

/// Lifecycle state of one durable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Cancelled
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            "cancelled" => Ok(EventStatus::Cancelled),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// Terminal outcome the dispatcher records for a claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl EventOutcome {
    fn status(self) -> EventStatus {
        match self {
            EventOutcome::Completed => EventStatus::Completed,
            EventOutcome::Failed => EventStatus::Failed,
            EventOutcome::Cancelled => EventStatus::Cancelled,
        }
    }
}

/// One link in an invocation chain, used for cycle detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub function_id: String,
    pub trigger_type: String,
    pub request_id: String,
}

/// Context carried with every event.
///
/// `depth` and `origin_chain` grow as functions publish follow-up events;
/// the dispatcher cancels any event whose depth reaches the chain bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub request_id: String,
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_function: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origin_chain: Vec<Fingerprint>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl EventMeta {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            depth: 0,
            origin_function: None,
            origin_chain: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Metadata for an event published from inside an invocation of
    /// `function_id`: same request id, depth bumped, chain extended.
    pub fn child(&self, function_id: &str, trigger_type: EventType) -> Self {
        let mut chain = self.origin_chain.clone();
        chain.push(Fingerprint {
            function_id: function_id.to_string(),
            trigger_type: trigger_type.to_string(),
            request_id: self.request_id.clone(),
        });
        Self {
            request_id: self.request_id.clone(),
            depth: self.depth + 1,
            origin_function: Some(function_id.to_string()),
            origin_chain: chain,
            extra: self.extra.clone(),
        }
    }

    /// Whether `function_id` already appears in this chain.
    pub fn chain_contains(&self, function_id: &str) -> bool {
        self.origin_chain
            .iter()
            .any(|f| f.function_id == function_id)
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// A persisted event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub source: String,
    pub action: String,
    pub payload: Value,
    pub metadata: EventMeta,
    pub status: EventStatus,
    pub created_at: String,
    pub process_at: String,
    pub claimed_at: Option<String>,
    pub processed_at: Option<String>,
}

/// What a publisher hands the bus. Id and metadata are resolved at publish
/// time; a pre-assigned id lets sync hooks correlate logs with the event
/// that is only inserted after the outer transaction commits.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub id: Option<String>,
    pub event_type: EventType,
    pub source: String,
    pub action: String,
    pub payload: Value,
    pub metadata: Option<EventMeta>,
    pub process_at: Option<DateTime<Utc>>,
}

impl EventDraft {
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: None,
            event_type,
            source: source.into(),
            action: action.into(),
            payload,
            metadata: None,
            process_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, meta: EventMeta) -> Self {
        self.metadata = Some(meta);
        self
    }

    pub fn with_process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    /// Resolve into a pending [`Event`]; `metadata` must already be final.
    pub fn resolve(self, metadata: EventMeta, now: DateTime<Utc>) -> Event {
        let process_at = self.process_at.unwrap_or(now);
        Event {
            id: self.id.unwrap_or_else(new_id),
            event_type: self.event_type,
            source: self.source,
            action: self.action,
            payload: self.payload,
            metadata,
            status: EventStatus::Pending,
            created_at: now.to_rfc3339(),
            process_at: process_at.to_rfc3339(),
            claimed_at: None,
            processed_at: None,
        }
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let type_str: String = row.get(1)?;
    let meta_json: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    Ok(Event {
        id: row.get(0)?,
        event_type: type_str.parse().unwrap_or(EventType::Custom),
        source: row.get(2)?,
        action: row.get(3)?,
        payload: serde_json::from_str(&row.get::<_, String>(4)?)
            .unwrap_or(Value::Null),
        metadata: serde_json::from_str(&meta_json).unwrap_or_else(|_| EventMeta::new("")),
        status: status_str.parse().unwrap_or(EventStatus::Pending),
        created_at: row.get(7)?,
        process_at: row.get(8)?,
        claimed_at: row.get(9)?,
        processed_at: row.get(10)?,
    })
}

const EVENT_COLS: &str = "id, type, source, action, payload, metadata, status,
                          created_at, process_at, claimed_at, processed_at";

impl Store {
    /// Persist a freshly resolved pending event.
    pub fn insert_event(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| StoreError::Corrupt {
                field: "payload",
                reason: e.to_string(),
            })?;
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| StoreError::Corrupt {
                field: "metadata",
                reason: e.to_string(),
            })?;
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO events
                 (id, type, source, action, payload, metadata, status,
                  created_at, process_at)
                 VALUES (?1,?2,?3,?4,?5,?6,'pending',?7,?8)",
                params![
                    event.id,
                    event.event_type.to_string(),
                    event.source,
                    event.action,
                    payload,
                    metadata,
                    event.created_at,
                    event.process_at,
                ],
            )
            .map(|_| ())
        })
    }

    /// Atomically claim up to `limit` due events, flipping them to
    /// `processing` in a single transaction.
    ///
    /// Rows stuck in `processing` longer than `reclaim_after` are handed
    /// back to `pending` first; the at-least-once guarantee after a
    /// crashed claimer. Ordering is `(process_at, id)` ascending; nothing
    /// is promised across transactions.
    pub fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        reclaim_after: Duration,
    ) -> Result<Vec<Event>> {
        let now_str = now.to_rfc3339();
        let stale_cutoff = (now
            - chrono::Duration::seconds(reclaim_after.as_secs() as i64))
        .to_rfc3339();

        self.with_retry(|conn| {
            let tx = conn.unchecked_transaction()?;

            tx.execute(
                "UPDATE events SET status = 'pending', claimed_at = NULL
                 WHERE status = 'processing' AND claimed_at < ?1",
                params![stale_cutoff],
            )?;

            let events: Vec<Event> = {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {EVENT_COLS} FROM events
                     WHERE status = 'pending' AND process_at <= ?1
                     ORDER BY process_at, id
                     LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![now_str, limit as i64], |row| {
                    row_to_event(row)
                })?
                .collect::<rusqlite::Result<_>>()?;
                rows
            };

            for event in &events {
                tx.execute(
                    "UPDATE events SET status = 'processing', claimed_at = ?1
                     WHERE id = ?2",
                    params![now_str, event.id],
                )?;
            }

            tx.commit()?;

            Ok(events
                .into_iter()
                .map(|mut e| {
                    e.status = EventStatus::Processing;
                    e.claimed_at = Some(now_str.clone());
                    e
                })
                .collect())
        })
    }

    /// Record a terminal outcome. Idempotent: a second call on an already
    /// terminal row changes nothing and returns `false`.
    pub fn complete_event(
        &self,
        id: &str,
        outcome: EventOutcome,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self.with_retry(|conn| {
            conn.execute(
                "UPDATE events SET status = ?1, processed_at = ?2, claimed_at = NULL
                 WHERE id = ?3 AND status IN ('pending', 'processing')",
                params![
                    outcome.status().to_string(),
                    processed_at.to_rfc3339(),
                    id
                ],
            )
        })?;
        Ok(n > 0)
    }

    /// Cancel an event recording `reason` into its metadata. Used for cycle
    /// breaks, where the reason must be observable afterwards.
    pub fn cancel_event_with_reason(
        &self,
        id: &str,
        reason: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let processed = processed_at.to_rfc3339();
        self.with_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            let meta_json: Option<String> = tx
                .query_row(
                    "SELECT metadata FROM events
                     WHERE id = ?1 AND status IN ('pending', 'processing')",
                    params![id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            let Some(meta_json) = meta_json else {
                return Ok(false);
            };

            let mut meta: Value =
                serde_json::from_str(&meta_json).unwrap_or(Value::Null);
            if let Some(obj) = meta.as_object_mut() {
                obj.insert(
                    "cancel_reason".to_string(),
                    Value::String(reason.to_string()),
                );
            }

            tx.execute(
                "UPDATE events
                 SET status = 'cancelled', processed_at = ?1, claimed_at = NULL,
                     metadata = ?2
                 WHERE id = ?3",
                params![processed, meta.to_string(), id],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Delete terminal events processed before `cutoff`. Non-terminal rows
    /// are untouched regardless of age.
    pub fn sweep_events(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_retry(|conn| {
            conn.execute(
                "DELETE FROM events
                 WHERE status IN ('completed', 'failed', 'cancelled')
                   AND processed_at < ?1",
                params![cutoff.to_rfc3339()],
            )
        })
    }

    pub fn get_event(&self, id: &str) -> Result<Event> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT {EVENT_COLS} FROM events WHERE id = ?1"),
                params![id],
                |row| row_to_event(row),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?
        .ok_or_else(|| StoreError::NotFound {
            kind: "event",
            id: id.to_string(),
        })
    }

    pub fn events_with_status(&self, status: EventStatus) -> Result<Vec<Event>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {EVENT_COLS} FROM events WHERE status = ?1
                 ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map(params![status.to_string()], |row| {
                row_to_event(row)
            })?
            .collect::<rusqlite::Result<_>>();
            rows
        })
    }

    /// Event counts by status, for the health endpoint.
    pub fn count_events_by_status(&self) -> Result<Vec<(String, i64)>> {
        self.with_retry(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT status, COUNT(*) FROM events GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>();
            rows
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn draft(source: &str) -> EventDraft {
        EventDraft::new(EventType::Database, source, "insert", json!({"id": "u1"}))
    }

    fn publish(store: &Store, source: &str) -> Event {
        let now = Utc::now();
        let event = draft(source).resolve(EventMeta::new(new_id()), now);
        store.insert_event(&event).unwrap();
        event
    }

    #[test]
    fn insert_then_claim() {
        let s = store();
        let ev = publish(&s, "users");

        let claimed = s
            .claim_batch(10, Utc::now(), Duration::from_secs(300))
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, ev.id);
        assert_eq!(claimed[0].status, EventStatus::Processing);

        // a second claim sees nothing; the row is held
        let again = s
            .claim_batch(10, Utc::now(), Duration::from_secs(300))
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn claim_skips_deferred_events() {
        let s = store();
        let now = Utc::now();
        let event = draft("users")
            .with_process_at(now + chrono::Duration::hours(1))
            .resolve(EventMeta::new(new_id()), now);
        s.insert_event(&event).unwrap();

        assert!(s
            .claim_batch(10, now, Duration::from_secs(300))
            .unwrap()
            .is_empty());

        // due once the clock passes process_at
        let later = now + chrono::Duration::hours(2);
        assert_eq!(
            s.claim_batch(10, later, Duration::from_secs(300))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn claim_orders_by_process_at_then_id() {
        let s = store();
        let now = Utc::now();
        let late = draft("b")
            .with_process_at(now - chrono::Duration::seconds(5))
            .resolve(EventMeta::new(new_id()), now);
        let early = draft("a")
            .with_process_at(now - chrono::Duration::seconds(50))
            .resolve(EventMeta::new(new_id()), now);
        s.insert_event(&late).unwrap();
        s.insert_event(&early).unwrap();

        let claimed = s.claim_batch(10, now, Duration::from_secs(300)).unwrap();
        assert_eq!(claimed[0].id, early.id);
        assert_eq!(claimed[1].id, late.id);
    }

    #[test]
    fn stale_processing_rows_are_reclaimed() {
        let s = store();
        publish(&s, "users");
        let now = Utc::now();

        let first = s.claim_batch(10, now, Duration::from_secs(300)).unwrap();
        assert_eq!(first.len(), 1);

        // within the reclaim window the row stays held
        let soon = now + chrono::Duration::seconds(60);
        assert!(s
            .claim_batch(10, soon, Duration::from_secs(300))
            .unwrap()
            .is_empty());

        // past the window the claim is handed back; at-least-once
        let later = now + chrono::Duration::seconds(600);
        let reclaimed = s.claim_batch(10, later, Duration::from_secs(300)).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, first[0].id);
    }

    #[test]
    fn complete_is_idempotent() {
        let s = store();
        let ev = publish(&s, "users");
        s.claim_batch(10, Utc::now(), Duration::from_secs(300))
            .unwrap();

        let now = Utc::now();
        assert!(s.complete_event(&ev.id, EventOutcome::Completed, now).unwrap());
        // second call is a no-op
        assert!(!s.complete_event(&ev.id, EventOutcome::Failed, now).unwrap());

        let row = s.get_event(&ev.id).unwrap();
        assert_eq!(row.status, EventStatus::Completed);
        assert!(row.processed_at.is_some());
        assert!(row.processed_at.unwrap() >= row.created_at);
    }

    #[test]
    fn cancel_records_reason_in_metadata() {
        let s = store();
        let ev = publish(&s, "users");
        s.cancel_event_with_reason(&ev.id, "CYCLE_DETECTED", Utc::now())
            .unwrap();

        let row = s.get_event(&ev.id).unwrap();
        assert_eq!(row.status, EventStatus::Cancelled);
        assert_eq!(
            row.metadata.extra.get("cancel_reason"),
            Some(&Value::String("CYCLE_DETECTED".into()))
        );
    }

    #[test]
    fn sweep_only_touches_terminal_rows() {
        let s = store();
        let done = publish(&s, "done");
        let pending = publish(&s, "pending");
        s.claim_batch(1, Utc::now(), Duration::from_secs(300)).unwrap();
        s.complete_event(&done.id, EventOutcome::Completed, Utc::now())
            .unwrap();

        let removed = s
            .sweep_events(Utc::now() + chrono::Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);

        assert!(s.get_event(&done.id).is_err());
        assert!(s.get_event(&pending.id).is_ok());
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        let s = std::sync::Arc::new(store());
        for i in 0..40 {
            publish(&s, &format!("src-{i}"));
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = std::sync::Arc::clone(&s);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                loop {
                    let batch = s
                        .claim_batch(4, Utc::now(), Duration::from_secs(300))
                        .unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|e| e.id));
                }
                mine
            }));
        }

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 40, "every event claimed exactly once");
        assert_eq!(all.len(), 40, "no event claimed twice");
    }

    #[test]
    fn meta_child_extends_chain() {
        let meta = EventMeta::new("req-1");
        let child = meta.child("notify", EventType::Database);
        assert_eq!(child.depth, 1);
        assert_eq!(child.request_id, "req-1");
        assert_eq!(child.origin_function.as_deref(), Some("notify"));
        assert!(child.chain_contains("notify"));

        let grandchild = child.child("audit", EventType::Database);
        assert_eq!(grandchild.depth, 2);
        assert!(grandchild.chain_contains("notify"));
        assert!(grandchild.chain_contains("audit"));
    }
}
