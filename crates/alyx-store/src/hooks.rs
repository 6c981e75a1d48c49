use alyx_core::types::{new_id, now_rfc3339, EventType};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::Store;

/// Whether the publisher waits for the hook's result.
///
/// Sync bindings are only honored where the publisher is willing to block
/// (source triggers); the queue dispatcher runs async bindings exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookMode {
    Sync,
    Async,
}

impl std::fmt::Display for HookMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookMode::Sync => write!(f, "sync"),
            HookMode::Async => write!(f, "async"),
        }
    }
}

impl std::str::FromStr for HookMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sync" => Ok(HookMode::Sync),
            "async" => Ok(HookMode::Async),
            other => Err(format!("unknown hook mode: {other}")),
        }
    }
}

/// What a failing sync hook does to the operation it gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort the source operation and surface the hook's error.
    #[default]
    Reject,
    /// Log and let the source operation proceed.
    Continue,
}

/// Recognized hook configuration keys. Unknown keys are preserved nowhere;
/// the config is a typed record, not a free mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    /// Per-hook cap on the subprocess run, in seconds. Falls back to the
    /// executor defaults (5 s sync / 30 s async).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Static payload merged into the event payload before invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// A binding from an event pattern to a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub id: String,
    pub name: String,
    pub function_id: String,
    pub event_type: EventType,
    /// Exact source or the wildcard `*`.
    pub event_source: String,
    /// Exact action or the wildcard `*`.
    pub event_action: String,
    pub mode: HookMode,
    /// Higher fires earlier.
    pub priority: i64,
    pub config: HookConfig,
    pub enabled: bool,
    pub managed_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Hook {
    /// Pattern match per the wildcard table: type exact, source and action
    /// exact-or-`*`.
    pub fn matches(&self, event_type: EventType, source: &str, action: &str) -> bool {
        self.event_type == event_type
            && (self.event_source == "*" || self.event_source == source)
            && (self.event_action == "*" || self.event_action == action)
    }
}

#[derive(Debug, Clone)]
pub struct NewHook {
    pub name: String,
    pub function_id: String,
    pub event_type: EventType,
    pub event_source: String,
    pub event_action: String,
    pub mode: HookMode,
    pub priority: i64,
    pub config: HookConfig,
    pub enabled: bool,
    pub managed_by: String,
}

impl NewHook {
    pub fn new(
        name: impl Into<String>,
        function_id: impl Into<String>,
        event_type: EventType,
    ) -> Self {
        Self {
            name: name.into(),
            function_id: function_id.into(),
            event_type,
            event_source: "*".to_string(),
            event_action: "*".to_string(),
            mode: HookMode::Async,
            priority: 0,
            config: HookConfig::default(),
            enabled: true,
            managed_by: crate::MANAGED_BY_API.to_string(),
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookUpdate {
    pub name: Option<String>,
    pub function_id: Option<String>,
    pub event_type: Option<EventType>,
    pub event_source: Option<String>,
    pub event_action: Option<String>,
    pub mode: Option<HookMode>,
    pub priority: Option<i64>,
    pub config: Option<HookConfig>,
    pub enabled: Option<bool>,
}

const HOOK_COLS: &str = "id, name, function_id, event_type, event_source, event_action,
                         mode, priority, config, enabled, managed_by, created_at, updated_at";

fn row_to_hook(row: &Row<'_>) -> rusqlite::Result<Hook> {
    let type_str: String = row.get(3)?;
    let mode_str: String = row.get(6)?;
    let config_json: String = row.get(8)?;
    Ok(Hook {
        id: row.get(0)?,
        name: row.get(1)?,
        function_id: row.get(2)?,
        event_type: type_str.parse().unwrap_or(EventType::Custom),
        event_source: row.get(4)?,
        event_action: row.get(5)?,
        mode: mode_str.parse().unwrap_or(HookMode::Async),
        priority: row.get(7)?,
        config: serde_json::from_str(&config_json).unwrap_or_default(),
        enabled: row.get(9)?,
        managed_by: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl Store {
    pub fn insert_hook(&self, new: NewHook) -> Result<Hook> {
        let id = new_id();
        let now = now_rfc3339();
        let config = serde_json::to_string(&new.config).map_err(|e| StoreError::Corrupt {
            field: "hook config",
            reason: e.to_string(),
        })?;
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO hooks
                 (id, name, function_id, event_type, event_source, event_action,
                  mode, priority, config, enabled, managed_by, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?12)",
                params![
                    id,
                    new.name,
                    new.function_id,
                    new.event_type.to_string(),
                    new.event_source,
                    new.event_action,
                    new.mode.to_string(),
                    new.priority,
                    config,
                    new.enabled,
                    new.managed_by,
                    now,
                ],
            )
            .map(|_| ())
        })?;
        self.get_hook(&id)
    }

    pub fn get_hook(&self, id: &str) -> Result<Hook> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT {HOOK_COLS} FROM hooks WHERE id = ?1"),
                params![id],
                row_to_hook,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?
        .ok_or_else(|| StoreError::NotFound {
            kind: "hook",
            id: id.to_string(),
        })
    }

    pub fn list_hooks(&self) -> Result<Vec<Hook>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {HOOK_COLS} FROM hooks ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map([], row_to_hook)?
                .collect::<rusqlite::Result<_>>();
            rows
        })
    }

    pub fn hooks_by_function(&self, function_id: &str) -> Result<Vec<Hook>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {HOOK_COLS} FROM hooks WHERE function_id = ?1
                 ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map(params![function_id], row_to_hook)?
                .collect::<rusqlite::Result<_>>();
            rows
        })
    }

    /// All enabled hooks, for the registry cache rebuild.
    pub fn enabled_hooks(&self) -> Result<Vec<Hook>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {HOOK_COLS} FROM hooks WHERE enabled = 1"
            ))?;
            let rows = stmt.query_map([], row_to_hook)?
                .collect::<rusqlite::Result<_>>();
            rows
        })
    }

    pub fn update_hook(&self, id: &str, update: HookUpdate) -> Result<Hook> {
        let mut hook = self.get_hook(id)?;
        if let Some(name) = update.name {
            hook.name = name;
        }
        if let Some(function_id) = update.function_id {
            hook.function_id = function_id;
        }
        if let Some(event_type) = update.event_type {
            hook.event_type = event_type;
        }
        if let Some(event_source) = update.event_source {
            hook.event_source = event_source;
        }
        if let Some(event_action) = update.event_action {
            hook.event_action = event_action;
        }
        if let Some(mode) = update.mode {
            hook.mode = mode;
        }
        if let Some(priority) = update.priority {
            hook.priority = priority;
        }
        if let Some(config) = update.config {
            hook.config = config;
        }
        if let Some(enabled) = update.enabled {
            hook.enabled = enabled;
        }

        let now = now_rfc3339();
        let config = serde_json::to_string(&hook.config).map_err(|e| StoreError::Corrupt {
            field: "hook config",
            reason: e.to_string(),
        })?;
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE hooks SET name=?1, function_id=?2, event_type=?3,
                        event_source=?4, event_action=?5, mode=?6, priority=?7,
                        config=?8, enabled=?9, updated_at=?10
                 WHERE id=?11",
                params![
                    hook.name,
                    hook.function_id,
                    hook.event_type.to_string(),
                    hook.event_source,
                    hook.event_action,
                    hook.mode.to_string(),
                    hook.priority,
                    config,
                    hook.enabled,
                    now,
                    id,
                ],
            )
            .map(|_| ())
        })?;
        self.get_hook(id)
    }

    pub fn delete_hook(&self, id: &str) -> Result<bool> {
        let n = self.with_retry(|conn| {
            conn.execute("DELETE FROM hooks WHERE id = ?1", params![id])
        })?;
        Ok(n > 0)
    }

    /// Remove the manifest-owned hooks of one function. API-created rows are
    /// never touched.
    pub fn delete_manifest_hooks(&self, function_id: &str) -> Result<usize> {
        self.with_retry(|conn| {
            conn.execute(
                "DELETE FROM hooks WHERE function_id = ?1 AND managed_by = ?2",
                params![function_id, crate::MANAGED_BY_MANIFEST],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        let mut hook = Hook {
            id: "h1".into(),
            name: "notify".into(),
            function_id: "notify".into(),
            event_type: EventType::Database,
            event_source: "*".into(),
            event_action: "insert".into(),
            mode: HookMode::Async,
            priority: 0,
            config: HookConfig::default(),
            enabled: true,
            managed_by: "api".into(),
            created_at: String::new(),
            updated_at: String::new(),
        };

        assert!(hook.matches(EventType::Database, "users", "insert"));
        assert!(hook.matches(EventType::Database, "orders", "insert"));
        assert!(!hook.matches(EventType::Database, "users", "update"));
        assert!(!hook.matches(EventType::Auth, "users", "insert"));

        hook.event_source = "users".into();
        hook.event_action = "*".into();
        assert!(hook.matches(EventType::Database, "users", "delete"));
        assert!(!hook.matches(EventType::Database, "orders", "delete"));
    }

    #[test]
    fn crud_round_trip() {
        let s = Store::open_in_memory().unwrap();
        let hook = s
            .insert_hook(NewHook::new("on-signup", "validate", EventType::Auth))
            .unwrap();
        assert_eq!(hook.event_source, "*");
        assert!(hook.enabled);

        let updated = s
            .update_hook(
                &hook.id,
                HookUpdate {
                    priority: Some(10),
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.priority, 10);
        assert!(!updated.enabled);
        // untouched fields survive the partial update
        assert_eq!(updated.name, "on-signup");

        assert!(s.delete_hook(&hook.id).unwrap());
        assert!(!s.delete_hook(&hook.id).unwrap());
        assert!(s.get_hook(&hook.id).is_err());
    }

    #[test]
    fn manifest_deletion_spares_api_rows() {
        let s = Store::open_in_memory().unwrap();
        let mut manifest_hook = NewHook::new("m", "f1", EventType::Database);
        manifest_hook.managed_by = crate::MANAGED_BY_MANIFEST.to_string();
        s.insert_hook(manifest_hook).unwrap();
        s.insert_hook(NewHook::new("a", "f1", EventType::Database))
            .unwrap();

        assert_eq!(s.delete_manifest_hooks("f1").unwrap(), 1);
        assert_eq!(s.hooks_by_function("f1").unwrap().len(), 1);
    }

    #[test]
    fn hook_config_defaults_from_empty_json() {
        let cfg: HookConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.on_failure, OnFailure::Reject);
        assert!(!cfg.retry_on_failure);
        assert!(cfg.timeout_secs.is_none());
    }
}
