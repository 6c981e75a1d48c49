use alyx_core::types::{new_id, now_rfc3339};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::store::{is_constraint, Store};

/// HMAC algorithm used to sign the raw request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    HmacSha1,
    HmacSha256,
}

/// How an endpoint authenticates incoming deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub algorithm: SignatureAlgorithm,
    /// Header carrying the hex signature, e.g. `X-Hub-Signature-256`.
    pub header: String,
    pub secret: String,
    /// When true, failed verification still publishes the event with
    /// `verified=false` instead of rejecting with 401.
    #[serde(default)]
    pub skip_invalid: bool,
}

/// A registered webhook ingress path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: String,
    /// Path segment under `/webhooks/`, unique across endpoints.
    pub path: String,
    /// Function invoked synchronously to produce the HTTP response; `None`
    /// means publish-only (respond 204).
    pub function_id: Option<String>,
    /// Allowed HTTP methods, upper-case.
    pub methods: Vec<String>,
    pub verification: Option<Verification>,
    pub enabled: bool,
    pub managed_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl WebhookEndpoint {
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub path: String,
    pub function_id: Option<String>,
    pub methods: Vec<String>,
    pub verification: Option<Verification>,
    pub enabled: bool,
    pub managed_by: String,
}

impl NewWebhook {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            function_id: None,
            methods: vec!["POST".to_string()],
            verification: None,
            enabled: true,
            managed_by: crate::MANAGED_BY_API.to_string(),
        }
    }
}

/// Partial update; `None` fields are left untouched. `verification` uses a
/// double Option so callers can clear it explicitly.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookUpdate {
    pub path: Option<String>,
    pub function_id: Option<Option<String>>,
    pub methods: Option<Vec<String>>,
    pub verification: Option<Option<Verification>>,
    pub enabled: Option<bool>,
}

const WEBHOOK_COLS: &str =
    "id, path, function_id, methods, verification, enabled, managed_by, created_at, updated_at";

fn row_to_webhook(row: &Row<'_>) -> rusqlite::Result<WebhookEndpoint> {
    let methods_json: String = row.get(3)?;
    let verification_json: Option<String> = row.get(4)?;
    Ok(WebhookEndpoint {
        id: row.get(0)?,
        path: row.get(1)?,
        function_id: row.get(2)?,
        methods: serde_json::from_str(&methods_json).unwrap_or_default(),
        verification: verification_json
            .as_deref()
            .and_then(|v| serde_json::from_str(v).ok()),
        enabled: row.get(5)?,
        managed_by: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl Store {
    pub fn insert_webhook(&self, new: NewWebhook) -> Result<WebhookEndpoint> {
        let id = new_id();
        let now = now_rfc3339();
        let methods = serde_json::to_string(&new.methods).map_err(|e| StoreError::Corrupt {
            field: "webhook methods",
            reason: e.to_string(),
        })?;
        let verification = new
            .verification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                field: "webhook verification",
                reason: e.to_string(),
            })?;
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO webhooks
                 (id, path, function_id, methods, verification, enabled,
                  managed_by, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?8)",
                params![
                    id,
                    new.path,
                    new.function_id,
                    methods,
                    verification,
                    new.enabled,
                    new.managed_by,
                    now,
                ],
            )
            .map(|_| ())
        })
        .map_err(|e| match e {
            StoreError::Database(ref inner) if is_constraint(inner) => StoreError::Conflict {
                kind: "webhook path",
                value: new.path.clone(),
            },
            other => other,
        })?;
        self.get_webhook(&id)
    }

    pub fn get_webhook(&self, id: &str) -> Result<WebhookEndpoint> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT {WEBHOOK_COLS} FROM webhooks WHERE id = ?1"),
                params![id],
                row_to_webhook,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?
        .ok_or_else(|| StoreError::NotFound {
            kind: "webhook",
            id: id.to_string(),
        })
    }

    /// Lookup by ingress path. Returns `None` rather than an error; an
    /// unknown path is an expected request outcome, not a fault.
    pub fn webhook_by_path(&self, path: &str) -> Result<Option<WebhookEndpoint>> {
        self.with_retry(|conn| {
            conn.query_row(
                &format!("SELECT {WEBHOOK_COLS} FROM webhooks WHERE path = ?1"),
                params![path],
                row_to_webhook,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub fn list_webhooks(&self) -> Result<Vec<WebhookEndpoint>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {WEBHOOK_COLS} FROM webhooks ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map([], row_to_webhook)?
                .collect::<rusqlite::Result<_>>();
            rows
        })
    }

    pub fn update_webhook(&self, id: &str, update: WebhookUpdate) -> Result<WebhookEndpoint> {
        let mut w = self.get_webhook(id)?;
        if let Some(path) = update.path {
            w.path = path;
        }
        if let Some(function_id) = update.function_id {
            w.function_id = function_id;
        }
        if let Some(methods) = update.methods {
            w.methods = methods;
        }
        if let Some(verification) = update.verification {
            w.verification = verification;
        }
        if let Some(enabled) = update.enabled {
            w.enabled = enabled;
        }

        let methods = serde_json::to_string(&w.methods).map_err(|e| StoreError::Corrupt {
            field: "webhook methods",
            reason: e.to_string(),
        })?;
        let verification = w
            .verification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                field: "webhook verification",
                reason: e.to_string(),
            })?;
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE webhooks
                 SET path=?1, function_id=?2, methods=?3, verification=?4,
                     enabled=?5, updated_at=?6
                 WHERE id=?7",
                params![
                    w.path,
                    w.function_id,
                    methods,
                    verification,
                    w.enabled,
                    now_rfc3339(),
                    id,
                ],
            )
            .map(|_| ())
        })
        .map_err(|e| match e {
            StoreError::Database(ref inner) if is_constraint(inner) => StoreError::Conflict {
                kind: "webhook path",
                value: w.path.clone(),
            },
            other => other,
        })?;
        self.get_webhook(id)
    }

    pub fn delete_webhook(&self, id: &str) -> Result<bool> {
        let n = self.with_retry(|conn| {
            conn.execute("DELETE FROM webhooks WHERE id = ?1", params![id])
        })?;
        Ok(n > 0)
    }

    pub fn delete_manifest_webhooks(&self, function_id: &str) -> Result<usize> {
        self.with_retry(|conn| {
            conn.execute(
                "DELETE FROM webhooks WHERE function_id = ?1 AND managed_by = ?2",
                params![function_id, crate::MANAGED_BY_MANIFEST],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_lookup_and_method_allowlist() {
        let s = Store::open_in_memory().unwrap();
        let mut new = NewWebhook::new("github/push");
        new.methods = vec!["POST".into(), "PUT".into()];
        s.insert_webhook(new).unwrap();

        let hook = s.webhook_by_path("github/push").unwrap().unwrap();
        assert!(hook.allows_method("post"));
        assert!(hook.allows_method("PUT"));
        assert!(!hook.allows_method("GET"));

        assert!(s.webhook_by_path("unknown").unwrap().is_none());
    }

    #[test]
    fn duplicate_path_is_a_conflict() {
        let s = Store::open_in_memory().unwrap();
        s.insert_webhook(NewWebhook::new("stripe")).unwrap();
        let err = s.insert_webhook(NewWebhook::new("stripe")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn verification_round_trips() {
        let s = Store::open_in_memory().unwrap();
        let mut new = NewWebhook::new("signed");
        new.verification = Some(Verification {
            algorithm: SignatureAlgorithm::HmacSha256,
            header: "X-Signature".into(),
            secret: "shh".into(),
            skip_invalid: false,
        });
        let created = s.insert_webhook(new).unwrap();

        let v = created.verification.unwrap();
        assert_eq!(v.algorithm, SignatureAlgorithm::HmacSha256);
        assert_eq!(v.header, "X-Signature");

        // clearing via the double-Option update
        let cleared = s
            .update_webhook(
                &created.id,
                WebhookUpdate {
                    verification: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(cleared.verification.is_none());
    }
}
