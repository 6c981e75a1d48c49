use alyx_bus::derive_request_id;
use alyx_core::types::{new_id, EventType};
use alyx_store::{EventDraft, EventMeta};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::triggers::{PreparedPublish, SourceTriggers};

/// The three record-store mutations hooks can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for RecordAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordAction::Insert => "insert",
            RecordAction::Update => "update",
            RecordAction::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// One pending record-store mutation, described before commit.
#[derive(Debug, Clone)]
pub struct RecordMutation {
    pub collection: String,
    pub action: RecordAction,
    pub document: Value,
    pub previous: Option<Value>,
    pub changed_fields: Vec<String>,
}

/// Who caused this mutation, when it came from inside a function execution.
/// Extends the cycle-detection chain of the resulting event.
#[derive(Debug, Clone)]
pub struct MutationOrigin {
    pub meta: EventMeta,
    pub function_id: String,
}

impl SourceTriggers {
    /// Run the mutation's sync hooks inside the caller's transaction scope
    /// and hand back the event to publish after commit.
    ///
    /// On `Err(Rejected)` the caller must abort its transaction; the error
    /// carries the hook's own code and message for the API response.
    pub async fn prepare_record_mutation(
        &self,
        mutation: &RecordMutation,
        origin: Option<&MutationOrigin>,
    ) -> Result<PreparedPublish> {
        let payload = json!({
            "document": mutation.document,
            "previous_document": mutation.previous,
            "action": mutation.action.to_string(),
            "collection": mutation.collection,
            "changed_fields": mutation.changed_fields,
        });

        let event_id = new_id();
        let mut draft = EventDraft::new(
            EventType::Database,
            mutation.collection.clone(),
            mutation.action.to_string(),
            payload.clone(),
        )
        .with_id(event_id.clone());

        let meta = match origin {
            Some(origin) => origin.meta.child(&origin.function_id, EventType::Database),
            None => EventMeta::new(derive_request_id(&draft)),
        };
        draft = draft.with_metadata(meta.clone());

        let (sync_hooks, _) = self.registry.find_matches_split(
            EventType::Database,
            &mutation.collection,
            &mutation.action.to_string(),
        );
        self.run_sync_hooks(&sync_hooks, &payload, &meta, "database", &event_id)
            .await?;

        Ok(PreparedPublish { draft })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_render_lowercase() {
        assert_eq!(RecordAction::Insert.to_string(), "insert");
        assert_eq!(RecordAction::Update.to_string(), "update");
        assert_eq!(RecordAction::Delete.to_string(), "delete");
    }
}
