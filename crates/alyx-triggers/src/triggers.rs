use std::sync::Arc;

use alyx_bus::EventBus;
use alyx_executor::{Executor, FunctionIndex};
use alyx_hooks::HookRegistry;
use alyx_store::{Event, EventDraft, Store};
use tracing::debug;

use crate::error::Result;

/// A mutation's event, held back until the outer transaction commits.
///
/// Sync hooks already ran when this exists; publishing is the async half.
/// Dropping it without publishing is the abort path; nothing was enqueued.
#[derive(Debug)]
pub struct PreparedPublish {
    pub(crate) draft: EventDraft,
}

impl PreparedPublish {
    /// The pre-assigned event id sync executions were logged against.
    pub fn event_id(&self) -> &str {
        self.draft.id.as_deref().unwrap_or("")
    }
}

/// Shared adapter state for both trigger families.
pub struct SourceTriggers {
    pub(crate) registry: Arc<HookRegistry>,
    pub(crate) executor: Arc<Executor>,
    pub(crate) functions: Arc<FunctionIndex>,
    pub(crate) store: Arc<Store>,
    pub(crate) bus: Arc<EventBus>,
}

impl SourceTriggers {
    pub fn new(
        registry: Arc<HookRegistry>,
        executor: Arc<Executor>,
        functions: Arc<FunctionIndex>,
        store: Arc<Store>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            executor,
            functions,
            store,
            bus,
        }
    }

    /// Publish the held-back event. Call only after the outer operation
    /// committed; a failed commit suppresses async publication by never
    /// calling this.
    pub fn publish_after_commit(&self, prepared: PreparedPublish) -> Result<Event> {
        let event = self.bus.publish(prepared.draft)?;
        debug!(event_id = %event.id, "post-commit event published");
        Ok(event)
    }
}
