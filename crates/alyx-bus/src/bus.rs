use std::sync::Arc;

use alyx_core::config::{BusConfig, RetentionConfig};
use alyx_core::types::EventType;
use alyx_core::Supervisor;
use alyx_executor::{Executor, FunctionIndex};
use alyx_hooks::HookRegistry;
use alyx_store::{Event, EventDraft, EventMeta, EventStatus, Store};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::Result;
use crate::{dispatcher, sweeper};

/// Terminal-state notification emitted after the dispatcher settles an
/// event. The scheduler subscribes to drive overlap accounting and retries.
#[derive(Debug, Clone)]
pub struct EventCompletion {
    pub event_id: String,
    pub event_type: EventType,
    pub source: String,
    pub action: String,
    pub status: EventStatus,
    pub metadata: EventMeta,
}

/// The bus: one publish API plus the background machinery that drains the
/// queue. Shared as `Arc<EventBus>` across the process.
pub struct EventBus {
    pub(crate) store: Arc<Store>,
    pub(crate) registry: Arc<HookRegistry>,
    pub(crate) executor: Arc<Executor>,
    pub(crate) functions: Arc<FunctionIndex>,
    pub(crate) config: BusConfig,
    pub(crate) retention: RetentionConfig,
    pub(crate) completions: broadcast::Sender<EventCompletion>,
}

impl EventBus {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<HookRegistry>,
        executor: Arc<Executor>,
        functions: Arc<FunctionIndex>,
        config: BusConfig,
        retention: RetentionConfig,
    ) -> Self {
        let (completions, _) = broadcast::channel(256);
        Self {
            store,
            registry,
            executor,
            functions,
            config,
            retention,
            completions,
        }
    }

    /// Durably enqueue one event. Returns the persisted row; dispatch
    /// happens asynchronously unless `process_at` defers it further.
    pub fn publish(&self, draft: EventDraft) -> Result<Event> {
        let now = Utc::now();
        let metadata = match draft.metadata.clone() {
            Some(meta) => meta,
            None => EventMeta::new(derive_request_id(&draft)),
        };
        let event = draft.resolve(metadata, now);
        self.store.insert_event(&event)?;
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            action = %event.action,
            "event published"
        );
        Ok(event)
    }

    /// Subscribe to terminal-state notifications.
    pub fn completions(&self) -> broadcast::Receiver<EventCompletion> {
        self.completions.subscribe()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// Claim one batch and dispatch every event in it. Returns how many
    /// events were settled. The worker loops call this repeatedly; tests
    /// call it directly for deterministic draining.
    pub async fn drain_once(&self) -> Result<usize> {
        dispatcher::drain_once(self).await
    }

    /// Spawn the dispatcher pool and the retention sweeper under the
    /// supervisor.
    pub fn start(self: Arc<Self>, supervisor: &Supervisor) {
        info!(
            workers = self.config.workers,
            tick_ms = self.config.tick_ms,
            "starting event bus"
        );
        for worker in 0..self.config.workers {
            let bus = Arc::clone(&self);
            let token = supervisor.cancellation_token();
            supervisor.spawn(async move {
                dispatcher::worker_loop(bus, worker, token).await;
            });
        }
        let token = supervisor.cancellation_token();
        supervisor.spawn(async move {
            sweeper::sweep_loop(self, token).await;
        });
    }

    pub(crate) fn notify_completion(&self, event: &Event, status: EventStatus) {
        // Send failure only means no subscribers are listening right now.
        let _ = self.completions.send(EventCompletion {
            event_id: event.id.clone(),
            event_type: event.event_type,
            source: event.source.clone(),
            action: event.action.clone(),
            status,
            metadata: event.metadata.clone(),
        });
    }
}

/// Deterministic request id for publishers that did not supply one: the
/// same type, source, action and payload always map to the same id, which
/// makes execution logs correlate across retries of identical input.
pub fn derive_request_id(draft: &EventDraft) -> String {
    let mut hasher = Sha256::new();
    hasher.update(draft.event_type.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(draft.source.as_bytes());
    hasher.update(b"|");
    hasher.update(draft.action.as_bytes());
    hasher.update(b"|");
    hasher.update(draft.payload.to_string().as_bytes());
    let digest = hasher.finalize();
    format!("req_{}", hex::encode(&digest[..16]))
}
