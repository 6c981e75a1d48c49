use std::sync::Arc;
use std::time::Duration;

use alyx_core::config::MAX_CHAIN_DEPTH;
use alyx_executor::{InvokeStatus, WireError};
use alyx_store::{
    redact, Event, EventOutcome, EventStatus, ExecutionStatus, Hook, NewExecution,
};
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bus::EventBus;
use crate::error::Result;

/// One cooperative worker: wait tick → claim batch → dispatch each → repeat.
/// Exits when the shutdown token fires, after finishing its current batch.
pub(crate) async fn worker_loop(bus: Arc<EventBus>, worker: usize, shutdown: CancellationToken) {
    debug!(worker, "dispatcher worker started");
    let mut tick = tokio::time::interval(Duration::from_millis(bus.config.tick_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                // Drain until the queue is momentarily empty; a full batch
                // means more work is probably waiting.
                loop {
                    match bus.drain_once().await {
                        Ok(0) => break,
                        Ok(_) if shutdown.is_cancelled() => break,
                        Ok(_) => continue,
                        Err(e) => {
                            // Dispatcher errors never crash the loop.
                            error!(worker, "dispatch cycle failed: {e}");
                            break;
                        }
                    }
                }
            }
            _ = shutdown.cancelled() => {
                debug!(worker, "dispatcher worker shutting down");
                break;
            }
        }
    }
}

pub(crate) async fn drain_once(bus: &EventBus) -> Result<usize> {
    let batch = bus.store.claim_batch(
        bus.config.batch_size,
        Utc::now(),
        Duration::from_secs(bus.config.reclaim_secs),
    )?;
    let count = batch.len();
    for event in batch {
        dispatch_event(bus, event).await?;
    }
    Ok(count)
}

/// Settle one claimed event: cycle check, hook matching, async fan-out,
/// terminal status.
async fn dispatch_event(bus: &EventBus, event: Event) -> Result<()> {
    // Cycle prevention: a chain that has re-entered functions this deep is
    // runaway recursion. Cancel before any hook runs.
    if event.metadata.depth >= MAX_CHAIN_DEPTH {
        warn!(
            event_id = %event.id,
            depth = event.metadata.depth,
            chain = ?event.metadata.origin_chain,
            "recursion bound reached, cancelling event"
        );
        bus.store
            .cancel_event_with_reason(&event.id, "CYCLE_DETECTED", Utc::now())?;
        bus.notify_completion(&event, EventStatus::Cancelled);
        return Ok(());
    }

    let (sync_hooks, async_hooks) =
        bus.registry
            .find_matches_split(event.event_type, &event.source, &event.action);

    // Sync bindings only run where a publisher blocks on them (source
    // triggers). A queued event has no one waiting, so they are skipped.
    if !sync_hooks.is_empty() {
        debug!(
            event_id = %event.id,
            skipped = sync_hooks.len(),
            "sync hooks matched a queued event; they only run inline at the source"
        );
    }

    if async_hooks.is_empty() {
        debug!(event_id = %event.id, "no async hooks matched");
        bus.store
            .complete_event(&event.id, EventOutcome::Completed, Utc::now())?;
        bus.notify_completion(&event, EventStatus::Completed);
        return Ok(());
    }

    // Concurrent fan-out; the executor's semaphore bounds real parallelism.
    let runs = async_hooks
        .iter()
        .map(|hook| run_hook(bus, &event, hook))
        .collect::<Vec<_>>();
    let results = join_all(runs).await;
    let all_ok = results.iter().all(|ok| *ok);

    let (outcome, status) = if all_ok {
        (EventOutcome::Completed, EventStatus::Completed)
    } else {
        (EventOutcome::Failed, EventStatus::Failed)
    };
    bus.store.complete_event(&event.id, outcome, Utc::now())?;
    bus.notify_completion(&event, status);
    Ok(())
}

/// Invoke one hook's function for one event, recording the execution log
/// rows around the run. Returns whether the invocation succeeded. Never
/// propagates hook errors; they land in the log and fail the event.
async fn run_hook(bus: &EventBus, event: &Event, hook: &Hook) -> bool {
    let Some(descriptor) = bus.functions.get(&hook.function_id) else {
        warn!(
            hook = %hook.name,
            function = %hook.function_id,
            "hook references a function that is not loaded"
        );
        record_unrunnable(bus, event, hook, "function not loaded");
        return false;
    };

    let input = merged_input(&event.payload, hook.config.input.as_ref());
    let record = match bus.store.append_execution(NewExecution {
        function_id: hook.function_id.clone(),
        request_id: event.metadata.request_id.clone(),
        trigger_type: event.event_type.to_string(),
        trigger_id: event.id.clone(),
        input: Some(redact(&input, &descriptor.redact)),
    }) {
        Ok(record) => record,
        Err(e) => {
            error!(hook = %hook.name, "failed to append execution log: {e}");
            return false;
        }
    };

    let timeout = hook
        .config
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| bus.executor.default_timeout(false));

    if let Err(e) = bus.store.mark_execution_running(&record.id) {
        error!(execution = %record.id, "failed to mark execution running: {e}");
    }

    let outcome = bus
        .executor
        .invoke(&descriptor, &event.metadata.request_id, input, None, timeout)
        .await;

    match outcome {
        Ok(outcome) => {
            let status = match outcome.status {
                InvokeStatus::Success => ExecutionStatus::Success,
                InvokeStatus::Failed => ExecutionStatus::Failed,
                InvokeStatus::TimedOut => ExecutionStatus::TimedOut,
            };
            let error_text = outcome
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.code, e.message));
            if let Err(e) = bus.store.finish_execution(
                &record.id,
                status,
                outcome.output.as_ref(),
                error_text.as_deref(),
                &outcome.logs,
                outcome.duration_ms,
            ) {
                error!(execution = %record.id, "failed to finish execution log: {e}");
            }
            status == ExecutionStatus::Success
        }
        Err(e) => {
            let wire = WireError::new(e.code(), e.to_string());
            if let Err(log_err) = bus.store.finish_execution(
                &record.id,
                ExecutionStatus::Failed,
                None,
                Some(&format!("{}: {}", wire.code, wire.message)),
                &[],
                0,
            ) {
                error!(execution = %record.id, "failed to finish execution log: {log_err}");
            }
            false
        }
    }
}

fn record_unrunnable(bus: &EventBus, event: &Event, hook: &Hook, reason: &str) {
    let appended = bus.store.append_execution(NewExecution {
        function_id: hook.function_id.clone(),
        request_id: event.metadata.request_id.clone(),
        trigger_type: event.event_type.to_string(),
        trigger_id: event.id.clone(),
        input: None,
    });
    match appended {
        Ok(record) => {
            let _ = bus.store.finish_execution(
                &record.id,
                ExecutionStatus::Failed,
                None,
                Some(&format!("VALIDATION: {reason}")),
                &[],
                0,
            );
        }
        Err(e) => error!(hook = %hook.name, "failed to record unrunnable hook: {e}"),
    }
}

/// Event payload with the hook's static `input` overlaid (shallow object
/// merge; hook keys win). Non-object combinations fall back to the hook
/// input replacing the payload.
fn merged_input(payload: &Value, hook_input: Option<&Value>) -> Value {
    match hook_input {
        None => payload.clone(),
        Some(extra) => match (payload, extra) {
            (Value::Object(base), Value::Object(overlay)) => {
                let mut merged = base.clone();
                for (k, v) in overlay {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            (_, replacement) => replacement.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overlays_hook_keys() {
        let payload = json!({"a": 1, "b": 2});
        let merged = merged_input(&payload, Some(&json!({"b": 9, "c": 3})));
        assert_eq!(merged, json!({"a": 1, "b": 9, "c": 3}));
    }

    #[test]
    fn merge_without_input_is_identity() {
        let payload = json!({"a": 1});
        assert_eq!(merged_input(&payload, None), payload);
    }

    #[test]
    fn non_object_input_replaces_payload() {
        let payload = json!({"a": 1});
        assert_eq!(merged_input(&payload, Some(&json!("static"))), json!("static"));
    }
}
