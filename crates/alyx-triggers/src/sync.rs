use std::time::Duration;

use alyx_executor::{ExecutorError, InvokeStatus};
use alyx_store::{
    redact, EventMeta, ExecutionStatus, Hook, NewExecution, OnFailure,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, TriggerError};
use crate::triggers::SourceTriggers;

impl SourceTriggers {
    /// Run sync hooks serially in priority order inside the caller's
    /// operation.
    ///
    /// Every hook sees the same read-only payload; outputs never feed back
    /// into the operation. The first rejecting failure aborts with
    /// [`TriggerError::Rejected`]. A hook bound to the function that
    /// caused this mutation is skipped; that is the sync half of cycle
    /// prevention.
    pub(crate) async fn run_sync_hooks(
        &self,
        hooks: &[Hook],
        payload: &Value,
        meta: &EventMeta,
        trigger_type: &str,
        trigger_id: &str,
    ) -> Result<()> {
        for hook in hooks {
            if meta.origin_function.as_deref() == Some(hook.function_id.as_str()) {
                debug!(
                    hook = %hook.name,
                    function = %hook.function_id,
                    "skipping sync hook: it originated this mutation"
                );
                continue;
            }

            let outcome = self
                .invoke_sync_hook(hook, payload, meta, trigger_type, trigger_id)
                .await?;
            if let Some((code, message)) = outcome {
                match hook.config.on_failure {
                    OnFailure::Reject => {
                        return Err(TriggerError::Rejected { code, message });
                    }
                    OnFailure::Continue => {
                        warn!(
                            hook = %hook.name,
                            code,
                            "sync hook failed, continuing per policy"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one sync hook. `Ok(None)` is success; `Ok(Some((code, message)))`
    /// is a hook failure for the caller's `on_failure` policy to judge.
    async fn invoke_sync_hook(
        &self,
        hook: &Hook,
        payload: &Value,
        meta: &EventMeta,
        trigger_type: &str,
        trigger_id: &str,
    ) -> Result<Option<(String, String)>> {
        let Some(descriptor) = self.functions.get(&hook.function_id) else {
            warn!(
                hook = %hook.name,
                function = %hook.function_id,
                "sync hook references a function that is not loaded"
            );
            return Ok(Some((
                "VALIDATION".to_string(),
                format!("function {} is not loaded", hook.function_id),
            )));
        };

        let record = self.store.append_execution(NewExecution {
            function_id: hook.function_id.clone(),
            request_id: meta.request_id.clone(),
            trigger_type: trigger_type.to_string(),
            trigger_id: trigger_id.to_string(),
            input: Some(redact(payload, &descriptor.redact)),
        })?;
        self.store.mark_execution_running(&record.id)?;

        let timeout = hook
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.executor.default_timeout(true));

        let invoked = self
            .executor
            .invoke(
                &descriptor,
                &meta.request_id,
                payload.clone(),
                None,
                timeout,
            )
            .await;

        match invoked {
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
                self.store.finish_execution(
                    &record.id,
                    status,
                    outcome.output.as_ref(),
                    error_text.as_deref(),
                    &outcome.logs,
                    outcome.duration_ms,
                )?;

                match outcome.status {
                    InvokeStatus::Success => Ok(None),
                    InvokeStatus::TimedOut => Ok(Some((
                        "TIMEOUT".to_string(),
                        format!("sync hook {} timed out", hook.name),
                    ))),
                    InvokeStatus::Failed => {
                        let (code, message) = outcome
                            .error
                            .map(|e| (e.code, e.message))
                            .unwrap_or_else(|| {
                                ("RUNTIME_ERROR".to_string(), "hook failed".to_string())
                            });
                        Ok(Some((code, message)))
                    }
                }
            }
            Err(ExecutorError::ShuttingDown) => {
                self.store.finish_execution(
                    &record.id,
                    ExecutionStatus::Cancelled,
                    None,
                    Some("CANCELLED: shutdown"),
                    &[],
                    0,
                )?;
                Err(TriggerError::Cancelled)
            }
            Err(e) => {
                self.store.finish_execution(
                    &record.id,
                    ExecutionStatus::Failed,
                    None,
                    Some(&format!("{}: {e}", e.code())),
                    &[],
                    0,
                )?;
                Ok(Some((e.code().to_string(), e.to_string())))
            }
        }
    }
}
