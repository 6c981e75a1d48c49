use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alyx_core::config::ExecutorConfig;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::descriptor::{FunctionDescriptor, Runtime};
use crate::error::{ExecutorError, Result};
use crate::protocol::{InvokeContext, InvokeRequest, InvokeResponse, WireError};
use crate::token::TokenVault;

/// Terminal state of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeStatus {
    Success,
    Failed,
    TimedOut,
}

/// What one subprocess run produced.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub status: InvokeStatus,
    pub output: Option<Value>,
    pub error: Option<WireError>,
    /// Captured stderr lines, then any lines the child reported in its
    /// response envelope.
    pub logs: Vec<String>,
    pub duration_ms: i64,
}

/// Runs functions as one-shot subprocesses. No pooling; concurrency is
/// bounded by a process-wide semaphore so the dispatcher back-pressures
/// instead of spawning without limit.
pub struct Executor {
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    tokens: TokenVault,
    production: bool,
}

impl Executor {
    pub fn new(config: ExecutorConfig, production: bool) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        let tokens = TokenVault::new(Duration::from_secs(config.token_ttl_secs));
        Self {
            config,
            permits,
            tokens,
            production,
        }
    }

    pub fn tokens(&self) -> &TokenVault {
        &self.tokens
    }

    /// Default deadline for hooks that do not override it.
    pub fn default_timeout(&self, sync: bool) -> Duration {
        if sync {
            Duration::from_secs(self.config.default_sync_timeout_secs)
        } else {
            Duration::from_secs(self.config.default_async_timeout_secs)
        }
    }

    /// Run one function to completion or deadline.
    ///
    /// Blocking on the concurrency semaphore is deliberate: exceeding the
    /// ceiling stalls the caller rather than forking unbounded children.
    pub async fn invoke(
        &self,
        descriptor: &FunctionDescriptor,
        request_id: &str,
        input: Value,
        auth: Option<Value>,
        deadline: Duration,
    ) -> Result<InvokeOutcome> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ExecutorError::ShuttingDown)?;

        let token = self.tokens.issue(&descriptor.name);
        let request = InvokeRequest {
            request_id: request_id.to_string(),
            function: descriptor.name.clone(),
            input,
            context: InvokeContext {
                auth,
                env: descriptor.env.clone(),
                alyx_url: self.config.alyx_url.clone(),
                internal_token: token.clone(),
            },
        };
        let request_json = serde_json::to_vec(&request)?;

        let outcome = self
            .run_child(descriptor, &request_json, deadline)
            .await;

        // Token lifetime is the process lifetime.
        self.tokens.revoke(&token);
        outcome
    }

    async fn run_child(
        &self,
        descriptor: &FunctionDescriptor,
        request_json: &[u8],
        deadline: Duration,
    ) -> Result<InvokeOutcome> {
        let (program, args) = self.program_for(descriptor);
        debug!(
            function = %descriptor.name,
            %program,
            timeout_ms = deadline.as_millis() as u64,
            "spawning function subprocess"
        );

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Write the request and close stdin so the child sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request_json).await?;
            drop(stdin);
        }

        let mut stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut captured = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                captured.push(line);
            }
            captured
        });

        let started = Instant::now();
        let exit = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(status) => Some(status?),
            Err(_) => {
                self.escalate_kill(&mut child, &descriptor.name).await;
                None
            }
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let stdout = stdout_task.await.unwrap_or_default();
        let logs = stderr_task.await.unwrap_or_default();

        let outcome = match exit {
            None => InvokeOutcome {
                status: InvokeStatus::TimedOut,
                output: None,
                error: Some(WireError::new(
                    "TIMEOUT",
                    format!(
                        "function {} exceeded its {}ms deadline",
                        descriptor.name,
                        deadline.as_millis()
                    ),
                )),
                logs,
                duration_ms,
            },
            Some(status) => parse_outcome(status.success(), &stdout, logs, duration_ms),
        };
        Ok(outcome)
    }

    /// SIGTERM first; SIGKILL if the child is still alive after the grace
    /// window.
    async fn escalate_kill(&self, child: &mut Child, function: &str) {
        warn!(%function, "deadline exceeded, terminating child");
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        let grace = Duration::from_secs(self.config.term_grace_secs);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!(%function, "child ignored SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }

    /// Resolve program and arguments for a descriptor.
    ///
    /// Development mode always interprets the source file. Production mode
    /// prefers the built artifact: directly when executable, otherwise via
    /// the declared interpreter. Binary functions run their path as-is.
    fn program_for(&self, descriptor: &FunctionDescriptor) -> (String, Vec<String>) {
        let interp = &self.config.interpreters;

        if descriptor.runtime == Runtime::Binary {
            return (descriptor.source_path.display().to_string(), vec![]);
        }

        let path = if self.production && descriptor.has_build {
            let output = descriptor
                .output_path
                .as_deref()
                .unwrap_or(&descriptor.source_path);
            if is_executable(output) {
                return (output.display().to_string(), vec![]);
            }
            output
        } else {
            &descriptor.source_path
        };
        let path = path.display().to_string();

        match descriptor.runtime {
            Runtime::Node => (interp.node.clone(), vec![path]),
            Runtime::Deno => (
                interp.deno.clone(),
                vec!["run".to_string(), "--allow-all".to_string(), path],
            ),
            Runtime::Bun => (interp.bun.clone(), vec!["run".to_string(), path]),
            Runtime::Python => (interp.python.clone(), vec![path]),
            Runtime::Go => (interp.go.clone(), vec!["run".to_string(), path]),
            Runtime::Binary => unreachable!("handled above"),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Map exit status and captured stdout onto an outcome per the protocol:
/// parseable response wins; otherwise non-zero exit is a runtime error and
/// a clean exit with garbage stdout is a protocol error.
fn parse_outcome(
    exited_ok: bool,
    stdout: &str,
    mut logs: Vec<String>,
    duration_ms: i64,
) -> InvokeOutcome {
    match serde_json::from_str::<InvokeResponse>(stdout.trim()) {
        Ok(response) => {
            if let Some(extra) = response.logs {
                logs.extend(extra);
            }
            if response.success {
                InvokeOutcome {
                    status: InvokeStatus::Success,
                    output: response.output,
                    error: None,
                    logs,
                    duration_ms,
                }
            } else {
                let error = response.error.unwrap_or_else(|| {
                    WireError::new("RUNTIME_ERROR", "function reported failure")
                });
                InvokeOutcome {
                    status: InvokeStatus::Failed,
                    output: response.output,
                    error: Some(error),
                    logs,
                    duration_ms,
                }
            }
        }
        Err(_) if !exited_ok => {
            let tail = stderr_tail(&logs);
            InvokeOutcome {
                status: InvokeStatus::Failed,
                output: None,
                error: Some(WireError::new(
                    "RUNTIME_ERROR",
                    if tail.is_empty() {
                        "function exited with a non-zero status".to_string()
                    } else {
                        tail
                    },
                )),
                logs,
                duration_ms,
            }
        }
        Err(_) => InvokeOutcome {
            status: InvokeStatus::Failed,
            output: None,
            error: Some(WireError::new(
                "PROTOCOL_ERROR",
                "function exited cleanly but produced unparseable output",
            )),
            logs,
            duration_ms,
        },
    }
}

fn stderr_tail(logs: &[String]) -> String {
    let tail_start = logs.len().saturating_sub(5);
    logs[tail_start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_success_response() {
        let stdout = r#"{"request_id":"r1","success":true,"output":{"sent":1},"logs":["hi"]}"#;
        let outcome = parse_outcome(true, stdout, vec!["stderr line".into()], 10);
        assert_eq!(outcome.status, InvokeStatus::Success);
        assert_eq!(outcome.output, Some(serde_json::json!({"sent": 1})));
        assert_eq!(outcome.logs, vec!["stderr line", "hi"]);
    }

    #[test]
    fn parse_reported_failure() {
        let stdout =
            r#"{"request_id":"r1","success":false,"error":{"code":"DENIED","message":"blocked"}}"#;
        let outcome = parse_outcome(true, stdout, vec![], 10);
        assert_eq!(outcome.status, InvokeStatus::Failed);
        let err = outcome.error.unwrap();
        assert_eq!(err.code, "DENIED");
        assert_eq!(err.message, "blocked");
    }

    #[test]
    fn nonzero_exit_without_json_is_runtime_error() {
        let logs = vec!["Traceback:".to_string(), "boom".to_string()];
        let outcome = parse_outcome(false, "", logs, 10);
        assert_eq!(outcome.status, InvokeStatus::Failed);
        let err = outcome.error.unwrap();
        assert_eq!(err.code, "RUNTIME_ERROR");
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn clean_exit_with_garbage_is_protocol_error() {
        let outcome = parse_outcome(true, "hello world", vec![], 10);
        assert_eq!(outcome.status, InvokeStatus::Failed);
        assert_eq!(outcome.error.unwrap().code, "PROTOCOL_ERROR");
    }

    #[test]
    fn parseable_json_wins_over_nonzero_exit() {
        let stdout =
            r#"{"request_id":"r1","success":false,"error":{"code":"E","message":"m"}}"#;
        let outcome = parse_outcome(false, stdout, vec![], 10);
        assert_eq!(outcome.error.unwrap().code, "E");
    }
}
