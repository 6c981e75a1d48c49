use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// How many times an invocation chain may re-enter a function before the
/// dispatcher cancels the event.
pub const MAX_CHAIN_DEPTH: u32 = 8;

/// Top-level config (alyx.toml + ALYX_* env overrides).
///
/// Every knob has a default; a missing config file yields a fully working
/// single-node setup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlyxConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub functions: FunctionsConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Grace period for draining in-flight claims and subprocesses at shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionsConfig {
    /// Root directory scanned for per-function `alyx.toml` manifests.
    #[serde(default = "default_functions_dir")]
    pub dir: String,
    /// Production mode prefers built artifacts over interpreting source.
    #[serde(default)]
    pub production: bool,
    /// Debounce window for manifest hot reload, in milliseconds.
    #[serde(default = "default_watch_debounce")]
    pub watch_debounce_ms: u64,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            dir: default_functions_dir(),
            production: false,
            watch_debounce_ms: default_watch_debounce(),
        }
    }
}

/// Dispatcher pool and claim tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_bus_tick")]
    pub tick_ms: u64,
    /// A `processing` row older than this is handed back to `pending`:
    /// the at-least-once guarantee after a crashed claimer.
    #[serde(default = "default_reclaim")]
    pub reclaim_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            tick_ms: default_bus_tick(),
            reclaim_secs: default_reclaim(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Process-wide ceiling on concurrently running function subprocesses.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_sync_timeout")]
    pub default_sync_timeout_secs: u64,
    #[serde(default = "default_async_timeout")]
    pub default_async_timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL for a child past its deadline.
    #[serde(default = "default_term_grace")]
    pub term_grace_secs: u64,
    /// Lifetime of the internal callback token issued to each invocation.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Base URL children use to call back into the record store.
    #[serde(default = "default_alyx_url")]
    pub alyx_url: String,
    #[serde(default)]
    pub interpreters: Interpreters,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_sync_timeout_secs: default_sync_timeout(),
            default_async_timeout_secs: default_async_timeout(),
            term_grace_secs: default_term_grace(),
            token_ttl_secs: default_token_ttl(),
            alyx_url: default_alyx_url(),
            interpreters: Interpreters::default(),
        }
    }
}

/// Interpreter binaries, overridable for exotic installs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpreters {
    #[serde(default = "default_node")]
    pub node: String,
    #[serde(default = "default_deno")]
    pub deno: String,
    #[serde(default = "default_bun")]
    pub bun: String,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_go")]
    pub go: String,
}

impl Default for Interpreters {
    fn default() -> Self {
        Self {
            node: default_node(),
            deno: default_deno(),
            bun: default_bun(),
            python: default_python(),
            go: default_go(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_sched_tick")]
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_sched_tick(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Terminal events older than this are deleted by the sweep.
    #[serde(default = "default_event_retention")]
    pub events_days: u32,
    /// Execution log rows older than this are deleted by the sweep.
    #[serde(default = "default_execution_retention")]
    pub executions_days: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            events_days: default_event_retention(),
            executions_days: default_execution_retention(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.alyx/alyx.db")
}
fn default_functions_dir() -> String {
    "./functions".to_string()
}
fn default_watch_debounce() -> u64 {
    500
}
fn default_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    16
}
fn default_bus_tick() -> u64 {
    500
}
fn default_reclaim() -> u64 {
    300
}
fn default_max_concurrency() -> usize {
    16
}
fn default_sync_timeout() -> u64 {
    5
}
fn default_async_timeout() -> u64 {
    30
}
fn default_term_grace() -> u64 {
    5
}
fn default_token_ttl() -> u64 {
    300
}
fn default_alyx_url() -> String {
    format!("http://{}:{}", DEFAULT_BIND, DEFAULT_PORT)
}
fn default_node() -> String {
    "node".to_string()
}
fn default_deno() -> String {
    "deno".to_string()
}
fn default_bun() -> String {
    "bun".to_string()
}
fn default_python() -> String {
    "python3".to_string()
}
fn default_go() -> String {
    "go".to_string()
}
fn default_sched_tick() -> u64 {
    1000
}
fn default_event_retention() -> u32 {
    7
}
fn default_execution_retention() -> u32 {
    30
}
fn default_sweep_interval() -> u64 {
    3600
}

impl AlyxConfig {
    /// Load config from a TOML file with ALYX_* env var overrides.
    ///
    /// A missing file is not an error; defaults apply and env vars can
    /// still override individual keys.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: AlyxConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ALYX_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.alyx/alyx.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = AlyxConfig::default();
        assert_eq!(cfg.bus.workers, 4);
        assert_eq!(cfg.executor.max_concurrency, 16);
        assert_eq!(cfg.executor.default_sync_timeout_secs, 5);
        assert_eq!(cfg.executor.default_async_timeout_secs, 30);
        assert_eq!(cfg.retention.events_days, 7);
        assert_eq!(cfg.retention.executions_days, 30);
        assert_eq!(cfg.bus.reclaim_secs, 300);
        assert_eq!(cfg.server.shutdown_grace_secs, 30);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alyx.toml");
        std::fs::write(
            &path,
            "[bus]\nworkers = 8\n\n[retention]\nevents_days = 2\n",
        )
        .unwrap();

        let cfg = AlyxConfig::load(path.to_str()).unwrap();
        assert_eq!(cfg.bus.workers, 8);
        assert_eq!(cfg.retention.events_days, 2);
        // untouched sections keep their defaults
        assert_eq!(cfg.scheduler.tick_ms, 1000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = AlyxConfig::load(Some("/nonexistent/alyx.toml")).unwrap();
        assert_eq!(cfg.server.port, DEFAULT_PORT);
    }
}
