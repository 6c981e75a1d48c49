use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One function's `alyx.toml`, as written by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Omitted: detected from the entry file's extension.
    #[serde(default)]
    pub runtime: Option<String>,
    /// Source file, relative to the function directory.
    pub entry: String,
    /// Built artifact, relative to the function directory.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Dotted payload paths redacted from stored execution inputs.
    #[serde(default)]
    pub redact: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<ManifestHook>,
    #[serde(default)]
    pub schedules: Vec<ManifestSchedule>,
    #[serde(default)]
    pub routes: Vec<ManifestRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestHook {
    pub name: String,
    pub event_type: String,
    #[serde(default = "wildcard")]
    pub source: String,
    #[serde(default = "wildcard")]
    pub action: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSchedule {
    pub name: String,
    pub kind: String,
    pub expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub skip_if_running: Option<bool>,
    #[serde(default)]
    pub max_overlap: Option<u32>,
    #[serde(default)]
    pub retry_on_failure: Option<bool>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRoute {
    /// Path under `/webhooks/`.
    pub path: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub verification: Option<ManifestVerification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestVerification {
    /// `hmac-sha1` or `hmac-sha256`.
    pub algorithm: String,
    pub header: String,
    pub secret: String,
    #[serde(default)]
    pub skip_invalid: bool,
}

fn wildcard() -> String {
    "*".to_string()
}
fn default_mode() -> String {
    "async".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_methods() -> Vec<String> {
    vec!["POST".to_string()]
}
