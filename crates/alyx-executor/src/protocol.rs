//! The stable JSON wire protocol between Alyx and function subprocesses.
//!
//! The parent writes one request object to the child's stdin and closes it;
//! the child writes one response object to stdout and exits. These shapes
//! are the compatibility contract; internal representation may evolve,
//! the wire may not.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parent → child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub request_id: String,
    pub function: String,
    pub input: Value,
    pub context: InvokeContext,
}

/// Execution context handed to the child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeContext {
    /// Authenticated principal of the originating request, when any.
    pub auth: Option<Value>,
    /// Environment from the function's manifest declaration.
    pub env: HashMap<String, String>,
    /// Base URL for calling back into the record store.
    pub alyx_url: String,
    /// Short-lived bearer token bound to this invocation's function.
    pub internal_token: String,
}

/// Child → parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
}

/// Error shape on the wire and in execution logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl WireError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
