//! Webhook ingress; `/webhooks/{path}`.
//!
//! The raw body bytes are used verbatim for signature verification; any
//! re-encoding would break HMAC. Verification failures either reject with
//! 401 or, for `skip_invalid` endpoints, still publish with
//! `verified=false` and the reason.

use std::collections::HashMap;
use std::sync::Arc;

use alyx_core::types::EventType;
use alyx_executor::{InvokeOutcome, InvokeStatus};
use alyx_store::{
    redact, EventDraft, NewExecution, SignatureAlgorithm, Verification, WebhookEndpoint,
};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{info, warn};

use crate::app::AppState;
use crate::http::error::{ApiError, ApiResult};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// ANY /webhooks/{*path}
pub async fn receive(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let path = path.trim_matches('/').to_string();
    let endpoint = state
        .store
        .webhook_by_path(&path)?
        .filter(|e| e.enabled)
        .ok_or_else(|| ApiError::not_found("webhook", &path))?;

    if !endpoint.allows_method(method.as_str()) {
        return Err(ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            format!("{} is not allowed on /webhooks/{}", method, path),
        ));
    }

    info!(path = %path, method = %method, bytes = body.len(), "webhook delivery arrived");

    // Verify against the raw bytes before any parsing.
    let (verified, verify_error) = match endpoint.verification.as_ref() {
        None => (true, None),
        Some(verification) => match verify_signature(verification, &headers, &body) {
            Ok(()) => (true, None),
            Err(reason) => {
                warn!(path = %path, reason = %reason, "webhook signature rejected");
                if verification.skip_invalid {
                    (false, Some(reason))
                } else {
                    return Err(ApiError::new(
                        StatusCode::UNAUTHORIZED,
                        "VERIFICATION_FAILED",
                        reason,
                    ));
                }
            }
        },
    };

    let mut payload = json!({
        "method": method.as_str(),
        "path": path,
        "headers": headers_to_map(&headers),
        "raw_body": String::from_utf8_lossy(&body).into_owned(),
        "query": query_to_map(&uri),
        "verified": verified,
        "webhook_id": endpoint.id,
    });
    if let Some(reason) = verify_error {
        payload["error"] = json!(reason);
    }

    let event = state.bus.publish(EventDraft::new(
        EventType::Webhook,
        path.clone(),
        method.as_str().to_lowercase(),
        payload.clone(),
    ))?;

    // Webhooks are sync by construction: the response comes from the bound
    // function when there is one, otherwise a bare 204.
    match endpoint.function_id.as_deref() {
        None => Ok(StatusCode::NO_CONTENT.into_response()),
        Some(function_id) => {
            let outcome =
                invoke_endpoint_function(&state, &endpoint, function_id, &event.id, &event.metadata.request_id, payload)
                    .await?;
            Ok(function_response(outcome))
        }
    }
}

/// Run the endpoint's function and record the invocation in the execution
/// log, exactly like a dispatched hook would be.
async fn invoke_endpoint_function(
    state: &Arc<AppState>,
    endpoint: &WebhookEndpoint,
    function_id: &str,
    event_id: &str,
    request_id: &str,
    payload: Value,
) -> ApiResult<InvokeOutcome> {
    let Some(descriptor) = state.functions.get(function_id) else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!(
                "webhook {} is bound to function {function_id}, which is not loaded",
                endpoint.path
            ),
        ));
    };

    let record = state.store.append_execution(NewExecution {
        function_id: function_id.to_string(),
        request_id: request_id.to_string(),
        trigger_type: "webhook".to_string(),
        trigger_id: event_id.to_string(),
        input: Some(redact(&payload, &descriptor.redact)),
    })?;
    state.store.mark_execution_running(&record.id)?;

    let outcome = state
        .executor
        .invoke(&descriptor, request_id, payload, None, descriptor.timeout)
        .await
        .map_err(|e| ApiError::from_code(e.code(), e.to_string()))?;

    let status = match outcome.status {
        InvokeStatus::Success => alyx_store::ExecutionStatus::Success,
        InvokeStatus::Failed => alyx_store::ExecutionStatus::Failed,
        InvokeStatus::TimedOut => alyx_store::ExecutionStatus::TimedOut,
    };
    let error_text = outcome
        .error
        .as_ref()
        .map(|e| format!("{}: {}", e.code, e.message));
    state.store.finish_execution(
        &record.id,
        status,
        outcome.output.as_ref(),
        error_text.as_deref(),
        &outcome.logs,
        outcome.duration_ms,
    )?;
    Ok(outcome)
}

/// Map the function's response onto HTTP. An object output may steer the
/// status and body via `{status, body}`; anything else is returned as JSON.
fn function_response(outcome: InvokeOutcome) -> Response {
    match outcome.status {
        InvokeStatus::Success => match outcome.output {
            None => StatusCode::NO_CONTENT.into_response(),
            Some(Value::Object(ref obj))
                if obj.contains_key("status") || obj.contains_key("body") =>
            {
                let status = obj
                    .get("status")
                    .and_then(|s| s.as_u64())
                    .and_then(|s| StatusCode::from_u16(s as u16).ok())
                    .unwrap_or(StatusCode::OK);
                let body = obj.get("body").cloned().unwrap_or(Value::Null);
                (status, Json(body)).into_response()
            }
            Some(output) => (StatusCode::OK, Json(output)).into_response(),
        },
        InvokeStatus::TimedOut => ApiError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "TIMEOUT",
            "webhook function exceeded its deadline",
        )
        .into_response(),
        InvokeStatus::Failed => {
            let (code, message) = outcome
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or_else(|| ("RUNTIME_ERROR".to_string(), "function failed".to_string()));
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, code, message).into_response()
        }
    }
}

/// Constant-time HMAC check of the raw body. The header value may carry an
/// algorithm prefix (`sha256=...`) and surrounding whitespace; both are
/// tolerated. Any mismatching byte fails.
fn verify_signature(
    verification: &Verification,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), String> {
    let header_name = HeaderName::from_bytes(verification.header.as_bytes())
        .map_err(|_| format!("invalid signature header name '{}'", verification.header))?;
    let value = headers
        .get(&header_name)
        .ok_or_else(|| format!("missing {} header", verification.header))?
        .to_str()
        .map_err(|_| "signature header is not valid text".to_string())?
        .trim();

    let hex_part = value
        .strip_prefix("sha256=")
        .or_else(|| value.strip_prefix("sha1="))
        .unwrap_or(value)
        .trim();
    let expected =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    match verification.algorithm {
        SignatureAlgorithm::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(verification.secret.as_bytes())
                .map_err(|_| "invalid HMAC key".to_string())?;
            mac.update(body);
            mac.verify_slice(&expected)
                .map_err(|_| "HMAC signature mismatch".to_string())
        }
        SignatureAlgorithm::HmacSha1 => {
            let mut mac = HmacSha1::new_from_slice(verification.secret.as_bytes())
                .map_err(|_| "invalid HMAC key".to_string())?;
            mac.update(body);
            mac.verify_slice(&expected)
                .map_err(|_| "HMAC signature mismatch".to_string())
        }
    }
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn query_to_map(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default()
}
