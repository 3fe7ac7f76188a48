//! JSON-lines wire format.
//!
//! Requests, one per line on stdin:
//!
//! ```json
//! {"id": 1, "method": "run", "params": {"host": "web1", "command": "uptime"}}
//! ```
//!
//! Responses, one per line on stdout, in completion order:
//!
//! ```json
//! {"id": 1, "ok": true, "result": {...}}
//! {"id": 1, "ok": false, "error": {"kind": "UnknownHost", "message": "..."}}
//! ```
//!
//! A `run` with `"stream": true` also emits `{"id": 1, "stream": "stdout",
//! "data": "..."}` lines before its response.

use outpost_core::transport::StreamKind;
use outpost_core::RemoteError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("InvalidRequest", message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new("InvalidParams", message)
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new("UnknownMethod", format!("Unknown method: {method}"))
    }
}

impl From<RemoteError> for ErrorBody {
    fn from(err: RemoteError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Success { id: Value, ok: bool, result: Value },
    Failure { id: Value, ok: bool, error: ErrorBody },
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Response::Success {
            id,
            ok: true,
            result,
        }
    }

    pub fn failure(id: Value, error: ErrorBody) -> Self {
        Response::Failure {
            id,
            ok: false,
            error,
        }
    }

    pub fn from_outcome(id: Value, outcome: Result<Value, ErrorBody>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(error) => Self::failure(id, error),
        }
    }
}

/// Output chunk forwarded while a streaming `run` is in flight.
#[derive(Debug, Serialize)]
pub struct StreamEvent {
    pub id: Value,
    pub stream: StreamKind,
    pub data: String,
}

// ============================================================================
// PARAMS
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    pub host: String,
    pub command: String,
    /// Arm a hang watchdog and report alerts with the result.
    #[serde(default)]
    pub monitor: bool,
    /// Emit stream events for output as it arrives.
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct HostParams {
    pub host: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OptionalHostParams {
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JobStartParams {
    pub host: String,
    pub command: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IdParams {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct JobOutputParams {
    pub id: String,
    #[serde(default)]
    pub tail: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PathParams {
    pub host: String,
    pub path: String,
}

fn default_snapshot_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct SnapshotListParams {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_snapshot_limit")]
    pub limit: usize,
}

/// Decode method params, treating a missing `params` as `{}`.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ErrorBody> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| ErrorBody::invalid_params(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_without_params() {
        let req: Request = serde_json::from_str(r#"{"id":7,"method":"job_list"}"#).unwrap();
        assert_eq!(req.id, json!(7));
        assert!(req.params.is_null());
        let params: OptionalHostParams = parse_params(req.params).unwrap();
        assert!(params.host.is_none());
    }

    #[test]
    fn missing_required_param_is_invalid() {
        let err = parse_params::<HostParams>(json!({})).unwrap_err();
        assert_eq!(err.kind, "InvalidParams");
        assert!(err.message.contains("host"));
    }

    #[test]
    fn snapshot_list_limit_defaults() {
        let params: SnapshotListParams = parse_params(json!({"host": "web1"})).unwrap();
        assert_eq!(params.limit, 20);
    }

    #[test]
    fn responses_serialize_flat() {
        let ok = serde_json::to_value(Response::success(json!(1), json!({"x": 1}))).unwrap();
        assert_eq!(ok, json!({"id": 1, "ok": true, "result": {"x": 1}}));

        let err = serde_json::to_value(Response::from_outcome(
            json!("a"),
            Err(RemoteError::JobNotFound("job-1".to_string()).into()),
        ))
        .unwrap();
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"]["kind"], "JobNotFound");
        assert_eq!(err["error"]["message"], "Job not found: job-1");
    }
}
