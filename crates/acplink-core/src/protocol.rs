//! JSON-RPC 2.0 message model
//!
//! Inbound frames are classified by their discriminator fields rather than by
//! an untagged serde guess, so that anything that is not a request, response
//! or notification becomes a structured [`ProtocolError`] at the boundary.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// JSON-RPC version
pub const JSONRPC_VERSION: &str = "2.0";

/// Request ID (can be string or number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Number ID
    Number(i64),
    /// String ID
    String(String),
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}

/// JSON-RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Optional parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Create a new request
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    /// Add parameters to the request
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Request ID this response corresponds to
    pub id: RequestId,
    /// Result (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (present on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
}

impl Response {
    /// Create a success response
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: impl Into<RequestId>, error: ProtocolError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Build a response from a handler outcome
    pub fn from_result(id: RequestId, outcome: Result<Value, ProtocolError>) -> Self {
        match outcome {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::error(id, err),
        }
    }

    /// Check if this is a success response
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Get the result, consuming the response
    pub fn into_result(self) -> Result<Value, ProtocolError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC notification (no id, no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Optional parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Create a new notification
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }

    /// Add parameters
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// Any JSON-RPC frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// Request message
    Request(Request),
    /// Response message
    Response(Response),
    /// Notification message (no id)
    Notification(Notification),
}

impl Message {
    /// Classify a decoded JSON value.
    ///
    /// `method` + `id` is a request, `method` alone is a notification, and
    /// `id` with `result` or `error` is a response. Everything else is an
    /// `Invalid request` error whose `data` names the problem.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Some(obj) = value.as_object() else {
            return Err(invalid_request("message is not a JSON object"));
        };

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => {
                return Err(invalid_request(&format!(
                    "unsupported jsonrpc version '{}'",
                    other
                )));
            }
            None => return Err(invalid_request("missing jsonrpc version")),
        }

        let has_method = obj.contains_key("method");
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());
        let has_outcome = obj.contains_key("result") || obj.contains_key("error");

        let decoded = match (has_method, has_id) {
            (true, true) => serde_json::from_value(value).map(Self::Request),
            (true, false) => serde_json::from_value(value).map(Self::Notification),
            (false, true) if has_outcome => serde_json::from_value(value).map(Self::Response),
            _ => return Err(invalid_request("unrecognized message kind")),
        };

        decoded.map_err(|e| invalid_request(&e.to_string()))
    }

    /// Parse one framed line
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line).map_err(|e| {
            ProtocolError::parse_error().with_data(Value::String(e.to_string()))
        })?;
        Self::from_value(value)
    }

    /// Check if this is a response
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    /// Check if this is a request
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Check if this is a notification
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification(_))
    }

    /// Get the message ID if present
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(res) => Some(&res.id),
            Self::Notification(_) => None,
        }
    }

    /// Get the method name if present
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

/// Id of a line that meant to be a request but does not decode as one.
///
/// Only frames carrying a `method` key and a string or number `id` qualify,
/// so malformed responses are never answered.
pub fn recoverable_request_id(line: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;
    if !obj.contains_key("method") {
        return None;
    }
    serde_json::from_value(obj.get("id")?.clone()).ok()
}

fn invalid_request(reason: &str) -> ProtocolError {
    ProtocolError::invalid_request().with_data(json!({ "reason": reason }))
}

/// Narrow raw parameters into a typed value.
///
/// Missing parameters decode as `null`, so `()` and `Option<T>` targets
/// accept notifications sent without `params`. Failures become
/// `Invalid params`; an unknown tag of an internally tagged enum is reported
/// as an unrecognized variant.
pub fn decode_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ProtocolError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| {
        let detail = e.to_string();
        let reason = if detail.contains("unknown variant") {
            "unrecognized variant"
        } else {
            "invalid parameters"
        };
        ProtocolError::invalid_params().with_data(json!({ "reason": reason, "detail": detail }))
    })
}

/// Encode a typed value as JSON-RPC params
pub fn encode_params<T: Serialize>(params: &T) -> Result<Option<Value>, serde_json::Error> {
    let value = serde_json::to_value(params)?;
    Ok(if value.is_null() { None } else { Some(value) })
}
