//! JSON-RPC error object carried on the wire

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric error codes used in JSON-RPC error responses.
///
/// The first five are the standard JSON-RPC 2.0 codes. The remainder sit in
/// the implementation-defined server range and carry protocol-level domain
/// failures.
pub mod codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Authentication is required before this method may be called
    pub const AUTH_REQUIRED: i32 = -32000;
    /// The connection failed to initialize
    pub const INITIALIZATION_ERROR: i32 = -32001;
    /// The caller is not authorized
    pub const UNAUTHORIZED: i32 = -32002;
    /// The caller is authenticated but not allowed
    pub const FORBIDDEN: i32 = -32003;
    /// The referenced entity does not exist
    pub const NOT_FOUND: i32 = -32004;
    /// The request conflicts with current state
    pub const CONFLICT: i32 = -32005;
    /// The caller is being rate limited
    pub const TOO_MANY_REQUESTS: i32 = -32006;
    /// The peer hit an unexpected failure
    pub const INTERNAL_SERVER_ERROR: i32 = -32007;
}

/// Structured JSON-RPC error (`{code, message, data?}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProtocolError {
    /// Create a new error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Add data to the error
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parse error (-32700)
    pub fn parse_error() -> Self {
        Self::new(codes::PARSE_ERROR, "Parse error")
    }

    /// Invalid request (-32600)
    pub fn invalid_request() -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid request")
    }

    /// Method not found (-32601)
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found")
            .with_data(Value::String(method.to_string()))
    }

    /// Invalid params (-32602)
    pub fn invalid_params() -> Self {
        Self::new(codes::INVALID_PARAMS, "Invalid params")
    }

    /// Internal error (-32603)
    pub fn internal_error() -> Self {
        Self::new(codes::INTERNAL_ERROR, "Internal error")
    }

    pub fn auth_required() -> Self {
        Self::new(codes::AUTH_REQUIRED, "Authentication required")
    }

    pub fn initialization_error() -> Self {
        Self::new(codes::INITIALIZATION_ERROR, "Initialization error")
    }

    pub fn unauthorized() -> Self {
        Self::new(codes::UNAUTHORIZED, "Unauthorized")
    }

    pub fn forbidden() -> Self {
        Self::new(codes::FORBIDDEN, "Forbidden")
    }

    pub fn not_found() -> Self {
        Self::new(codes::NOT_FOUND, "Not found")
    }

    pub fn conflict() -> Self {
        Self::new(codes::CONFLICT, "Conflict")
    }

    pub fn too_many_requests() -> Self {
        Self::new(codes::TOO_MANY_REQUESTS, "Too many requests")
    }

    pub fn internal_server_error() -> Self {
        Self::new(codes::INTERNAL_SERVER_ERROR, "Internal server error")
    }

    /// Whether the code is one of the five reserved JSON-RPC codes
    pub fn is_standard(&self) -> bool {
        (-32700..=-32600).contains(&self.code)
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ProtocolError {}
