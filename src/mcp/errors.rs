//! MCP Protocol Error Handling
//!
//! Error codes, the JSON-RPC error object carried on the wire, and the
//! operational error type returned by every fallible MCP operation.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

/// Result type for MCP operations
pub type MCPResult<T> = Result<T, MCPError>;

/// JSON-RPC and MCP error codes.
///
/// The standard JSON-RPC codes occupy `[-32768, -32000]`; the MCP-specific
/// codes are a reserved sub-range `[-32009, -32001]` inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Invalid JSON was received
    ParseError = -32700,
    /// The JSON sent is not a valid request object
    InvalidRequest = -32600,
    /// The method does not exist or is not available
    MethodNotFound = -32601,
    /// Invalid method parameters
    InvalidParams = -32602,
    /// Internal JSON-RPC error
    InternalError = -32603,
    /// Request issued before the handshake completed
    NotInitialized = -32001,
    /// Request could not be completed (including timeouts)
    RequestFailed = -32002,
    /// Unknown tool
    InvalidTool = -32003,
    /// Unknown resource
    InvalidResource = -32004,
    /// Method exists but is disabled
    MethodDisabled = -32005,
    /// Unknown prompt
    InvalidPrompt = -32006,
    /// Authentication failed
    AuthFailed = -32007,
    /// Authenticated identity lacks permission
    PermissionDenied = -32008,
    /// Rate limit exceeded
    RateLimited = -32009,
}

impl ErrorCode {
    /// Lower bound of the standard JSON-RPC range
    pub const STANDARD_MIN: i32 = -32768;
    /// Upper bound of the standard JSON-RPC range
    pub const STANDARD_MAX: i32 = -32000;
    /// Lower bound of the MCP-specific sub-range
    pub const MCP_MIN: i32 = -32009;
    /// Upper bound of the MCP-specific sub-range
    pub const MCP_MAX: i32 = -32001;

    const ALL: [ErrorCode; 14] = [
        ErrorCode::ParseError,
        ErrorCode::InvalidRequest,
        ErrorCode::MethodNotFound,
        ErrorCode::InvalidParams,
        ErrorCode::InternalError,
        ErrorCode::NotInitialized,
        ErrorCode::RequestFailed,
        ErrorCode::InvalidTool,
        ErrorCode::InvalidResource,
        ErrorCode::MethodDisabled,
        ErrorCode::InvalidPrompt,
        ErrorCode::AuthFailed,
        ErrorCode::PermissionDenied,
        ErrorCode::RateLimited,
    ];

    /// Numeric wire value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a known code
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Default human-readable message for the code
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::NotInitialized => "Not initialized",
            ErrorCode::RequestFailed => "Request failed",
            ErrorCode::InvalidTool => "Invalid tool",
            ErrorCode::InvalidResource => "Invalid resource",
            ErrorCode::MethodDisabled => "Method disabled",
            ErrorCode::InvalidPrompt => "Invalid prompt",
            ErrorCode::AuthFailed => "Authentication failed",
            ErrorCode::PermissionDenied => "Permission denied",
            ErrorCode::RateLimited => "Rate limit exceeded",
        }
    }

    /// Whether a raw code falls in the standard JSON-RPC range
    pub fn is_standard(code: i32) -> bool {
        (Self::STANDARD_MIN..=Self::STANDARD_MAX).contains(&code)
    }

    /// Whether a raw code falls in the MCP-specific sub-range
    pub fn is_mcp_specific(code: i32) -> bool {
        (Self::MCP_MIN..=Self::MCP_MAX).contains(&code)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.code())
    }
}

/// JSON-RPC error object as carried in an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    /// Build an error for a taxonomy entry, optionally overriding the default message
    pub fn from_code(code: ErrorCode, message: Option<String>) -> Self {
        Self {
            code: code.code(),
            message: message.unwrap_or_else(|| code.default_message().to_string()),
            data: None,
        }
    }

    /// Attach additional data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Known taxonomy entry for this error, if any
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    /// Whether the code is in the standard JSON-RPC range
    pub fn is_standard(&self) -> bool {
        ErrorCode::is_standard(self.code)
    }

    /// Whether the code is MCP-specific
    pub fn is_mcp_specific(&self) -> bool {
        ErrorCode::is_mcp_specific(self.code)
    }

    pub fn parse_error(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::from_code(
            ErrorCode::MethodNotFound,
            Some(format!("Method '{}' not found", method)),
        )
    }

    pub fn invalid_params(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::InternalError, message)
    }

    pub fn not_initialized(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::NotInitialized, message)
    }

    pub fn request_failed(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::RequestFailed, message)
    }

    pub fn invalid_tool(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::InvalidTool, message)
    }

    pub fn invalid_resource(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::InvalidResource, message)
    }

    pub fn method_disabled(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::MethodDisabled, message)
    }

    pub fn invalid_prompt(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::InvalidPrompt, message)
    }

    pub fn auth_failed(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::AuthFailed, message)
    }

    pub fn permission_denied(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::PermissionDenied, message)
    }

    pub fn rate_limited(message: Option<String>) -> Self {
        Self::from_code(ErrorCode::RateLimited, message)
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// Operational error for MCP operations
#[derive(Debug, Error, Clone)]
pub enum MCPError {
    /// Protocol or MCP-domain error carried as a JSON-RPC error object
    #[error("Protocol error: {0}")]
    Rpc(#[from] RpcError),

    /// Transport-level send/receive failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The connection is gone
    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },

    /// A call's deadline elapsed before a response arrived
    #[error("Timeout error: operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The caller abandoned the call
    #[error("Request cancelled")]
    Cancelled,

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Unexpected failure inside a handler or the runtime
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MCPError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a connection closed error
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::Rpc(RpcError::invalid_request(Some(message.into())))
    }

    /// Create an invalid params error
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::Rpc(RpcError::invalid_params(Some(message.into())))
    }

    /// Create a method not found error
    pub fn method_not_found(method: &str) -> Self {
        Self::Rpc(RpcError::method_not_found(method))
    }

    /// Create a not initialized error
    pub fn not_initialized(method: &str) -> Self {
        Self::Rpc(RpcError::not_initialized(Some(format!(
            "Cannot call '{}' before initialization completes",
            method
        ))))
    }

    /// Create a request failed error
    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::Rpc(RpcError::request_failed(Some(message.into())))
    }

    /// Create an invalid tool error
    pub fn invalid_tool(name: &str) -> Self {
        Self::Rpc(RpcError::invalid_tool(Some(format!("Tool '{}' not found", name))))
    }

    /// Create an invalid resource error
    pub fn invalid_resource(uri: &str) -> Self {
        Self::Rpc(RpcError::invalid_resource(Some(format!(
            "Resource '{}' not found",
            uri
        ))))
    }

    /// Create an invalid prompt error
    pub fn invalid_prompt(name: &str) -> Self {
        Self::Rpc(RpcError::invalid_prompt(Some(format!(
            "Prompt '{}' not found",
            name
        ))))
    }

    /// Create a method disabled error
    pub fn method_disabled(method: &str) -> Self {
        Self::Rpc(RpcError::method_disabled(Some(format!(
            "Method '{}' is disabled by peer capabilities",
            method
        ))))
    }

    /// Create an authentication failed error
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::Rpc(RpcError::auth_failed(Some(message.into())))
    }

    /// Create a permission denied error
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::Rpc(RpcError::permission_denied(Some(message.into())))
    }

    /// Create a rate limited error
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::Rpc(RpcError::rate_limited(Some(message.into())))
    }

    /// Convert to protocol error for JSON-RPC response
    pub fn to_protocol_error(&self) -> RpcError {
        match self {
            MCPError::Rpc(err) => err.clone(),
            MCPError::Transport { message } => RpcError::request_failed(Some(message.clone())),
            MCPError::ConnectionClosed { message } => {
                RpcError::request_failed(Some(format!("Connection closed: {}", message)))
            }
            MCPError::Timeout { timeout_ms } => RpcError::request_failed(Some(format!(
                "Request timed out after {}ms",
                timeout_ms
            ))),
            MCPError::Cancelled => RpcError::request_failed(Some("Request cancelled".to_string())),
            MCPError::Serialization { message } => RpcError::internal_error(Some(message.clone())),
            MCPError::Configuration { message } => RpcError::internal_error(Some(message.clone())),
            MCPError::Internal { message } => RpcError::internal_error(Some(message.clone())),
        }
    }

    /// Error code this error maps to on the wire
    pub fn code(&self) -> i32 {
        match self {
            MCPError::Rpc(err) => err.code,
            other => other.to_protocol_error().code,
        }
    }

    /// Taxonomy entry this error maps to, if known
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code())
    }

    /// Check whether this error carries a specific taxonomy entry
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == code.code()
    }

    /// Whether the transport can no longer be used after this error
    pub fn is_fatal_transport(&self) -> bool {
        matches!(self, MCPError::ConnectionClosed { .. } | MCPError::Transport { .. })
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            MCPError::Rpc(err) => {
                if err.is_mcp_specific() {
                    ErrorCategory::Domain
                } else if err.code == ErrorCode::InternalError.code() {
                    ErrorCategory::Internal
                } else {
                    ErrorCategory::Protocol
                }
            }
            MCPError::Transport { .. } | MCPError::ConnectionClosed { .. } => {
                ErrorCategory::Transport
            }
            MCPError::Timeout { .. } | MCPError::Cancelled => ErrorCategory::Domain,
            MCPError::Serialization { .. }
            | MCPError::Configuration { .. }
            | MCPError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Internal => ErrorSeverity::High,
            ErrorCategory::Transport => ErrorSeverity::Medium,
            ErrorCategory::Domain if self.is(ErrorCode::AuthFailed) => ErrorSeverity::Medium,
            ErrorCategory::Domain | ErrorCategory::Protocol => ErrorSeverity::Low,
        }
    }
}

impl From<serde_json::Error> for MCPError {
    fn from(err: serde_json::Error) -> Self {
        MCPError::serialization(err.to_string())
    }
}

/// Error category for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Connection lost, send/receive failure
    Transport,
    /// Malformed envelope, unknown method, bad params
    Protocol,
    /// MCP-specific outcome (not initialized, unknown tool, auth, rate limit, timeout)
    Domain,
    /// Unexpected failure
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Domain => "domain",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}
