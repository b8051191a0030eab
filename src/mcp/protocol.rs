//! MCP Protocol Core Implementation
//!
//! The JSON-RPC 2.0 message envelope, identifiers, envelope metadata and the
//! handshake payloads exchanged during capability negotiation.

use serde::{
    de::DeserializeOwned,
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::{
    fmt::{self, Display},
    str::FromStr,
};
use uuid::Uuid;

use super::errors::{MCPError, MCPResult, RpcError};

/// JSON-RPC version carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// Tool and prompt arguments: an ordered map of JSON values
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// Protocol method names
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const PROGRESS: &str = "notifications/progress";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const CANCELLED: &str = "notifications/cancelled";

    /// Methods that may be issued before the handshake reaches `Ready`
    pub fn is_handshake_exempt(method: &str) -> bool {
        method == INITIALIZE || method == PING
    }
}

/// MCP protocol revision, formatted as `YYYY-MM-DD` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolVersion {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl ProtocolVersion {
    /// MCP Protocol version 2024-11-05
    pub const CURRENT: Self = Self::new(2024, 11, 5);

    /// Revisions this implementation can speak, oldest first
    pub const SUPPORTED: [Self; 2] = [Self::new(2024, 11, 5), Self::new(2025, 3, 26)];

    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }

    /// Pick the revision to answer a peer's request with: the requested one if
    /// supported, otherwise the latest supported revision.
    pub fn negotiate(requested: &Self) -> Self {
        if requested.is_supported() {
            *requested
        } else {
            Self::SUPPORTED[Self::SUPPORTED.len() - 1]
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl FromStr for ProtocolVersion {
    type Err = MCPError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 3 {
            return Err(MCPError::invalid_params(format!(
                "Invalid protocol version format: {}",
                s
            )));
        }

        let invalid = |part: &str| MCPError::invalid_params(format!("Invalid protocol version component: {}", part));
        let year = parts[0].parse().map_err(|_| invalid(parts[0]))?;
        let month: u8 = parts[1].parse().map_err(|_| invalid(parts[1]))?;
        let day: u8 = parts[2].parse().map_err(|_| invalid(parts[2]))?;
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(invalid(s));
        }

        Ok(Self::new(year, month, day))
    }
}

impl TryFrom<String> for ProtocolVersion {
    type Error = MCPError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolVersion> for String {
    fn from(version: ProtocolVersion) -> Self {
        version.to_string()
    }
}

/// Message ID type for MCP messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl MessageId {
    /// Generate a new random message ID
    pub fn generate() -> Self {
        Self::String(Uuid::new_v4().to_string())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::String(s) => write!(f, "{}", s),
            MessageId::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Opaque identifier correlating progress notifications with one call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    Number(i64),
    String(String),
}

impl ProgressToken {
    pub fn generate() -> Self {
        Self::String(Uuid::new_v4().to_string())
    }
}

impl Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressToken::String(s) => write!(f, "{}", s),
            ProgressToken::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for ProgressToken {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for ProgressToken {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// Envelope extension (`_meta`).
///
/// Only observability and progress correlation read this; routing never does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    /// Extension members, e.g. `authToken`
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Meta {
    /// Key under `extra` holding the bearer token read by the auth interceptor
    pub const AUTH_TOKEN: &'static str = "authToken";

    pub fn with_progress_token(mut self, token: ProgressToken) -> Self {
        self.progress_token = Some(token);
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.extra
            .insert(Self::AUTH_TOKEN.to_string(), serde_json::Value::String(token.into()));
        self
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.extra.get(Self::AUTH_TOKEN).and_then(|v| v.as_str())
    }
}

/// Keeps a present-but-null member as `Some(Value::Null)` instead of `None`
fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// JSON-RPC message envelope.
///
/// Requests, notifications and responses share one shape; the kind is derived
/// from which members are populated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    /// JSON-RPC version (must be "2.0")
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub params: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "present")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default, rename = "_meta")]
    pub meta: Option<Meta>,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", &self.jsonrpc)?;
        // Responses always carry an id member, null when the request id is unknown.
        if self.id.is_some() || self.method.is_none() {
            map.serialize_entry("id", &self.id)?;
        }
        if let Some(method) = &self.method {
            map.serialize_entry("method", method)?;
        }
        if let Some(params) = &self.params {
            map.serialize_entry("params", params)?;
        }
        if let Some(result) = &self.result {
            map.serialize_entry("result", result)?;
        }
        if let Some(error) = &self.error {
            map.serialize_entry("error", error)?;
        }
        if let Some(meta) = &self.meta {
            map.serialize_entry("_meta", meta)?;
        }
        map.end()
    }
}

impl Message {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
            meta: None,
        }
    }

    /// Create a request with a fresh unique id
    pub fn request(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self::request_with_id(MessageId::generate(), method, params)
    }

    /// Create a request with a caller-chosen id
    pub fn request_with_id(
        id: MessageId,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Some(id),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Create a notification (no id, no response expected)
    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Create a successful response echoing the caller's id
    pub fn response(id: Option<MessageId>, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Create an error response echoing the caller's id
    pub fn error_response(id: Option<MessageId>, error: RpcError) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::empty()
        }
    }

    /// Attach envelope metadata
    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    pub fn is_error(&self) -> bool {
        self.is_response() && self.error.is_some()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.meta.as_ref().and_then(|m| m.progress_token.as_ref())
    }

    /// Validate the envelope structure
    pub fn validate(&self) -> MCPResult<()> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(MCPError::invalid_request(format!(
                "Invalid JSON-RPC version: '{}'",
                self.jsonrpc
            )));
        }

        let populated = [
            self.method.is_some(),
            self.result.is_some(),
            self.error.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if populated != 1 {
            return Err(MCPError::invalid_request(
                "Message must carry exactly one of method, result or error",
            ));
        }

        if let Some(method) = &self.method {
            if method.is_empty() {
                return Err(MCPError::invalid_request("Method name cannot be empty"));
            }
        }

        Ok(())
    }

    /// Consume a response into its result, mapping an error member to `MCPError::Rpc`
    pub fn into_result(self) -> MCPResult<serde_json::Value> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(MCPError::Rpc(error)),
            (Some(result), None) => Ok(result),
            (None, None) => Err(MCPError::invalid_request("Response has neither result nor error")),
        }
    }

    /// Deserialize the params member into a typed payload
    pub fn params_as<T: DeserializeOwned>(&self) -> MCPResult<T> {
        let params = self.params.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(params)
            .map_err(|e| MCPError::invalid_params(format!("Invalid params: {}", e)))
    }

    /// Parse a JSON string into a message
    pub fn from_json(json: &str) -> MCPResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            MCPError::Rpc(RpcError::parse_error(Some(format!(
                "Failed to parse MCP message: {}",
                e
            ))))
        })
    }

    /// Serialize message to JSON string
    pub fn to_json(&self) -> MCPResult<String> {
        serde_json::to_string(self)
            .map_err(|e| MCPError::serialization(format!("Failed to serialize MCP message: {}", e)))
    }
}

/// Client or server identity, exchanged once at handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(default)]
    pub subscribe: bool,
    #[serde(default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingCapability {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingCapability {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

/// Capabilities a server declares. `None` means unsupported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingCapability>,
}

/// Capabilities a client declares. `None` means unsupported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingCapability>,
}

/// `notifications/cancelled` params: the sender gave up on one of its requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `initialize` request parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

/// `initialize` response result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_version() {
        let version: ProtocolVersion = "2024-11-05".parse().unwrap();
        assert_eq!(version, ProtocolVersion::CURRENT);
        assert_eq!(version.to_string(), "2024-11-05");
        assert!(version < ProtocolVersion::new(2025, 3, 26));

        assert!("2024.11.05".parse::<ProtocolVersion>().is_err());
        assert!("2024-13-05".parse::<ProtocolVersion>().is_err());

        let unknown = ProtocolVersion::new(2023, 1, 1);
        assert_eq!(ProtocolVersion::negotiate(&unknown), ProtocolVersion::new(2025, 3, 26));
        assert_eq!(ProtocolVersion::negotiate(&ProtocolVersion::CURRENT), ProtocolVersion::CURRENT);
    }

    #[test]
    fn test_classification_is_exclusive() {
        let request = Message::request("tools/list", None);
        assert!(request.is_request());
        assert!(!request.is_notification());
        assert!(!request.is_response());

        let notification = Message::notification(methods::INITIALIZED, None);
        assert!(notification.is_notification());
        assert!(!notification.is_request());
        assert!(!notification.is_response());

        let response = Message::response(Some(MessageId::from(7)), json!({}));
        assert!(response.is_response());
        assert!(!response.is_request());
        assert!(!response.is_notification());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = Message::request("ping", None);
        let b = Message::request("ping", None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_validate() {
        assert!(Message::request("ping", None).validate().is_ok());

        let mut wrong_version = Message::request("ping", None);
        wrong_version.jsonrpc = "1.0".to_string();
        assert!(wrong_version.validate().is_err());

        let mut both = Message::response(Some(MessageId::from(1)), json!(1));
        both.error = Some(RpcError::internal_error(None));
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_null_result_survives_decoding() {
        let json = r#"{"jsonrpc":"2.0","id":3,"result":null}"#;
        let message = Message::from_json(json).unwrap();
        assert!(message.is_response());
        assert_eq!(message.result, Some(serde_json::Value::Null));
    }

    #[test]
    fn test_error_response_keeps_null_id() {
        let message = Message::error_response(None, RpcError::parse_error(None));
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("id").unwrap().is_null());

        let notification = serde_json::to_value(Message::notification("x", None)).unwrap();
        assert!(notification.get("id").is_none());
    }

    #[test]
    fn test_meta_round_trip() {
        let meta = Meta::default()
            .with_progress_token(ProgressToken::from("t1"))
            .with_trace("trace", "span")
            .with_auth_token("secret");
        let message = Message::request("tools/call", Some(json!({"name": "echo"}))).with_meta(meta);

        let json = message.to_json().unwrap();
        assert!(json.contains("\"_meta\""));
        assert!(json.contains("\"progressToken\":\"t1\""));

        let parsed = Message::from_json(&json).unwrap();
        let parsed_meta = parsed.meta.as_ref().unwrap();
        assert_eq!(parsed_meta.auth_token(), Some("secret"));
        assert_eq!(parsed.progress_token(), Some(&ProgressToken::from("t1")));
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_notification_round_trip() {
        let message = Message::notification(
            methods::PROGRESS,
            Some(json!({"progressToken": "t1", "progress": 0.5})),
        );

        let parsed = Message::from_json(&message.to_json().unwrap()).unwrap();
        assert!(parsed.is_notification());
        assert_eq!(parsed.id, None);
        assert_eq!(parsed.method(), Some(methods::PROGRESS));
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_error_response_round_trip() {
        let error = RpcError::invalid_tool(Some("Tool 'nope' not found".to_string()))
            .with_data(json!({"name": "nope"}));
        let message = Message::error_response(Some(MessageId::from("req-9")), error.clone());

        let parsed = Message::from_json(&message.to_json().unwrap()).unwrap();
        assert!(parsed.is_response());
        assert!(!parsed.is_request());
        assert_eq!(parsed.id, Some(MessageId::from("req-9")));
        assert_eq!(parsed.error, Some(error));
        assert_eq!(parsed.result, None);
    }

    #[test]
    fn test_capability_presence() {
        let caps: ServerCapabilities = serde_json::from_value(json!({"tools": {}})).unwrap();
        assert!(caps.tools.is_some());
        assert!(caps.resources.is_none());

        let wire = serde_json::to_value(ServerCapabilities::default()).unwrap();
        assert_eq!(wire, json!({}));
    }

    #[test]
    fn test_initialize_params_wire_names() {
        let params = InitializeParams {
            protocol_version: ProtocolVersion::CURRENT,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::new("client", "1.0.0"),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["protocolVersion"], "2024-11-05");
        assert_eq!(value["clientInfo"]["name"], "client");
    }
}
