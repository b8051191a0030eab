//! MCP Tool Management
//!
//! Tool definitions, input schema construction, argument validation and the
//! server-side tool registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    errors::{MCPError, MCPResult},
    interceptors::auth::Identity,
    progress::ProgressReporter,
    protocol::Arguments,
    registry::{Catalog, CatalogEntry},
};

/// Parameter type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Integer => "integer",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }
}

/// Tool parameter definition, rendered into the tool's input schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    /// Parameter name
    pub name: String,
    /// Parameter description
    pub description: Option<String>,
    /// Parameter type
    pub parameter_type: ParameterType,
    /// Whether parameter is required
    pub required: bool,
    /// Default value
    pub default_value: Option<Value>,
    /// Allowed values (for enum types)
    pub allowed_values: Option<Vec<Value>>,
    /// Minimum value (for numeric types)
    pub minimum: Option<f64>,
    /// Maximum value (for numeric types)
    pub maximum: Option<f64>,
}

impl ToolParameter {
    /// Create a new parameter
    pub fn new(name: impl Into<String>, parameter_type: ParameterType, required: bool) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameter_type,
            required,
            default_value: None,
            allowed_values: None,
            minimum: None,
            maximum: None,
        }
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set default value
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Set allowed values
    pub fn with_allowed_values(mut self, values: Vec<Value>) -> Self {
        self.allowed_values = Some(values);
        self
    }

    /// Set numeric range
    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.minimum = min;
        self.maximum = max;
        self
    }

    /// JSON schema fragment describing this parameter
    pub fn to_schema(&self) -> Value {
        let mut schema = serde_json::Map::new();
        schema.insert("type".to_string(), json!(self.parameter_type.as_str()));

        if let Some(ref desc) = self.description {
            schema.insert("description".to_string(), json!(desc));
        }
        if let Some(min) = self.minimum {
            schema.insert("minimum".to_string(), json!(min));
        }
        if let Some(max) = self.maximum {
            schema.insert("maximum".to_string(), json!(max));
        }
        if let Some(ref allowed) = self.allowed_values {
            schema.insert("enum".to_string(), Value::Array(allowed.clone()));
        }
        if let Some(ref default) = self.default_value {
            schema.insert("default".to_string(), default.clone());
        }

        Value::Object(schema)
    }
}

/// Tool definition as listed by `tools/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments object (`properties`, `required`)
    pub input_schema: Value,
}

impl Tool {
    /// Create a tool taking no arguments
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    /// Replace the input schema wholesale
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Add a parameter to the input schema
    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        if !self.input_schema.is_object() {
            self.input_schema = json!({ "type": "object" });
        }
        let schema = parameter.to_schema();
        if let Some(object) = self.input_schema.as_object_mut() {
            let properties = object.entry("properties").or_insert_with(|| json!({}));
            if let Some(properties) = properties.as_object_mut() {
                properties.insert(parameter.name.clone(), schema);
            }

            if parameter.required {
                let required = object.entry("required").or_insert_with(|| json!([]));
                if let Some(required) = required.as_array_mut() {
                    if !required.iter().any(|r| r.as_str() == Some(parameter.name.as_str())) {
                        required.push(json!(parameter.name));
                    }
                }
            }
        }
        self
    }

    /// Names listed under the schema's `required` member
    pub fn required_arguments(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Check that every required argument is present
    pub fn validate_arguments(&self, arguments: &Arguments) -> MCPResult<()> {
        for name in self.required_arguments() {
            if !arguments.contains_key(name) {
                return Err(MCPError::invalid_params(format!(
                    "Missing required argument '{}' for tool '{}'",
                    name, self.name
                )));
            }
        }
        Ok(())
    }
}

impl CatalogEntry for Tool {
    fn key(&self) -> &str {
        &self.name
    }
}

/// Tool content types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        /// Base64 encoded image
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "resource")]
    Resource { resource: Value },
}

impl ToolContent {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create image content
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Create resource content
    pub fn resource(resource: Value) -> Self {
        Self::Resource { resource }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Tool execution result (`tools/call` result)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    /// Set when the tool ran but reports failure in its content
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    /// Create successful result
    pub fn success(content: Vec<ToolContent>) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// Single text block result
    pub fn text(text: impl Into<String>) -> Self {
        Self::success(vec![ToolContent::text(text)])
    }

    /// Tool-level failure reported to the model rather than as an RPC error
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(message)],
            is_error: true,
        }
    }
}

/// Per-call context handed to a tool handler
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    /// Cancelled when the caller gives up or the request times out
    pub cancel: CancellationToken,
    /// Authenticated caller, when an auth interceptor ran
    pub identity: Option<Identity>,
    /// Present when the caller asked for progress notifications
    pub progress: Option<ProgressReporter>,
}

impl CallScope {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }
}

/// Tool handler trait
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Arguments, scope: CallScope) -> MCPResult<ToolResult>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Arguments, CallScope) -> Fut + Send + Sync,
    Fut: Future<Output = MCPResult<ToolResult>> + Send + 'static,
{
    async fn call(&self, arguments: Arguments, scope: CallScope) -> MCPResult<ToolResult> {
        self(arguments, scope).await
    }
}

/// Tool execution statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ToolStats {
    /// Total executions
    pub total_executions: u64,
    /// Successful executions
    pub successful_executions: u64,
    /// Failed executions
    pub failed_executions: u64,
    /// Executions by tool
    pub executions_by_tool: HashMap<String, u64>,
    /// Average execution time
    pub average_execution_time: Duration,
    /// Last execution time
    pub last_execution: Option<DateTime<Utc>>,
}

impl ToolStats {
    /// Update statistics for an execution
    pub fn update(&mut self, tool_name: &str, success: bool, duration: Duration) {
        self.total_executions += 1;

        if success {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }

        *self
            .executions_by_tool
            .entry(tool_name.to_string())
            .or_insert(0) += 1;

        let previous = self.average_execution_time.as_nanos() * (self.total_executions as u128 - 1);
        let average = (previous + duration.as_nanos()) / self.total_executions as u128;
        self.average_execution_time = Duration::from_nanos(average as u64);
        self.last_execution = Some(Utc::now());
    }
}

/// `tools/list` result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
}

/// `tools/call` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Arguments,
}

/// Tool registry for the server side
pub struct ToolRegistry {
    catalog: Catalog<Tool, dyn ToolHandler>,
    stats: RwLock<ToolStats>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(),
            stats: RwLock::new(ToolStats::default()),
        }
    }

    /// Register a tool; an existing tool with the same name is replaced
    pub async fn register<H>(&self, tool: Tool, handler: H)
    where
        H: ToolHandler + 'static,
    {
        self.register_arc(tool, Arc::new(handler)).await
    }

    pub async fn register_arc(&self, tool: Tool, handler: Arc<dyn ToolHandler>) {
        let name = tool.name.clone();
        if self.catalog.insert(tool, handler).await {
            warn!("Tool '{}' re-registered; previous handler replaced", name);
        } else {
            info!("Registered tool: {}", name);
        }
    }

    pub async fn unregister(&self, name: &str) -> Option<Tool> {
        let removed = self.catalog.remove(name).await;
        if removed.is_some() {
            info!("Unregistered tool: {}", name);
        }
        removed
    }

    pub async fn get(&self, name: &str) -> Option<Tool> {
        self.catalog.get(name).await
    }

    pub async fn list(&self) -> Vec<Tool> {
        self.catalog.list().await
    }

    pub async fn len(&self) -> usize {
        self.catalog.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Check that `name` exists and `arguments` carry its required fields
    pub async fn validate(&self, name: &str, arguments: &Arguments) -> MCPResult<Tool> {
        let tool = self
            .catalog
            .get(name)
            .await
            .ok_or_else(|| MCPError::invalid_tool(name))?;
        tool.validate_arguments(arguments)?;
        Ok(tool)
    }

    /// Call a tool with a fresh scope
    pub async fn call(&self, name: &str, arguments: Arguments) -> MCPResult<ToolResult> {
        self.call_with_scope(name, arguments, CallScope::default())
            .await
    }

    /// Call a tool; the registry lock is released before the handler runs
    pub async fn call_with_scope(
        &self,
        name: &str,
        arguments: Arguments,
        scope: CallScope,
    ) -> MCPResult<ToolResult> {
        let (tool, handler) = self
            .catalog
            .resolve(name)
            .await
            .ok_or_else(|| MCPError::invalid_tool(name))?;
        tool.validate_arguments(&arguments)?;

        debug!("Calling tool: {}", name);
        let start = Instant::now();
        let result = handler.call(arguments, scope).await;
        let duration = start.elapsed();

        let success = matches!(&result, Ok(r) if !r.is_error);
        self.stats.write().await.update(name, success, duration);
        if let Err(ref e) = result {
            debug!("Tool '{}' failed after {:?}: {}", name, duration, e);
        }
        result
    }

    pub async fn stats(&self) -> ToolStats {
        self.stats.read().await.clone()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::errors::ErrorCode;

    fn echo_tool() -> Tool {
        Tool::new("echo", "Echo the input").with_parameter(
            ToolParameter::new("text", ParameterType::String, true).with_description("Text to echo"),
        )
    }

    async fn echo(arguments: Arguments, _scope: CallScope) -> MCPResult<ToolResult> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ToolResult::text(text))
    }

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_schema_from_parameters() {
        let tool = Tool::new("search", "Search")
            .with_parameter(ToolParameter::new("query", ParameterType::String, true))
            .with_parameter(
                ToolParameter::new("limit", ParameterType::Integer, false)
                    .with_range(Some(1.0), Some(50.0))
                    .with_default(json!(10)),
            );

        assert_eq!(tool.required_arguments(), vec!["query"]);
        assert_eq!(tool.input_schema["properties"]["limit"]["type"], "integer");
        assert_eq!(tool.input_schema["properties"]["limit"]["default"], 10);
    }

    #[test]
    fn test_tool_wire_shape() {
        let value = serde_json::to_value(echo_tool()).unwrap();
        assert!(value.get("inputSchema").is_some());

        let result = serde_json::to_value(ToolResult::text("hi")).unwrap();
        assert_eq!(result, json!({"content": [{"type": "text", "text": "hi"}]}));
    }

    #[tokio::test]
    async fn test_call_echo() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool(), echo).await;

        let result = registry
            .call("echo", args(json!({"text": "hello"})))
            .await
            .unwrap();
        assert_eq!(result.content[0].as_text(), Some("hello"));
        assert_eq!(registry.stats().await.successful_executions, 1);
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool(), echo).await;

        let err = registry.call("echo", Arguments::new()).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidParams));
        assert!(err.to_string().contains("text"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.call("missing", Arguments::new()).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidTool));
    }

    #[tokio::test]
    async fn test_duplicate_registration_last_writer_wins() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool(), echo).await;
        registry
            .register(echo_tool(), |_args: Arguments, _scope: CallScope| async {
                Ok(ToolResult::text("second"))
            })
            .await;

        assert_eq!(registry.len().await, 1);
        let result = registry
            .call("echo", args(json!({"text": "x"})))
            .await
            .unwrap();
        assert_eq!(result.content[0].as_text(), Some("second"));
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool(), echo).await;
        assert!(registry.unregister("echo").await.is_some());
        assert!(registry.get("echo").await.is_none());
        assert!(registry.is_empty().await);
    }
}
