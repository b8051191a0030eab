//! MCP Prompt Management

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{debug, info, warn};

use super::{
    errors::{MCPError, MCPResult},
    registry::{Catalog, CatalogEntry},
    tools::ToolContent,
};

/// Prompt argument declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Prompt template descriptor as listed by `prompts/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

impl Prompt {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            arguments: Vec::new(),
        }
    }

    /// Declare an argument
    pub fn with_argument(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.arguments.push(PromptArgument {
            name: name.into(),
            description: Some(description.into()),
            required,
        });
        self
    }

    /// Check that every required argument is present
    pub fn validate_arguments(&self, arguments: &HashMap<String, String>) -> MCPResult<()> {
        for argument in self.arguments.iter().filter(|a| a.required) {
            if !arguments.contains_key(&argument.name) {
                return Err(MCPError::invalid_params(format!(
                    "Missing required argument '{}' for prompt '{}'",
                    argument.name, self.name
                )));
            }
        }
        Ok(())
    }
}

impl CatalogEntry for Prompt {
    fn key(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of a rendered prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: ToolContent,
}

impl PromptMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: ToolContent::text(text),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: ToolContent::text(text),
        }
    }
}

/// `prompts/get` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// `prompts/get` params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
}

/// `prompts/list` result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPromptsResult {
    pub prompts: Vec<Prompt>,
}

/// Renders a prompt from its arguments
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn render(&self, arguments: HashMap<String, String>) -> MCPResult<GetPromptResult>;
}

#[async_trait]
impl<F, Fut> PromptHandler for F
where
    F: Fn(HashMap<String, String>) -> Fut + Send + Sync,
    Fut: Future<Output = MCPResult<GetPromptResult>> + Send + 'static,
{
    async fn render(&self, arguments: HashMap<String, String>) -> MCPResult<GetPromptResult> {
        self(arguments).await
    }
}

/// Template handler substituting `{name}` placeholders with argument values
#[derive(Debug, Clone)]
pub struct TemplatePrompt {
    template: String,
}

impl TemplatePrompt {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl PromptHandler for TemplatePrompt {
    async fn render(&self, arguments: HashMap<String, String>) -> MCPResult<GetPromptResult> {
        let text = arguments
            .iter()
            .fold(self.template.clone(), |text, (name, value)| {
                text.replace(&format!("{{{}}}", name), value)
            });
        Ok(GetPromptResult {
            description: None,
            messages: vec![PromptMessage::user(text)],
        })
    }
}

/// Prompt registry for the server side
pub struct PromptRegistry {
    catalog: Catalog<Prompt, dyn PromptHandler>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(),
        }
    }

    /// Register a prompt; an existing prompt with the same name is replaced
    pub async fn register<H>(&self, prompt: Prompt, handler: H)
    where
        H: PromptHandler + 'static,
    {
        self.register_arc(prompt, Arc::new(handler)).await
    }

    pub async fn register_arc(&self, prompt: Prompt, handler: Arc<dyn PromptHandler>) {
        let name = prompt.name.clone();
        if self.catalog.insert(prompt, handler).await {
            warn!("Prompt '{}' re-registered; previous handler replaced", name);
        } else {
            info!("Registered prompt: {}", name);
        }
    }

    pub async fn unregister(&self, name: &str) -> Option<Prompt> {
        self.catalog.remove(name).await
    }

    pub async fn get(&self, name: &str) -> Option<Prompt> {
        self.catalog.get(name).await
    }

    pub async fn list(&self) -> Vec<Prompt> {
        self.catalog.list().await
    }

    pub async fn len(&self) -> usize {
        self.catalog.len().await
    }

    pub async fn validate(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> MCPResult<Prompt> {
        let prompt = self
            .catalog
            .get(name)
            .await
            .ok_or_else(|| MCPError::invalid_prompt(name))?;
        prompt.validate_arguments(arguments)?;
        Ok(prompt)
    }

    /// Render a prompt; the registry lock is released before the handler runs
    pub async fn render(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> MCPResult<GetPromptResult> {
        let (prompt, handler) = self
            .catalog
            .resolve(name)
            .await
            .ok_or_else(|| MCPError::invalid_prompt(name))?;
        prompt.validate_arguments(&arguments)?;

        debug!("Rendering prompt: {}", name);
        let mut result = handler.render(arguments).await?;
        if result.description.is_none() {
            result.description = prompt.description;
        }
        Ok(result)
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::errors::ErrorCode;

    fn review_prompt() -> Prompt {
        Prompt::new("review", "Review a change")
            .with_argument("language", "Source language", true)
            .with_argument("focus", "What to look at", false)
    }

    #[tokio::test]
    async fn test_render_template() {
        let registry = PromptRegistry::new();
        registry
            .register(review_prompt(), TemplatePrompt::new("Review this {language} code"))
            .await;

        let args = HashMap::from([("language".to_string(), "Rust".to_string())]);
        let result = registry.render("review", args).await.unwrap();

        assert_eq!(result.description.as_deref(), Some("Review a change"));
        assert_eq!(result.messages[0].role, Role::User);
        assert_eq!(result.messages[0].content.as_text(), Some("Review this Rust code"));
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let registry = PromptRegistry::new();
        registry
            .register(review_prompt(), TemplatePrompt::new("{language}"))
            .await;

        let err = registry.render("review", HashMap::new()).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidParams));
        assert!(err.to_string().contains("language"));
    }

    #[tokio::test]
    async fn test_unknown_prompt() {
        let registry = PromptRegistry::new();
        let err = registry.render("missing", HashMap::new()).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidPrompt));
    }

    #[test]
    fn test_prompt_wire_shape() {
        let value = serde_json::to_value(review_prompt()).unwrap();
        assert_eq!(value["arguments"][0]["required"], true);
        assert_eq!(value["arguments"][1]["name"], "focus");
    }
}
