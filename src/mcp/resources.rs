//! MCP Resource Management
//!
//! Resource descriptors, content payloads and the server-side resource
//! registry. Subscriptions are tracked per session by the server.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    future::Future,
    path::PathBuf,
    sync::Arc,
};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    errors::{MCPError, MCPResult},
    registry::{Catalog, CatalogEntry},
};

/// Resource URI type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceUri(String);

impl ResourceUri {
    /// Create a new resource URI; it must parse as an absolute URI
    pub fn new(uri: impl Into<String>) -> MCPResult<Self> {
        let uri = uri.into();
        if uri.is_empty() {
            return Err(MCPError::invalid_params("Resource URI cannot be empty"));
        }
        Url::parse(&uri)
            .map_err(|e| MCPError::invalid_params(format!("Invalid resource URI '{}': {}", uri, e)))?;
        Ok(Self(uri))
    }

    /// Create a `file://` URI from an absolute path
    pub fn from_file_path(path: impl AsRef<std::path::Path>) -> MCPResult<Self> {
        let path = path.as_ref();
        let url = Url::from_file_path(path).map_err(|_| {
            MCPError::invalid_params(format!("File path must be absolute: {}", path.display()))
        })?;
        Ok(Self(url.to_string()))
    }

    /// Get the URI as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the scheme (e.g., "file", "https", "memo")
    pub fn scheme(&self) -> Option<String> {
        Url::parse(&self.0).ok().map(|url| url.scheme().to_string())
    }

    /// Convert a `file://` URI to a local path
    pub fn to_file_path(&self) -> Option<PathBuf> {
        Url::parse(&self.0)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
    }
}

impl Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ResourceUri {
    type Error = MCPError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResourceUri> for String {
    fn from(uri: ResourceUri) -> Self {
        uri.0
    }
}

/// Resource descriptor as listed by `resources/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: ResourceUri,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Resource {
    pub fn new(uri: ResourceUri, name: impl Into<String>) -> Self {
        Self {
            uri,
            name: name.into(),
            description: None,
            mime_type: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

impl CatalogEntry for Resource {
    fn key(&self) -> &str {
        self.uri.as_str()
    }
}

/// One content item returned by `resources/read`: text or a base64 blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: ResourceUri,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

impl ResourceContents {
    pub fn text(uri: ResourceUri, text: impl Into<String>) -> Self {
        Self {
            uri,
            mime_type: Some("text/plain".to_string()),
            text: Some(text.into()),
            blob: None,
        }
    }

    pub fn blob(uri: ResourceUri, bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            uri,
            mime_type: Some(mime_type.into()),
            text: None,
            blob: Some(BASE64.encode(bytes)),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Raw bytes of this item, decoding the blob when present
    pub fn bytes(&self) -> MCPResult<Vec<u8>> {
        match (&self.text, &self.blob) {
            (Some(text), _) => Ok(text.as_bytes().to_vec()),
            (None, Some(blob)) => BASE64
                .decode(blob)
                .map_err(|e| MCPError::serialization(format!("Invalid resource blob: {}", e))),
            (None, None) => Ok(Vec::new()),
        }
    }
}

/// Produces the contents of a registered resource
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(&self, uri: ResourceUri) -> MCPResult<Vec<ResourceContents>>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(ResourceUri) -> Fut + Send + Sync,
    Fut: Future<Output = MCPResult<Vec<ResourceContents>>> + Send + 'static,
{
    async fn read(&self, uri: ResourceUri) -> MCPResult<Vec<ResourceContents>> {
        self(uri).await
    }
}

/// Fixed text served as-is
#[derive(Debug, Clone)]
pub struct TextResource {
    text: String,
    mime_type: String,
}

impl TextResource {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mime_type: "text/plain".to_string(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

#[async_trait]
impl ResourceHandler for TextResource {
    async fn read(&self, uri: ResourceUri) -> MCPResult<Vec<ResourceContents>> {
        Ok(vec![
            ResourceContents::text(uri, self.text.clone()).with_mime_type(self.mime_type.clone())
        ])
    }
}

/// Reads `file://` resources from disk; UTF-8 files come back as text,
/// anything else as a blob
#[derive(Debug, Clone, Default)]
pub struct FileResource;

#[async_trait]
impl ResourceHandler for FileResource {
    async fn read(&self, uri: ResourceUri) -> MCPResult<Vec<ResourceContents>> {
        let path = uri
            .to_file_path()
            .ok_or_else(|| MCPError::invalid_resource(uri.as_str()))?;

        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            warn!("Failed to read resource {}: {}", path.display(), e);
            MCPError::invalid_resource(uri.as_str())
        })?;

        debug!("Read {} bytes from {}", bytes.len(), path.display());
        let contents = match String::from_utf8(bytes) {
            Ok(text) => ResourceContents::text(uri, text),
            Err(e) => ResourceContents::blob(uri, e.as_bytes(), "application/octet-stream"),
        };
        Ok(vec![contents])
    }
}

/// `resources/list` result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResourcesResult {
    pub resources: Vec<Resource>,
}

/// `resources/read`, `resources/subscribe` and `resources/unsubscribe` params,
/// and the `notifications/resources/updated` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUriParams {
    pub uri: String,
}

/// `resources/read` result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

/// Resource registry for the server side
pub struct ResourceRegistry {
    catalog: Catalog<Resource, dyn ResourceHandler>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(),
        }
    }

    /// Register a resource; an existing entry with the same URI is replaced
    pub async fn register<H>(&self, resource: Resource, handler: H)
    where
        H: ResourceHandler + 'static,
    {
        self.register_arc(resource, Arc::new(handler)).await
    }

    pub async fn register_arc(&self, resource: Resource, handler: Arc<dyn ResourceHandler>) {
        let uri = resource.uri.clone();
        if self.catalog.insert(resource, handler).await {
            warn!("Resource '{}' re-registered; previous handler replaced", uri);
        } else {
            info!("Registered resource: {}", uri);
        }
    }

    pub async fn unregister(&self, uri: &str) -> Option<Resource> {
        let removed = self.catalog.remove(uri).await;
        if removed.is_some() {
            info!("Unregistered resource: {}", uri);
        }
        removed
    }

    pub async fn get(&self, uri: &str) -> Option<Resource> {
        self.catalog.get(uri).await
    }

    pub async fn list(&self) -> Vec<Resource> {
        self.catalog.list().await
    }

    pub async fn len(&self) -> usize {
        self.catalog.len().await
    }

    /// Check the URI is well formed and registered
    pub async fn validate(&self, uri: &str) -> MCPResult<Resource> {
        ResourceUri::new(uri)?;
        self.catalog
            .get(uri)
            .await
            .ok_or_else(|| MCPError::invalid_resource(uri))
    }

    /// Read a resource; the registry lock is released before the handler runs
    pub async fn read(&self, uri: &str) -> MCPResult<Vec<ResourceContents>> {
        let (resource, handler) = self
            .catalog
            .resolve(uri)
            .await
            .ok_or_else(|| MCPError::invalid_resource(uri))?;

        debug!("Reading resource: {}", uri);
        handler.read(resource.uri).await
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::errors::ErrorCode;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn uri(s: &str) -> ResourceUri {
        ResourceUri::new(s).unwrap()
    }

    #[test]
    fn test_uri_validation() {
        assert!(ResourceUri::new("").is_err());
        assert!(ResourceUri::new("not a uri").is_err());
        assert_eq!(uri("memo://notes/1").scheme().as_deref(), Some("memo"));

        let parsed: Result<ResourceUri, _> = serde_json::from_str("\"relative/path\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_blob_roundtrip() {
        let contents = ResourceContents::blob(uri("memo://bin"), &[0, 159, 255], "application/octet-stream");
        assert!(contents.text.is_none());
        assert_eq!(contents.bytes().unwrap(), vec![0, 159, 255]);
    }

    #[tokio::test]
    async fn test_read_registered_resource() {
        let registry = ResourceRegistry::new();
        registry
            .register(Resource::new(uri("memo://greeting"), "greeting"), TextResource::new("hello"))
            .await;

        let contents = registry.read("memo://greeting").await.unwrap();
        assert_eq!(contents[0].text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_unknown_resource() {
        let registry = ResourceRegistry::new();
        let err = registry.read("memo://missing").await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidResource));
        assert!(registry.validate("memo://missing").await.unwrap_err().is(ErrorCode::InvalidResource));
        assert!(registry.validate("nope").await.unwrap_err().is(ErrorCode::InvalidParams));
    }

    #[tokio::test]
    async fn test_file_resource() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "on disk").unwrap();
        let file_uri = ResourceUri::from_file_path(file.path()).unwrap();

        let registry = ResourceRegistry::new();
        registry
            .register(Resource::new(file_uri.clone(), "file"), FileResource)
            .await;

        let contents = registry.read(file_uri.as_str()).await.unwrap();
        assert_eq!(contents[0].text.as_deref(), Some("on disk"));
    }
}
