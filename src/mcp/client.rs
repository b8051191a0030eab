//! MCP Client Implementation
//!
//! Drives the handshake over any [`MCPTransport`], then issues requests
//! through the interceptor chain to the correlator. Catalog listings are
//! mirrored locally; server notifications (progress, resource updates, list
//! changes) are handled off the transport reader.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    correlator::{Correlator, CorrelatorStats},
    errors::{MCPError, MCPResult},
    handshake::{Handshake, HandshakeState, PeerInfo},
    interceptors::{
        handler_fn, Handler, Interceptor, InterceptorChain, MetricsInterceptor, MetricsSink,
        RequestContext,
    },
    progress::{ProgressNotification, ProgressSink},
    prompts::{GetPromptParams, GetPromptResult, ListPromptsResult, Prompt},
    protocol::{
        methods, Arguments, CancelledParams, ClientCapabilities, Implementation,
        InitializeParams, InitializeResult, Message, Meta, ProgressToken, ProtocolVersion,
        ServerCapabilities,
    },
    registry::CatalogMirror,
    resources::{ListResourcesResult, ReadResourceResult, Resource, ResourceContents, ResourceUriParams},
    tools::{CallToolParams, ListToolsResult, Tool, ToolResult},
    transport::MCPTransport,
};

/// Called with the URI of every `notifications/resources/updated`
pub type ResourceUpdatedHandler = Arc<dyn Fn(String) + Send + Sync>;

/// MCP client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Client information
    pub client_info: Implementation,
    /// Capabilities announced to the server
    pub capabilities: ClientCapabilities,
    /// Protocol version to request
    pub protocol_version: ProtocolVersion,
    /// Deadline for each request
    pub request_timeout: Duration,
    /// Deadline for the whole handshake
    pub connect_timeout: Duration,
    /// List tools/resources/prompts right after the handshake
    pub auto_cache: bool,
    /// Sent as `_meta.authToken` on every request
    pub auth_token: Option<String>,
    /// Receives progress for calls without their own progress callback
    pub progress_handler: Option<ProgressSink>,
    /// Request metrics sink; installs an outermost metrics interceptor
    pub metrics: Option<Arc<dyn MetricsSink>>,
    /// Client-side interceptors, outermost first
    pub interceptors: InterceptorChain,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("mcp-core-client", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
            protocol_version: ProtocolVersion::CURRENT,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            auto_cache: false,
            auth_token: None,
            progress_handler: None,
            metrics: None,
            interceptors: InterceptorChain::new(),
        }
    }
}

impl ClientConfig {
    pub fn new(client_info: Implementation) -> Self {
        Self {
            client_info,
            ..Self::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_auto_cache(mut self, enabled: bool) -> Self {
        self.auto_cache = enabled;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_progress_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ProgressNotification) + Send + Sync + 'static,
    {
        self.progress_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_interceptor<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors = self.interceptors.with(interceptor);
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("client_info", &self.client_info)
            .field("protocol_version", &self.protocol_version)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("auto_cache", &self.auto_cache)
            .field("interceptors", &self.interceptors)
            .finish()
    }
}

/// Client statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    /// Total requests sent
    pub requests_sent: u64,
    /// Total successful responses
    pub responses_received: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Timeout requests
    pub timeout_requests: u64,
    /// Total notifications received
    pub notifications_received: u64,
    /// Average response time
    pub average_response_time: Duration,
    /// Last activity timestamp
    pub last_activity: Option<DateTime<Utc>>,
}

impl ClientStats {
    /// Update request statistics
    pub fn update_request(&mut self, outcome: &MCPResult<Value>, response_time: Duration) {
        self.requests_sent += 1;
        match outcome {
            Ok(_) => {
                self.responses_received += 1;
                let previous = self.average_response_time.as_nanos()
                    * (self.responses_received as u128 - 1);
                let average = (previous + response_time.as_nanos()) / self.responses_received as u128;
                self.average_response_time = Duration::from_nanos(average as u64);
            }
            Err(MCPError::Timeout { .. }) => {
                self.timeout_requests += 1;
                self.failed_requests += 1;
            }
            Err(_) => self.failed_requests += 1,
        }
        self.last_activity = Some(Utc::now());
    }

    /// Update notification statistics
    pub fn update_notification(&mut self) {
        self.notifications_received += 1;
        self.last_activity = Some(Utc::now());
    }

    /// Get success rate
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            0.0
        } else {
            self.responses_received as f64 / self.requests_sent as f64
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    correlator: Correlator,
    handshake: Handshake<ServerCapabilities>,
    chain: Handler,
    tools: CatalogMirror<Tool>,
    resources: CatalogMirror<Resource>,
    prompts: CatalogMirror<Prompt>,
    progress_routes: RwLock<HashMap<ProgressToken, ProgressSink>>,
    resource_handlers: RwLock<Vec<ResourceUpdatedHandler>>,
    stats: RwLock<ClientStats>,
    /// Count of peer messages the incoming loop has finished handling
    processed: watch::Sender<u64>,
    incoming_task: Mutex<Option<JoinHandle<()>>>,
}

/// MCP client
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client over `transport`. Call [`Client::connect`] before
    /// issuing anything other than `ping`.
    pub fn new(transport: Arc<dyn MCPTransport>, config: ClientConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let correlator = Correlator::start(transport, incoming_tx);
        let chain = build_chain(&config, correlator.clone());
        let (processed, _) = watch::channel(0);

        let inner = Arc::new(ClientInner {
            config,
            correlator,
            handshake: Handshake::new(),
            chain,
            tools: CatalogMirror::new(),
            resources: CatalogMirror::new(),
            prompts: CatalogMirror::new(),
            progress_routes: RwLock::new(HashMap::new()),
            resource_handlers: RwLock::new(Vec::new()),
            stats: RwLock::new(ClientStats::default()),
            processed,
            incoming_task: Mutex::new(None),
        });

        let handle = tokio::spawn(incoming_loop(Arc::downgrade(&inner), incoming_rx));
        *inner.incoming_task.lock() = Some(handle);

        Self { inner }
    }

    /// Create a client and complete the handshake
    pub async fn connect_with(
        transport: Arc<dyn MCPTransport>,
        config: ClientConfig,
    ) -> MCPResult<Self> {
        let client = Self::new(transport, config);
        client.connect().await?;
        Ok(client)
    }

    /// Run the handshake: `initialize`, version check, `notifications/initialized`
    pub async fn connect(&self) -> MCPResult<InitializeResult> {
        info!("Connecting to MCP server...");
        self.inner.handshake.begin()?;

        let limit = self.inner.config.connect_timeout;
        let result = match tokio::time::timeout(limit, self.initialize()).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let _ = self.inner.handshake.fail(e.to_string());
                return Err(e);
            }
            Err(_) => {
                let _ = self.inner.handshake.fail("handshake timed out");
                return Err(MCPError::timeout(limit.as_millis() as u64));
            }
        };

        self.inner.handshake.complete()?;
        info!(
            "MCP client ready: server {} {} (protocol {})",
            result.server_info.name, result.server_info.version, result.protocol_version
        );

        if self.inner.config.auto_cache {
            self.refresh_caches().await;
        }
        Ok(result)
    }

    async fn initialize(&self) -> MCPResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: self.inner.config.protocol_version,
            capabilities: self.inner.config.capabilities.clone(),
            client_info: self.inner.config.client_info.clone(),
        };
        let message = self.new_request(methods::INITIALIZE, Some(serde_json::to_value(params)?));
        let value = self.dispatch(message, CancellationToken::new()).await?;
        let result: InitializeResult = parse_result(value, methods::INITIALIZE)?;

        if !result.protocol_version.is_supported() {
            return Err(MCPError::request_failed(format!(
                "Server selected unsupported protocol version {}",
                result.protocol_version
            )));
        }

        self.inner.handshake.record_peer(PeerInfo {
            implementation: result.server_info.clone(),
            capabilities: result.capabilities.clone(),
            protocol_version: result.protocol_version,
        })?;
        self.inner
            .correlator
            .notify(methods::INITIALIZED, None)
            .await?;
        Ok(result)
    }

    /// Populate the catalog mirrors the server advertises. Failures are logged.
    pub async fn refresh_caches(&self) {
        let Some(peer) = self.inner.handshake.peer() else {
            return;
        };
        if peer.capabilities.tools.is_some() {
            if let Err(e) = self.list_tools().await {
                warn!("Failed to cache tools: {}", e);
            }
        }
        if peer.capabilities.resources.is_some() {
            if let Err(e) = self.list_resources().await {
                warn!("Failed to cache resources: {}", e);
            }
        }
        if peer.capabilities.prompts.is_some() {
            if let Err(e) = self.list_prompts().await {
                warn!("Failed to cache prompts: {}", e);
            }
        }
    }

    /// Send a request through the interceptor chain and wait for its result
    pub async fn request(&self, method: &str, params: Option<Value>) -> MCPResult<Value> {
        self.request_cancellable(method, params, CancellationToken::new())
            .await
    }

    /// Like [`Client::request`]; cancelling `cancel` abandons the call and
    /// tells the server with `notifications/cancelled`
    pub async fn request_cancellable(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> MCPResult<Value> {
        let message = self.new_request(method, params);
        self.dispatch(message, cancel).await
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> MCPResult<()> {
        self.inner.handshake.ensure_ready_for(method)?;
        self.inner.correlator.notify(method, params).await
    }

    pub async fn ping(&self) -> MCPResult<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// List tools and replace the local mirror
    pub async fn list_tools(&self) -> MCPResult<Vec<Tool>> {
        let value = self.request(methods::TOOLS_LIST, None).await?;
        let result: ListToolsResult = parse_result(value, methods::TOOLS_LIST)?;
        self.inner.tools.replace(result.tools.clone());
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Arguments) -> MCPResult<ToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let value = self
            .request(methods::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await?;
        parse_result(value, methods::TOOLS_CALL)
    }

    /// Call a tool asking for progress; every notification for this call is
    /// passed to `on_progress` before this returns
    pub async fn call_tool_with_progress<F>(
        &self,
        name: &str,
        arguments: Arguments,
        on_progress: F,
    ) -> MCPResult<ToolResult>
    where
        F: Fn(ProgressNotification) + Send + Sync + 'static,
    {
        let token = ProgressToken::generate();
        self.inner
            .progress_routes
            .write()
            .insert(token.clone(), Arc::new(on_progress));

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let message = Message::request(methods::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .with_meta(self.base_meta().with_progress_token(token.clone()));
        let outcome = self.dispatch(message, CancellationToken::new()).await;

        self.wait_incoming_drained().await;
        self.inner.progress_routes.write().remove(&token);
        parse_result(outcome?, methods::TOOLS_CALL)
    }

    /// List resources and replace the local mirror
    pub async fn list_resources(&self) -> MCPResult<Vec<Resource>> {
        let value = self.request(methods::RESOURCES_LIST, None).await?;
        let result: ListResourcesResult = parse_result(value, methods::RESOURCES_LIST)?;
        self.inner.resources.replace(result.resources.clone());
        Ok(result.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> MCPResult<Vec<ResourceContents>> {
        let params = ResourceUriParams {
            uri: uri.to_string(),
        };
        let value = self
            .request(methods::RESOURCES_READ, Some(serde_json::to_value(params)?))
            .await?;
        let result: ReadResourceResult = parse_result(value, methods::RESOURCES_READ)?;
        Ok(result.contents)
    }

    pub async fn subscribe_resource(&self, uri: &str) -> MCPResult<()> {
        let params = ResourceUriParams {
            uri: uri.to_string(),
        };
        self.request(methods::RESOURCES_SUBSCRIBE, Some(serde_json::to_value(params)?))
            .await
            .map(|_| ())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> MCPResult<()> {
        let params = ResourceUriParams {
            uri: uri.to_string(),
        };
        self.request(methods::RESOURCES_UNSUBSCRIBE, Some(serde_json::to_value(params)?))
            .await
            .map(|_| ())
    }

    /// Register a callback for `notifications/resources/updated`
    pub fn on_resource_updated<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.inner.resource_handlers.write().push(Arc::new(handler));
    }

    /// List prompts and replace the local mirror
    pub async fn list_prompts(&self) -> MCPResult<Vec<Prompt>> {
        let value = self.request(methods::PROMPTS_LIST, None).await?;
        let result: ListPromptsResult = parse_result(value, methods::PROMPTS_LIST)?;
        self.inner.prompts.replace(result.prompts.clone());
        Ok(result.prompts)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> MCPResult<GetPromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        let value = self
            .request(methods::PROMPTS_GET, Some(serde_json::to_value(params)?))
            .await?;
        parse_result(value, methods::PROMPTS_GET)
    }

    pub fn cached_tools(&self) -> Vec<Tool> {
        self.inner.tools.list()
    }

    pub fn cached_tool(&self, name: &str) -> Option<Tool> {
        self.inner.tools.get(name)
    }

    pub fn cached_resources(&self) -> Vec<Resource> {
        self.inner.resources.list()
    }

    pub fn cached_prompts(&self) -> Vec<Prompt> {
        self.inner.prompts.list()
    }

    pub fn state(&self) -> HandshakeState {
        self.inner.handshake.state()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.handshake.is_ready()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.inner.handshake.peer().map(|p| p.implementation)
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.inner.handshake.peer().map(|p| p.capabilities)
    }

    pub fn stats(&self) -> ClientStats {
        self.inner.stats.read().clone()
    }

    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.inner.correlator.stats()
    }

    /// Close the session: pending calls fail with connection-closed
    pub async fn close(&self) -> MCPResult<()> {
        info!("Closing MCP client");
        self.inner.handshake.close();
        self.inner.tools.clear();
        self.inner.resources.clear();
        self.inner.prompts.clear();

        let result = self.inner.correlator.close().await;
        let incoming = self.inner.incoming_task.lock().take();
        if let Some(handle) = incoming {
            handle.abort();
        }
        result
    }

    fn base_meta(&self) -> Meta {
        match &self.inner.config.auth_token {
            Some(token) => Meta::default().with_auth_token(token.clone()),
            None => Meta::default(),
        }
    }

    fn new_request(&self, method: &str, params: Option<Value>) -> Message {
        let message = Message::request(method, params);
        if self.inner.config.auth_token.is_some() {
            message.with_meta(self.base_meta())
        } else {
            message
        }
    }

    /// Fail fast when the server did not advertise what `method` needs
    fn require_capability(&self, method: &str) -> MCPResult<()> {
        let Some(peer) = self.inner.handshake.peer() else {
            return Ok(());
        };
        let capabilities = &peer.capabilities;
        let supported = match method {
            methods::TOOLS_LIST | methods::TOOLS_CALL => capabilities.tools.is_some(),
            methods::RESOURCES_LIST | methods::RESOURCES_READ => capabilities.resources.is_some(),
            methods::RESOURCES_SUBSCRIBE | methods::RESOURCES_UNSUBSCRIBE => capabilities
                .resources
                .as_ref()
                .map_or(false, |r| r.subscribe),
            methods::PROMPTS_LIST | methods::PROMPTS_GET => capabilities.prompts.is_some(),
            _ => true,
        };
        if supported {
            Ok(())
        } else {
            Err(MCPError::method_disabled(method))
        }
    }

    async fn dispatch(&self, message: Message, cancel: CancellationToken) -> MCPResult<Value> {
        let method = message.method.clone().unwrap_or_default();
        let id = message.id.clone();
        self.inner.handshake.ensure_ready_for(&method)?;
        self.require_capability(&method)?;

        let start = Instant::now();
        let ctx = RequestContext::new(message).with_cancel(cancel);
        let result = (self.inner.chain)(ctx).await;
        self.inner.stats.write().update_request(&result, start.elapsed());

        if let (Err(MCPError::Cancelled), Some(request_id)) = (&result, id) {
            let params = CancelledParams {
                request_id,
                reason: Some("cancelled by caller".to_string()),
            };
            let sent = match serde_json::to_value(params) {
                Ok(params) => self.inner.correlator.notify(methods::CANCELLED, Some(params)).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                debug!("Could not announce cancellation of {}: {}", method, e);
            }
        }
        result
    }

    /// Wait until every peer message received so far has been handled
    async fn wait_incoming_drained(&self) {
        let stats = self.inner.correlator.stats();
        let target = stats.notifications_received + stats.requests_received;
        let mut processed = self.inner.processed.subscribe();
        let drained = processed.wait_for(|count| *count >= target);
        if tokio::time::timeout(self.inner.config.request_timeout, drained)
            .await
            .is_err()
        {
            warn!("Timed out waiting for pending notifications");
        }
    }

    async fn handle_incoming(&self, message: Message) {
        if message.is_request() {
            self.answer_peer_request(message).await;
            return;
        }

        self.inner.stats.write().update_notification();
        match message.method() {
            Some(methods::PROGRESS) => match message.params_as::<ProgressNotification>() {
                Ok(notification) => self.route_progress(notification),
                Err(e) => warn!("Malformed progress notification: {}", e),
            },
            Some(methods::RESOURCES_UPDATED) => match message.params_as::<ResourceUriParams>() {
                Ok(params) => {
                    let handlers = self.inner.resource_handlers.read().clone();
                    debug!("Resource updated: {}", params.uri);
                    for handler in handlers {
                        handler(params.uri.clone());
                    }
                }
                Err(e) => warn!("Malformed resource update: {}", e),
            },
            Some(methods::TOOLS_LIST_CHANGED) => self.spawn_refresh(methods::TOOLS_LIST),
            Some(methods::RESOURCES_LIST_CHANGED) => self.spawn_refresh(methods::RESOURCES_LIST),
            Some(methods::PROMPTS_LIST_CHANGED) => self.spawn_refresh(methods::PROMPTS_LIST),
            Some(other) => debug!("Ignoring notification: {}", other),
            None => {}
        }
    }

    fn route_progress(&self, notification: ProgressNotification) {
        let route = self
            .inner
            .progress_routes
            .read()
            .get(&notification.progress_token)
            .cloned()
            .or_else(|| self.inner.config.progress_handler.clone());
        match route {
            Some(handler) => handler(notification),
            None => debug!(
                "No handler for progress token {}",
                notification.progress_token
            ),
        }
    }

    fn spawn_refresh(&self, list_method: &'static str) {
        let client = self.clone();
        tokio::spawn(async move {
            let refreshed = match list_method {
                methods::TOOLS_LIST => client.list_tools().await.map(|_| ()),
                methods::RESOURCES_LIST => client.list_resources().await.map(|_| ()),
                _ => client.list_prompts().await.map(|_| ()),
            };
            if let Err(e) = refreshed {
                warn!("Failed to refresh after {} change: {}", list_method, e);
            }
        });
    }

    async fn answer_peer_request(&self, message: Message) {
        let response = match message.method() {
            Some(methods::PING) => Message::response(message.id.clone(), json!({})),
            other => Message::error_response(
                message.id.clone(),
                MCPError::method_not_found(other.unwrap_or_default()).to_protocol_error(),
            ),
        };
        if let Err(e) = self.inner.correlator.respond(response).await {
            warn!("Failed to answer server request: {}", e);
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

fn build_chain(config: &ClientConfig, correlator: Correlator) -> Handler {
    let mut chain = InterceptorChain::new();
    if let Some(metrics) = &config.metrics {
        chain.push(Arc::new(MetricsInterceptor::new(Arc::clone(metrics))));
    }
    let chain = chain.append(&config.interceptors);

    let timeout = config.request_timeout;
    chain.build(handler_fn(move |ctx: RequestContext| {
        let correlator = correlator.clone();
        async move {
            correlator
                .send_request(ctx.message, timeout, &ctx.cancel)
                .await
        }
    }))
}

async fn incoming_loop(inner: Weak<ClientInner>, mut incoming: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = incoming.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let client = Client { inner };
        client.handle_incoming(message).await;
        client.inner.processed.send_modify(|count| *count += 1);
    }
    debug!("Client incoming loop stopped");
}

fn parse_result<T: DeserializeOwned>(value: Value, method: &str) -> MCPResult<T> {
    serde_json::from_value(value)
        .map_err(|e| MCPError::serialization(format!("Invalid {} result: {}", method, e)))
}
