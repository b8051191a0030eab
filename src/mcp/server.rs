//! MCP Server Implementation
//!
//! A [`Server`] owns the tool, resource and prompt registries and serves any
//! number of sessions, one per transport. Each session runs its own handshake,
//! correlator and interceptor chain; the chain's terminal handler is the
//! method router below.

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    correlator::{Correlator, CorrelatorStats},
    errors::{MCPError, MCPResult, RpcError},
    handshake::{Handshake, HandshakeState, PeerInfo},
    interceptors::{
        handler_fn, ErrorHandlingInterceptor, Handler, Interceptor, InterceptorChain,
        MetricsInterceptor, MetricsSink, RequestContext,
    },
    progress::{ProgressNotification, ProgressReporter, ProgressSink, ProgressTracker},
    prompts::{GetPromptParams, ListPromptsResult, PromptRegistry},
    protocol::{
        methods, CancelledParams, ClientCapabilities, Implementation, InitializeParams,
        InitializeResult, Message, MessageId, ProgressToken, PromptsCapability,
        ProtocolVersion, ResourcesCapability, ServerCapabilities, ToolsCapability,
    },
    resources::{ListResourcesResult, ReadResourceResult, ResourceRegistry, ResourceUriParams},
    tools::{CallScope, CallToolParams, ListToolsResult, ToolRegistry},
    transport::MCPTransport,
};

/// MCP server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Server information
    pub server_info: Implementation,
    /// Capabilities advertised at handshake
    pub capabilities: ServerCapabilities,
    /// Free-form usage notes returned from `initialize`
    pub instructions: Option<String>,
    /// Deadline for requests the server sends to its clients
    pub request_timeout: Duration,
    /// Server-side interceptors, outermost first
    pub interceptors: InterceptorChain,
    /// Request metrics sink; installs an outermost metrics interceptor
    pub metrics: Option<Arc<dyn MetricsSink>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_info: Implementation::new("mcp-core-server", env!("CARGO_PKG_VERSION")),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                resources: Some(ResourcesCapability {
                    subscribe: true,
                    list_changed: true,
                }),
                prompts: Some(PromptsCapability { list_changed: true }),
                logging: None,
            },
            instructions: None,
            request_timeout: Duration::from_secs(30),
            interceptors: InterceptorChain::new(),
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(server_info: Implementation) -> Self {
        Self {
            server_info,
            ..Self::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_interceptor<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors = self.interceptors.with(interceptor);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_info", &self.server_info)
            .field("capabilities", &self.capabilities)
            .field("request_timeout", &self.request_timeout)
            .field("interceptors", &self.interceptors)
            .finish()
    }
}

/// Server statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ServerStats {
    /// Total sessions served
    pub total_connections: u64,
    /// Currently open sessions
    pub active_connections: u64,
    /// Total requests processed
    pub requests_processed: u64,
    /// Successful requests
    pub successful_requests: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Requests abandoned by their client
    pub cancelled_requests: u64,
    /// Average request processing time
    pub average_request_time: Duration,
    /// Last activity timestamp
    pub last_activity: Option<DateTime<Utc>>,
    /// Requests by method
    pub requests_by_method: HashMap<String, u64>,
}

impl ServerStats {
    /// Update request statistics
    pub fn update_request(&mut self, method: &str, success: bool, processing_time: Duration) {
        self.requests_processed += 1;

        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        let total_time = self.average_request_time.as_nanos() as u64 * (self.requests_processed - 1)
            + processing_time.as_nanos() as u64;
        self.average_request_time = Duration::from_nanos(total_time / self.requests_processed);

        *self.requests_by_method.entry(method.to_string()).or_insert(0) += 1;
        self.last_activity = Some(Utc::now());
    }

    /// Update connection statistics
    pub fn update_connection(&mut self, connected: bool) {
        if connected {
            self.total_connections += 1;
            self.active_connections += 1;
        } else if self.active_connections > 0 {
            self.active_connections -= 1;
        }
    }

    /// Get success rate
    pub fn success_rate(&self) -> f64 {
        if self.requests_processed == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.requests_processed as f64
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    tools: ToolRegistry,
    resources: ResourceRegistry,
    prompts: PromptRegistry,
    sessions: DashMap<String, Weak<SessionShared>>,
    stats: RwLock<ServerStats>,
}

impl ServerInner {
    fn live_sessions(&self) -> Vec<Arc<SessionShared>> {
        self.sessions.retain(|_, session| session.strong_count() > 0);
        self.sessions
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }
}

/// MCP server
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                tools: ToolRegistry::new(),
                resources: ResourceRegistry::new(),
                prompts: PromptRegistry::new(),
                sessions: DashMap::new(),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.inner.resources
    }

    pub fn prompts(&self) -> &PromptRegistry {
        &self.inner.prompts
    }

    /// Start a session over `transport`. Must be called within a Tokio runtime.
    pub fn serve(&self, transport: Arc<dyn MCPTransport>) -> ServerSession {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let correlator = Correlator::start(transport, incoming_tx);
        let id = uuid::Uuid::new_v4().to_string();

        let sink_tx = outbound_tx.clone();
        let sink: ProgressSink = Arc::new(move |notification: ProgressNotification| {
            match serde_json::to_value(&notification) {
                Ok(params) => {
                    let _ = sink_tx.send(Message::notification(methods::PROGRESS, Some(params)));
                }
                Err(e) => warn!("Failed to encode progress notification: {}", e),
            }
        });

        let server = Arc::clone(&self.inner);
        let shared = Arc::new_cyclic(|weak: &Weak<SessionShared>| SessionShared {
            id: id.clone(),
            chain: build_chain(&server.config, weak.clone()),
            server,
            handshake: Handshake::new(),
            correlator: correlator.clone(),
            outbound: outbound_tx,
            progress: Arc::new(ProgressTracker::with_sink(sink)),
            subscriptions: DashSet::new(),
            in_flight: DashMap::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            connected_at: Utc::now(),
        });

        self.inner.sessions.insert(id.clone(), Arc::downgrade(&shared));
        self.inner.stats.write().update_connection(true);
        info!("MCP session {} opened", id);

        tokio::spawn(write_loop(correlator, outbound_rx));
        tokio::spawn(session_loop(Arc::clone(&shared), incoming_rx));

        ServerSession { shared }
    }

    /// Send `notifications/resources/updated` to every ready session
    /// subscribed to `uri`; returns how many were notified
    pub fn notify_resource_updated(&self, uri: &str) -> usize {
        let params = ResourceUriParams {
            uri: uri.to_string(),
        };
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                warn!("Failed to encode resource update: {}", e);
                return 0;
            }
        };

        let mut notified = 0;
        for session in self.inner.live_sessions() {
            if session.handshake.is_ready() && session.subscriptions.contains(uri) {
                session.send(Message::notification(
                    methods::RESOURCES_UPDATED,
                    Some(params.clone()),
                ));
                notified += 1;
            }
        }
        debug!("Resource {} updated; notified {} session(s)", uri, notified);
        notified
    }

    /// Announce a tool catalog change, if `listChanged` is advertised
    pub fn notify_tools_list_changed(&self) -> usize {
        let enabled = self
            .inner
            .config
            .capabilities
            .tools
            .as_ref()
            .map_or(false, |c| c.list_changed);
        self.broadcast_if(enabled, methods::TOOLS_LIST_CHANGED)
    }

    /// Announce a resource catalog change, if `listChanged` is advertised
    pub fn notify_resources_list_changed(&self) -> usize {
        let enabled = self
            .inner
            .config
            .capabilities
            .resources
            .as_ref()
            .map_or(false, |c| c.list_changed);
        self.broadcast_if(enabled, methods::RESOURCES_LIST_CHANGED)
    }

    /// Announce a prompt catalog change, if `listChanged` is advertised
    pub fn notify_prompts_list_changed(&self) -> usize {
        let enabled = self
            .inner
            .config
            .capabilities
            .prompts
            .as_ref()
            .map_or(false, |c| c.list_changed);
        self.broadcast_if(enabled, methods::PROMPTS_LIST_CHANGED)
    }

    fn broadcast_if(&self, enabled: bool, method: &str) -> usize {
        if !enabled {
            return 0;
        }
        let mut notified = 0;
        for session in self.inner.live_sessions() {
            if session.handshake.is_ready() {
                session.send(Message::notification(method, None));
                notified += 1;
            }
        }
        notified
    }

    /// Sessions that are still open
    pub fn sessions(&self) -> Vec<ServerSession> {
        self.inner
            .live_sessions()
            .into_iter()
            .filter(|shared| !shared.closed.load(Ordering::SeqCst))
            .map(|shared| ServerSession { shared })
            .collect()
    }

    pub fn stats(&self) -> ServerStats {
        self.inner.stats.read().clone()
    }

    /// Close every open session
    pub async fn shutdown(&self) {
        let sessions = self.sessions();
        info!("Shutting down MCP server ({} session(s))", sessions.len());
        for session in sessions {
            if let Err(e) = session.close().await {
                debug!("Session {} closed with error: {}", session.id(), e);
            }
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

struct SessionShared {
    id: String,
    server: Arc<ServerInner>,
    handshake: Handshake<ClientCapabilities>,
    correlator: Correlator,
    /// Single ordered path to the transport for responses and notifications
    outbound: mpsc::UnboundedSender<Message>,
    progress: Arc<ProgressTracker>,
    subscriptions: DashSet<String>,
    in_flight: DashMap<MessageId, CancellationToken>,
    chain: Handler,
    shutdown: CancellationToken,
    closed: AtomicBool,
    connected_at: DateTime<Utc>,
}

impl SessionShared {
    fn send(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            debug!("Session {} writer stopped; dropping message", self.id);
        }
    }

    async fn handle_request(&self, message: Message) {
        let id = message.id.clone();
        let method = message.method.clone().unwrap_or_default();
        let start = Instant::now();

        let outcome = match self.handshake.ensure_ready_for(&method) {
            Err(e) => Err(e),
            Ok(()) => {
                let cancel = self.shutdown.child_token();
                if let Some(id) = &id {
                    match self.in_flight.entry(id.clone()) {
                        Entry::Occupied(_) => {
                            warn!("Session {} reused in-flight request id {}", self.id, id);
                            self.server
                                .stats
                                .write()
                                .update_request(&method, false, start.elapsed());
                            self.send(Message::error_response(
                                Some(id.clone()),
                                RpcError::invalid_request(Some(format!(
                                    "Request id {} is already in flight",
                                    id
                                ))),
                            ));
                            return;
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(cancel.clone());
                        }
                    }
                }
                let ctx = RequestContext::new(message)
                    .with_cancel(cancel)
                    .with_origin(self.id.clone());
                let result = (self.chain)(ctx).await;

                let abandoned = id
                    .as_ref()
                    .map_or(false, |id| self.in_flight.remove(id).is_none());
                if abandoned {
                    debug!("Request {} ({}) cancelled by client; no response sent", method, self.id);
                    self.server.stats.write().cancelled_requests += 1;
                    return;
                }
                result
            }
        };

        self.server
            .stats
            .write()
            .update_request(&method, outcome.is_ok(), start.elapsed());

        let response = match outcome {
            Ok(result) => Message::response(id, result),
            Err(e) => Message::error_response(id, e.to_protocol_error()),
        };
        self.send(response);
    }

    fn handle_notification(&self, message: Message) {
        match message.method() {
            Some(methods::INITIALIZED) => match self.handshake.complete() {
                Ok(()) => info!("MCP session {} ready", self.id),
                Err(e) => warn!("Unexpected initialized notification on {}: {}", self.id, e),
            },
            Some(methods::CANCELLED) => match message.params_as::<CancelledParams>() {
                Ok(params) => {
                    if let Some((_, token)) = self.in_flight.remove(&params.request_id) {
                        debug!(
                            "Client cancelled request {}: {}",
                            params.request_id,
                            params.reason.as_deref().unwrap_or("no reason given")
                        );
                        token.cancel();
                    }
                }
                Err(e) => warn!("Malformed cancellation: {}", e),
            },
            Some(other) => debug!("Ignoring notification: {}", other),
            None => {}
        }
    }

    async fn route(&self, ctx: RequestContext) -> MCPResult<Value> {
        let method = ctx.method().to_string();
        let capabilities = &self.server.config.capabilities;

        match method.as_str() {
            methods::INITIALIZE => self.initialize(&ctx.message),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => {
                require(capabilities.tools.is_some(), &method)?;
                let tools = self.server.tools.list().await;
                Ok(serde_json::to_value(ListToolsResult { tools })?)
            }
            methods::TOOLS_CALL => {
                require(capabilities.tools.is_some(), &method)?;
                self.call_tool(ctx).await
            }
            methods::RESOURCES_LIST => {
                require(capabilities.resources.is_some(), &method)?;
                let resources = self.server.resources.list().await;
                Ok(serde_json::to_value(ListResourcesResult { resources })?)
            }
            methods::RESOURCES_READ => {
                require(capabilities.resources.is_some(), &method)?;
                let params: ResourceUriParams = ctx.message.params_as()?;
                let contents = self.server.resources.read(&params.uri).await?;
                Ok(serde_json::to_value(ReadResourceResult { contents })?)
            }
            methods::RESOURCES_SUBSCRIBE => {
                require(
                    capabilities.resources.as_ref().map_or(false, |r| r.subscribe),
                    &method,
                )?;
                let params: ResourceUriParams = ctx.message.params_as()?;
                self.server.resources.validate(&params.uri).await?;
                debug!("Session {} subscribed to {}", self.id, params.uri);
                self.subscriptions.insert(params.uri);
                Ok(json!({}))
            }
            methods::RESOURCES_UNSUBSCRIBE => {
                require(
                    capabilities.resources.as_ref().map_or(false, |r| r.subscribe),
                    &method,
                )?;
                let params: ResourceUriParams = ctx.message.params_as()?;
                self.subscriptions.remove(&params.uri);
                Ok(json!({}))
            }
            methods::PROMPTS_LIST => {
                require(capabilities.prompts.is_some(), &method)?;
                let prompts = self.server.prompts.list().await;
                Ok(serde_json::to_value(ListPromptsResult { prompts })?)
            }
            methods::PROMPTS_GET => {
                require(capabilities.prompts.is_some(), &method)?;
                let params: GetPromptParams = ctx.message.params_as()?;
                let result = self
                    .server
                    .prompts
                    .render(&params.name, params.arguments)
                    .await?;
                Ok(serde_json::to_value(result)?)
            }
            other => Err(MCPError::method_not_found(other)),
        }
    }

    fn initialize(&self, message: &Message) -> MCPResult<Value> {
        self.handshake.begin()?;

        let params: InitializeParams = match message.params_as() {
            Ok(params) => params,
            Err(e) => {
                let _ = self.handshake.fail(e.to_string());
                return Err(e);
            }
        };

        let version = ProtocolVersion::negotiate(&params.protocol_version);
        if version != params.protocol_version {
            debug!(
                "Client requested protocol {}; answering with {}",
                params.protocol_version, version
            );
        }
        info!(
            "Session {} initializing: client {} {}",
            self.id, params.client_info.name, params.client_info.version
        );
        self.handshake.record_peer(PeerInfo {
            implementation: params.client_info,
            capabilities: params.capabilities,
            protocol_version: version,
        })?;

        let config = &self.server.config;
        let result = InitializeResult {
            protocol_version: version,
            capabilities: config.capabilities.clone(),
            server_info: config.server_info.clone(),
            instructions: config.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn call_tool(&self, ctx: RequestContext) -> MCPResult<Value> {
        let params: CallToolParams = ctx.message.params_as()?;

        let mut scope = CallScope::new(ctx.cancel.clone()).with_identity(ctx.identity.clone());
        let mut progress = None;
        if let Some(token) = ctx.message.progress_token().cloned() {
            let cancel = self.progress.start(&ctx.cancel, token.clone());
            scope.cancel = cancel;
            scope.progress = Some(ProgressReporter::new(Arc::clone(&self.progress), token.clone()));
            progress = Some(ProgressScope {
                tracker: Arc::clone(&self.progress),
                token: Some(token),
            });
        }

        let result = self
            .server
            .tools
            .call_with_scope(&params.name, params.arguments, scope)
            .await?;

        if let Some(progress) = progress.as_mut() {
            progress.complete();
        }
        Ok(serde_json::to_value(result)?)
    }

    fn finish(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handshake.close();
        self.shutdown.cancel();
        self.in_flight.clear();
        self.subscriptions.clear();
        self.server.sessions.remove(&self.id);
        self.server.stats.write().update_connection(false);
        info!("MCP session {} closed", self.id);
    }
}

/// Stops tracking a progress token when the call ends; a call that did not
/// complete normally cancels its record
struct ProgressScope {
    tracker: Arc<ProgressTracker>,
    token: Option<ProgressToken>,
}

impl ProgressScope {
    fn complete(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.tracker.complete(&token) {
                debug!("Progress {} already finished: {}", token, e);
            }
        }
    }
}

impl Drop for ProgressScope {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let _ = self.tracker.cancel(&token);
        }
    }
}

/// One client connection served by a [`Server`]
#[derive(Clone)]
pub struct ServerSession {
    shared: Arc<SessionShared>,
}

impl ServerSession {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> HandshakeState {
        self.shared.handshake.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.handshake.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.shared.handshake.peer().map(|p| p.implementation)
    }

    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.shared.handshake.peer().map(|p| p.capabilities)
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.shared.handshake.peer().map(|p| p.protocol_version)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.shared.connected_at
    }

    /// URIs this session is subscribed to
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared
            .subscriptions
            .iter()
            .map(|uri| uri.key().clone())
            .collect()
    }

    /// Number of requests currently being handled
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.shared.progress)
    }

    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.shared.correlator.stats()
    }

    /// Ping the client
    pub async fn ping(&self) -> MCPResult<()> {
        let timeout = self.shared.server.config.request_timeout;
        self.shared
            .correlator
            .call(methods::PING, None, timeout)
            .await
            .map(|_| ())
    }

    /// Close the session and its transport; in-flight handlers are cancelled
    pub async fn close(&self) -> MCPResult<()> {
        self.shared.finish();
        self.shared.correlator.close().await
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

fn require(supported: bool, method: &str) -> MCPResult<()> {
    if supported {
        Ok(())
    } else {
        Err(MCPError::method_not_found(method))
    }
}

fn build_chain(config: &ServerConfig, session: Weak<SessionShared>) -> Handler {
    let mut chain = InterceptorChain::new();
    if let Some(metrics) = &config.metrics {
        chain.push(Arc::new(MetricsInterceptor::new(Arc::clone(metrics))));
    }
    let chain = chain
        .append(&config.interceptors)
        .with(ErrorHandlingInterceptor::new());

    chain.build(handler_fn(move |ctx: RequestContext| {
        let session = session.clone();
        async move {
            match session.upgrade() {
                Some(session) => session.route(ctx).await,
                None => Err(MCPError::connection_closed("Session closed")),
            }
        }
    }))
}

async fn write_loop(correlator: Correlator, mut outbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = correlator.send(message).await {
            if e.is_fatal_transport() {
                debug!("Session writer stopping: {}", e);
                break;
            }
            warn!("Failed to send message: {}", e);
        }
    }
}

async fn session_loop(session: Arc<SessionShared>, mut incoming: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = incoming.recv().await {
        if message.is_request() {
            // Handled inline so `notifications/initialized` is seen after it.
            if message.method() == Some(methods::INITIALIZE) {
                session.handle_request(message).await;
            } else {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.handle_request(message).await });
            }
        } else {
            session.handle_notification(message);
        }
    }
    session.finish();
}
