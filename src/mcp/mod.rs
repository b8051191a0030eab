//! Model Context Protocol (MCP) Implementation
//!
//! Key components:
//! - Protocol core with JSON-RPC 2.0 message handling and the error taxonomy
//! - Request/response correlation over a single transport
//! - Handshake state machine and capability negotiation
//! - Tool, resource and prompt registries with client-side mirrors
//! - Interceptor chain shared by client and server
//! - Progress tracking for long-running tool calls

pub mod client;
pub mod correlator;
pub mod errors;
pub mod handshake;
pub mod interceptors;
pub mod progress;
pub mod prompts;
pub mod protocol;
pub mod registry;
pub mod resources;
pub mod server;
pub mod tools;
pub mod transport;

pub use client::{Client, ClientConfig, ClientStats};
pub use correlator::{Correlator, CorrelatorStats};
pub use errors::{ErrorCategory, ErrorCode, ErrorSeverity, MCPError, MCPResult, RpcError};
pub use handshake::{Handshake, HandshakeState, PeerInfo};
pub use interceptors::{
    handler_fn, Handler, Interceptor, InterceptorChain, Next, RequestContext,
};
pub use progress::{ProgressNotification, ProgressReporter, ProgressSink, ProgressTracker};
pub use prompts::{Prompt, PromptHandler, PromptMessage, PromptRegistry, TemplatePrompt};
pub use protocol::{
    methods, Arguments, ClientCapabilities, Implementation, Message, MessageId, Meta,
    ProgressToken, ProtocolVersion, ServerCapabilities,
};
pub use resources::{
    FileResource, Resource, ResourceContents, ResourceHandler, ResourceRegistry, ResourceUri,
    TextResource,
};
pub use server::{Server, ServerConfig, ServerSession, ServerStats};
pub use tools::{
    CallScope, ParameterType, Tool, ToolContent, ToolHandler, ToolParameter, ToolRegistry,
    ToolResult,
};
pub use transport::{MCPTransport, MemoryTransport, TransportStats};
