//! Interceptor chain.
//!
//! An interceptor wraps the rest of the chain: it may inspect or amend the
//! request context, short-circuit with an error, call through via [`Next`]
//! and observe the outcome. [`InterceptorChain::build`] folds the list from
//! last to first around a terminal handler, so the first interceptor added is
//! the outermost.
//!
//! The same chain type serves both sides: a server's terminal handler is its
//! method router, a client's terminal handler is the correlator.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use super::{
    errors::MCPResult,
    protocol::{Message, Meta},
};

pub mod auth;
pub mod error_handling;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod timeout;
pub mod validation;

pub use auth::{AuthInterceptor, Identity, StaticTokenResolver, TokenResolver};
pub use error_handling::ErrorHandlingInterceptor;
pub use logging::LoggingInterceptor;
pub use metrics::{InMemoryMetrics, MetricsInterceptor, MetricsSink, MetricsSnapshot};
pub use rate_limit::RateLimitInterceptor;
pub use timeout::TimeoutInterceptor;
pub use validation::ValidationInterceptor;

#[cfg(feature = "performance-monitoring")]
pub use metrics::FacadeMetrics;

/// Per-request state carried through the chain
pub struct RequestContext {
    /// The request being processed
    pub message: Message,
    /// Cancelled when the request is abandoned; handlers should observe it
    pub cancel: CancellationToken,
    /// Set by the authentication interceptor
    pub identity: Option<Identity>,
    /// Transport-level origin (peer address, session id), when known
    pub origin: Option<String>,
    pub received_at: Instant,
    metadata: HashMap<String, Value>,
}

impl RequestContext {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            cancel: CancellationToken::new(),
            identity: None,
            origin: None,
            received_at: Instant::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Method name, empty when the message carries none
    pub fn method(&self) -> &str {
        self.message.method().unwrap_or_default()
    }

    pub fn meta(&self) -> Option<&Meta> {
        self.message.meta.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Store data for interceptors further down the chain
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method())
            .field("id", &self.message.id)
            .field("identity", &self.identity)
            .field("origin", &self.origin)
            .finish()
    }
}

/// A fully built chain, or its terminal: request context in, result value out
pub type Handler = Arc<dyn Fn(RequestContext) -> BoxFuture<'static, MCPResult<Value>> + Send + Sync>;

/// Wrap an async function as a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MCPResult<Value>> + Send + 'static,
{
    Arc::new(move |ctx: RequestContext| Box::pin(f(ctx)) as BoxFuture<'static, MCPResult<Value>>)
}

/// The remainder of the chain. `run` consumes it, so an interceptor calls
/// through at most once.
pub struct Next {
    inner: Handler,
}

impl Next {
    pub async fn run(self, ctx: RequestContext) -> MCPResult<Value> {
        (self.inner)(ctx).await
    }
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn intercept(&self, ctx: RequestContext, next: Next) -> MCPResult<Value>;
}

/// Ordered list of interceptors
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; earlier ones wrap later ones
    pub fn with<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.push(Arc::new(interceptor));
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Append every interceptor of `other`, keeping its order
    pub fn append(mut self, other: &InterceptorChain) -> Self {
        self.interceptors
            .extend(other.interceptors.iter().cloned());
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.interceptors
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }

    /// Compose the chain around `terminal`
    pub fn build(&self, terminal: Handler) -> Handler {
        self.interceptors
            .iter()
            .rev()
            .fold(terminal, |next, interceptor| {
                let interceptor = Arc::clone(interceptor);
                let wrapped: Handler = Arc::new(move |ctx: RequestContext| {
                    let interceptor = Arc::clone(&interceptor);
                    let next = Next {
                        inner: Arc::clone(&next),
                    };
                    Box::pin(async move { interceptor.intercept(ctx, next).await })
                        as BoxFuture<'static, MCPResult<Value>>
                });
                wrapped
            })
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
