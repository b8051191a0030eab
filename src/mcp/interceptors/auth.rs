//! Bearer-token authentication.
//!
//! The token travels in the request's `_meta.authToken`. Handshake methods
//! bypass the check.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, warn};

use super::{Interceptor, Next, RequestContext};
use crate::mcp::{
    errors::{MCPError, MCPResult},
    protocol::methods,
};

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            scopes: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Maps a bearer token to an identity. `Ok(None)` means the token is unknown.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> MCPResult<Option<Identity>>;
}

/// Fixed token table
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl TokenResolver for StaticTokenResolver {
    async fn resolve(&self, token: &str) -> MCPResult<Option<Identity>> {
        Ok(self.tokens.get(token).cloned())
    }
}

pub struct AuthInterceptor {
    resolver: Arc<dyn TokenResolver>,
    exempt: HashSet<String>,
}

impl AuthInterceptor {
    pub fn new<R: TokenResolver + 'static>(resolver: R) -> Self {
        Self::with_resolver(Arc::new(resolver))
    }

    pub fn with_resolver(resolver: Arc<dyn TokenResolver>) -> Self {
        let exempt = [methods::INITIALIZE, methods::PING]
            .iter()
            .map(|m| m.to_string())
            .collect();
        Self { resolver, exempt }
    }

    /// Let an additional method through without a token
    pub fn exempt(mut self, method: impl Into<String>) -> Self {
        self.exempt.insert(method.into());
        self
    }
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    fn name(&self) -> &str {
        "auth"
    }

    async fn intercept(&self, mut ctx: RequestContext, next: Next) -> MCPResult<Value> {
        if self.exempt.contains(ctx.method()) {
            return next.run(ctx).await;
        }

        let token = match ctx.meta().and_then(|meta| meta.auth_token()) {
            Some(token) => token.to_string(),
            None => {
                warn!(method = %ctx.method(), "Rejecting request without auth token");
                return Err(MCPError::auth_failed("Missing auth token"));
            }
        };

        match self.resolver.resolve(&token).await? {
            Some(identity) => {
                debug!(method = %ctx.method(), subject = %identity.subject, "Authenticated");
                ctx.identity = Some(identity);
                next.run(ctx).await
            }
            None => {
                warn!(method = %ctx.method(), "Rejecting request with unknown auth token");
                Err(MCPError::auth_failed("Invalid auth token"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{
        errors::ErrorCode,
        interceptors::{handler_fn, InterceptorChain},
        protocol::{Message, Meta},
    };
    use serde_json::json;

    fn whoami_chain(resolver: Arc<dyn TokenResolver>) -> super::super::Handler {
        InterceptorChain::new()
            .with(AuthInterceptor::with_resolver(resolver))
            .build(handler_fn(|ctx| async move {
                Ok(json!(ctx.identity.map(|i| i.subject)))
            }))
    }

    fn request_with_token(method: &str, token: &str) -> RequestContext {
        RequestContext::new(
            Message::request(method, None).with_meta(Meta::default().with_auth_token(token)),
        )
    }

    #[tokio::test]
    async fn test_static_resolver_attaches_identity() {
        let resolver = StaticTokenResolver::new().with_token("secret", Identity::new("alice"));
        let handler = whoami_chain(Arc::new(resolver));

        let result = handler(request_with_token("tools/list", "secret")).await.unwrap();
        assert_eq!(result, json!("alice"));

        let err = handler(request_with_token("tools/list", "wrong")).await.unwrap_err();
        assert!(err.is(ErrorCode::AuthFailed));
    }

    #[tokio::test]
    async fn test_missing_token_rejected_but_handshake_bypassed() {
        let handler = whoami_chain(Arc::new(StaticTokenResolver::new()));

        let err = handler(RequestContext::new(Message::request("tools/list", None)))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::AuthFailed));

        let result = handler(RequestContext::new(Message::request("ping", None)))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_resolver_called_with_token() {
        let mut resolver = MockTokenResolver::new();
        resolver
            .expect_resolve()
            .withf(|token| token == "abc")
            .times(1)
            .returning(|_| Ok(Some(Identity::new("bob").with_scope("tools"))));

        let handler = whoami_chain(Arc::new(resolver));
        let result = handler(request_with_token("tools/call", "abc")).await.unwrap();
        assert_eq!(result, json!("bob"));
    }

    #[tokio::test]
    async fn test_resolver_error_propagates() {
        let mut resolver = MockTokenResolver::new();
        resolver
            .expect_resolve()
            .returning(|_| Err(MCPError::internal("directory unavailable")));

        let handler = whoami_chain(Arc::new(resolver));
        let err = handler(request_with_token("tools/call", "abc")).await.unwrap_err();
        assert!(err.is(ErrorCode::InternalError));
    }
}
