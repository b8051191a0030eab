//! Envelope validation.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{Interceptor, Next, RequestContext};
use crate::mcp::errors::{MCPError, MCPResult};

/// Rejects malformed envelopes before they reach a handler
#[derive(Debug, Clone, Default)]
pub struct ValidationInterceptor;

impl ValidationInterceptor {
    pub fn new() -> Self {
        Self
    }

    fn check(ctx: &RequestContext) -> MCPResult<()> {
        ctx.message.validate()?;
        if ctx.message.method.is_none() {
            return Err(MCPError::invalid_request("Request has no method"));
        }
        if ctx.message.id.is_none() {
            return Err(MCPError::invalid_request("Request has no id"));
        }
        Ok(())
    }
}

#[async_trait]
impl Interceptor for ValidationInterceptor {
    fn name(&self) -> &str {
        "validation"
    }

    async fn intercept(&self, ctx: RequestContext, next: Next) -> MCPResult<Value> {
        if let Err(e) = Self::check(&ctx) {
            debug!(method = %ctx.method(), "Rejecting invalid request: {}", e);
            return Err(e);
        }
        next.run(ctx).await
    }
}
