//! Request/response logging via `tracing`.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Interceptor, Next, RequestContext};
use crate::mcp::errors::{ErrorSeverity, MCPResult};

#[derive(Debug, Clone, Default)]
pub struct LoggingInterceptor {
    log_params: bool,
}

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log request params and results at debug level
    pub fn with_params(mut self) -> Self {
        self.log_params = true;
        self
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    async fn intercept(&self, ctx: RequestContext, next: Next) -> MCPResult<Value> {
        let method = ctx.method().to_string();
        let id = ctx
            .message
            .id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "notification".to_string());
        let received_at = ctx.received_at;

        if self.log_params {
            debug!(method = %method, id = %id, params = ?ctx.message.params, "Request");
        } else {
            debug!(method = %method, id = %id, "Request");
        }

        let result = next.run(ctx).await;
        let elapsed = format!("{:.2}ms", received_at.elapsed().as_secs_f64() * 1000.0);

        match &result {
            Ok(value) if self.log_params => {
                debug!(method = %method, id = %id, duration = %elapsed, result = ?value, "Request succeeded")
            }
            Ok(_) => debug!(method = %method, id = %id, duration = %elapsed, "Request succeeded"),
            Err(e) if e.severity() == ErrorSeverity::Low => debug!(
                method = %method,
                id = %id,
                error_code = e.code(),
                duration = %elapsed,
                "Request failed: {}", e
            ),
            Err(e) => warn!(
                method = %method,
                id = %id,
                error_code = e.code(),
                duration = %elapsed,
                "Request failed: {}", e
            ),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{
        errors::MCPError,
        interceptors::{handler_fn, InterceptorChain},
        protocol::Message,
    };

    #[tokio::test]
    async fn test_passes_result_through() {
        let handler = InterceptorChain::new()
            .with(LoggingInterceptor::new().with_params())
            .build(handler_fn(|_ctx| async { Ok(Value::Bool(true)) }));

        let result = handler(RequestContext::new(Message::request("ping", None)))
            .await
            .unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[tokio::test]
    async fn test_passes_error_through() {
        let handler = InterceptorChain::new()
            .with(LoggingInterceptor::new())
            .build(handler_fn(|_ctx| async { Err(MCPError::internal("boom")) }));

        let err = handler(RequestContext::new(Message::request("ping", None)))
            .await
            .unwrap_err();
        assert!(matches!(err, MCPError::Internal { .. }));
    }
}
