//! Converts panics and non-protocol failures into well-formed RPC errors.

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use std::{any::Any, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

use super::{Interceptor, Next, RequestContext};
use crate::mcp::errors::{ErrorCategory, MCPError, MCPResult};

#[derive(Debug, Clone, Default)]
pub struct ErrorHandlingInterceptor;

impl ErrorHandlingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Interceptor for ErrorHandlingInterceptor {
    fn name(&self) -> &str {
        "error_handling"
    }

    async fn intercept(&self, ctx: RequestContext, next: Next) -> MCPResult<Value> {
        let method = ctx.method().to_string();

        let error = match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(method = %method, "Handler panicked: {}", message);
                return Err(MCPError::internal(format!("Handler panicked: {}", message))
                    .to_protocol_error()
                    .into());
            }
        };

        match error.category() {
            ErrorCategory::Internal => error!(method = %method, "Internal error: {}", error),
            ErrorCategory::Transport => warn!(method = %method, "Transport error: {}", error),
            ErrorCategory::Protocol | ErrorCategory::Domain => {
                debug!(method = %method, code = error.code(), "Request rejected: {}", error)
            }
        }

        Err(MCPError::Rpc(error.to_protocol_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{
        errors::ErrorCode,
        interceptors::{handler_fn, InterceptorChain},
        protocol::Message,
    };

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let handler = InterceptorChain::new()
            .with(ErrorHandlingInterceptor::new())
            .build(handler_fn(|ctx| async move {
                if ctx.method() == "explode" {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            }));

        let err = handler(RequestContext::new(Message::request("explode", None)))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::InternalError));
        assert!(err.to_string().contains("kaboom"));
        assert!(matches!(err, MCPError::Rpc(_)));

        // The chain remains usable afterwards.
        assert!(handler(RequestContext::new(Message::request("fine", None)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_operational_errors_become_rpc_errors() {
        let handler = InterceptorChain::new()
            .with(ErrorHandlingInterceptor::new())
            .build(handler_fn(|_ctx| async { Err(MCPError::timeout(50)) }));

        let err = handler(RequestContext::new(Message::request("slow", None)))
            .await
            .unwrap_err();
        assert!(matches!(err, MCPError::Rpc(_)));
        assert!(err.is(ErrorCode::RequestFailed));
    }

    #[tokio::test]
    async fn test_protocol_errors_pass_unchanged() {
        let handler = InterceptorChain::new()
            .with(ErrorHandlingInterceptor::new())
            .build(handler_fn(|_ctx| async { Err(MCPError::invalid_tool("nope")) }));

        let err = handler(RequestContext::new(Message::request("tools/call", None)))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::InvalidTool));
        assert!(err.to_string().contains("nope"));
    }
}
