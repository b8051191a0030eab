//! Per-request deadline.
//!
//! Races the rest of the chain against a timer. On expiry the request's
//! cancellation token is cancelled and the downstream future is dropped, so
//! nothing keeps running on behalf of the abandoned request.

use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use tracing::warn;

use super::{Interceptor, Next, RequestContext};
use crate::mcp::errors::{MCPError, MCPResult};

#[derive(Debug, Clone)]
pub struct TimeoutInterceptor {
    default: Duration,
    per_method: HashMap<String, Duration>,
}

impl TimeoutInterceptor {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            per_method: HashMap::new(),
        }
    }

    /// Override the deadline for one method
    pub fn with_method(mut self, method: impl Into<String>, timeout: Duration) -> Self {
        self.per_method.insert(method.into(), timeout);
        self
    }

    pub fn timeout_for(&self, method: &str) -> Duration {
        self.per_method.get(method).copied().unwrap_or(self.default)
    }
}

#[async_trait]
impl Interceptor for TimeoutInterceptor {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn intercept(&self, ctx: RequestContext, next: Next) -> MCPResult<Value> {
        let limit = self.timeout_for(ctx.method());
        let cancel = ctx.cancel.clone();
        let method = ctx.method().to_string();

        let outcome = tokio::select! {
            result = next.run(ctx) => Some(result),
            _ = tokio::time::sleep(limit) => None,
        };

        match outcome {
            Some(result) => result,
            None => {
                cancel.cancel();
                warn!(method = %method, "Request timed out after {:?}", limit);
                Err(MCPError::timeout(limit.as_millis() as u64))
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
        protocol::Message,
    };
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_fast_request_completes() {
        let handler = InterceptorChain::new()
            .with(TimeoutInterceptor::new(Duration::from_secs(1)))
            .build(handler_fn(|_ctx| async { Ok(Value::Bool(true)) }));

        let result = handler(RequestContext::new(Message::request("ping", None)))
            .await
            .unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[tokio::test]
    async fn test_expiry_cancels_downstream() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let handler = InterceptorChain::new()
            .with(TimeoutInterceptor::new(Duration::from_secs(5)).with_method("slow", Duration::from_millis(20)))
            .build(handler_fn(move |_ctx| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }));

        let cancel = CancellationToken::new();
        let ctx = RequestContext::new(Message::request("slow", None)).with_cancel(cancel.clone());
        let err = handler(ctx).await.unwrap_err();

        assert!(err.is(ErrorCode::RequestFailed));
        assert!(cancel.is_cancelled());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
