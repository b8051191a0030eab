//! Sliding-window rate limiting.
//!
//! Requests are keyed by the authenticated subject, falling back to the
//! transport origin and then to a shared anonymous bucket.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use super::{Interceptor, Next, RequestContext};
use crate::mcp::errors::{MCPError, MCPResult};

const ANONYMOUS: &str = "anonymous";

pub struct RateLimitInterceptor {
    max_requests: usize,
    window: Duration,
    windows: DashMap<String, VecDeque<Instant>>,
    last_sweep: Mutex<Instant>,
}

impl RateLimitInterceptor {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Requests per minute
    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    fn key_for(ctx: &RequestContext) -> String {
        ctx.identity
            .as_ref()
            .map(|identity| identity.subject.clone())
            .or_else(|| ctx.origin.clone())
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }

    /// Number of keys currently holding a window
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Drop keys whose newest request has left the window, at most once per window
    fn sweep(&self, now: Instant) {
        {
            let mut last_sweep = self.last_sweep.lock();
            if now.saturating_duration_since(*last_sweep) < self.window {
                return;
            }
            *last_sweep = now;
        }

        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window
                .back()
                .map_or(false, |newest| now.saturating_duration_since(*newest) < self.window)
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!("Dropped {} idle rate-limit window(s)", removed);
        }
    }

    /// Record one request for `key`, or report how long until a slot frees up
    fn admit(&self, key: &str, now: Instant) -> Result<(), Duration> {
        self.sweep(now);

        let mut window = self.windows.entry(key.to_string()).or_default();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests {
            let retry_after = window
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }

        window.push_back(now);
        Ok(())
    }
}

#[async_trait]
impl Interceptor for RateLimitInterceptor {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn intercept(&self, ctx: RequestContext, next: Next) -> MCPResult<Value> {
        let key = Self::key_for(&ctx);
        if let Err(retry_after) = self.admit(&key, Instant::now()) {
            warn!(key = %key, method = %ctx.method(), "Rate limit exceeded");
            return Err(MCPError::rate_limited(format!(
                "Rate limit of {} requests per {}s exceeded; retry in {}ms",
                self.max_requests,
                self.window.as_secs(),
                retry_after.as_millis()
            )));
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{
        errors::ErrorCode,
        interceptors::{handler_fn, Identity, InterceptorChain},
        protocol::Message,
    };

    fn request(subject: Option<&str>, origin: Option<&str>) -> RequestContext {
        let mut ctx = RequestContext::new(Message::request("tools/list", None));
        ctx.identity = subject.map(Identity::new);
        ctx.origin = origin.map(str::to_string);
        ctx
    }

    #[tokio::test]
    async fn test_limits_per_key() {
        let handler = InterceptorChain::new()
            .with(RateLimitInterceptor::per_minute(2))
            .build(handler_fn(|_ctx| async { Ok(Value::Null) }));

        assert!(handler(request(Some("alice"), None)).await.is_ok());
        assert!(handler(request(Some("alice"), None)).await.is_ok());
        let err = handler(request(Some("alice"), None)).await.unwrap_err();
        assert!(err.is(ErrorCode::RateLimited));

        // Separate buckets for another subject and for an origin.
        assert!(handler(request(Some("bob"), None)).await.is_ok());
        assert!(handler(request(None, Some("10.0.0.1"))).await.is_ok());
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimitInterceptor::new(1, Duration::from_millis(100));
        let start = Instant::now();

        assert!(limiter.admit("k", start).is_ok());
        let retry = limiter.admit("k", start + Duration::from_millis(40)).unwrap_err();
        assert_eq!(retry, Duration::from_millis(60));
        assert!(limiter.admit("k", start + Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_idle_keys_are_swept() {
        let limiter = RateLimitInterceptor::new(5, Duration::from_millis(100));
        let start = Instant::now();

        for session in ["session-a", "session-b", "session-c"] {
            assert!(limiter.admit(session, start).is_ok());
        }
        assert_eq!(limiter.tracked_keys(), 3);

        assert!(limiter.admit("session-d", start + Duration::from_millis(150)).is_ok());
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
