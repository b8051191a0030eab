//! Request metrics.
//!
//! The interceptor reports to a [`MetricsSink`]. [`InMemoryMetrics`] keeps
//! counters in-process; with the `performance-monitoring` feature,
//! `FacadeMetrics` forwards to the `metrics` crate recorder instead.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use super::{Interceptor, Next, RequestContext};
use crate::mcp::errors::MCPResult;

/// Destination for request metrics. Calls must not block.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, method: &str);

    /// `error_code` is `None` on success
    fn record_response(&self, method: &str, duration: Duration, error_code: Option<i32>);
}

/// Per-method counters
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodStats {
    pub requests: u64,
    pub errors: u64,
    pub total_duration: Duration,
}

/// Point-in-time copy of [`InMemoryMetrics`]
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_requests: usize,
    pub average_duration: Duration,
    pub by_method: HashMap<String, MethodStats>,
    pub errors_by_code: HashMap<i32, u64>,
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    active_requests: AtomicUsize,
    total_duration_us: AtomicU64,
    by_method: DashMap<String, MethodStats>,
    errors_by_code: DashMap<i32, u64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.successful_requests.load(Ordering::Relaxed)
            + self.failed_requests.load(Ordering::Relaxed);
        let average_duration = if completed == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.total_duration_us.load(Ordering::Relaxed) / completed)
        };

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            average_duration,
            by_method: self
                .by_method
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            errors_by_code: self
                .errors_by_code
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
        }
    }

    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.total_duration_us.store(0, Ordering::Relaxed);
        self.by_method.clear();
        self.errors_by_code.clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_request(&self, method: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        self.by_method.entry(method.to_string()).or_default().requests += 1;
    }

    fn record_response(&self, method: &str, duration: Duration, error_code: Option<i32>) {
        let _ = self
            .active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.total_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        {
            let mut stats = self.by_method.entry(method.to_string()).or_default();
            stats.total_duration += duration;
            if error_code.is_some() {
                stats.errors += 1;
            }
        }

        match error_code {
            None => {
                self.successful_requests.fetch_add(1, Ordering::Relaxed);
            }
            Some(code) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                *self.errors_by_code.entry(code).or_insert(0) += 1;
            }
        }
    }
}

/// Forwards to the global `metrics` recorder
#[cfg(feature = "performance-monitoring")]
#[derive(Debug, Clone, Default)]
pub struct FacadeMetrics;

#[cfg(feature = "performance-monitoring")]
impl MetricsSink for FacadeMetrics {
    fn record_request(&self, method: &str) {
        metrics::counter!("mcp_requests_total", "method" => method.to_string()).increment(1);
        metrics::gauge!("mcp_requests_active").increment(1.0);
    }

    fn record_response(&self, method: &str, duration: Duration, error_code: Option<i32>) {
        metrics::gauge!("mcp_requests_active").decrement(1.0);
        metrics::histogram!("mcp_request_duration_seconds", "method" => method.to_string())
            .record(duration.as_secs_f64());
        if let Some(code) = error_code {
            metrics::counter!(
                "mcp_request_errors_total",
                "method" => method.to_string(),
                "code" => code.to_string()
            )
            .increment(1);
        }
    }
}

pub struct MetricsInterceptor {
    sink: Arc<dyn MetricsSink>,
}

impl MetricsInterceptor {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn intercept(&self, ctx: RequestContext, next: Next) -> MCPResult<Value> {
        let method = ctx.method().to_string();
        let received_at = ctx.received_at;
        self.sink.record_request(&method);

        let result = next.run(ctx).await;
        let error_code = result.as_ref().err().map(|e| e.code());
        self.sink
            .record_response(&method, received_at.elapsed(), error_code);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{
        errors::{ErrorCode, MCPError},
        interceptors::{handler_fn, InterceptorChain},
        protocol::Message,
    };

    #[tokio::test]
    async fn test_counts_success_and_failure() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let handler = InterceptorChain::new()
            .with(MetricsInterceptor::new(metrics.clone()))
            .build(handler_fn(|ctx| async move {
                if ctx.method() == "fail" {
                    Err(MCPError::invalid_tool("x"))
                } else {
                    Ok(Value::Null)
                }
            }));

        handler(RequestContext::new(Message::request("ok", None))).await.unwrap();
        handler(RequestContext::new(Message::request("ok", None))).await.unwrap();
        handler(RequestContext::new(Message::request("fail", None))).await.unwrap_err();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.active_requests, 0);
        assert_eq!(snapshot.by_method["ok"].requests, 2);
        assert_eq!(snapshot.by_method["fail"].errors, 1);
        assert_eq!(snapshot.errors_by_code[&ErrorCode::InvalidTool.code()], 1);

        metrics.reset();
        assert_eq!(metrics.snapshot().total_requests, 0);
    }
}
