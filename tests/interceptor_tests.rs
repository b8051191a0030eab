//! Interceptor chain composition with the stock interceptors

use async_trait::async_trait;
use mcp_core::mcp::{
    handler_fn,
    interceptors::{
        AuthInterceptor, ErrorHandlingInterceptor, Identity, RateLimitInterceptor,
        StaticTokenResolver, ValidationInterceptor,
    },
    protocol::{Message, Meta},
    ErrorCode, Interceptor, InterceptorChain, MCPResult, Next, RequestContext,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

struct Recorder {
    name: &'static str,
    trace: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Interceptor for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn intercept(&self, ctx: RequestContext, next: Next) -> MCPResult<Value> {
        self.trace.lock().push(format!("{}:before", self.name));
        let result = next.run(ctx).await;
        self.trace.lock().push(format!("{}:after", self.name));
        result
    }
}

fn request_as(token: &str) -> RequestContext {
    RequestContext::new(
        Message::request("tools/list", None).with_meta(Meta::default().with_auth_token(token)),
    )
}

#[tokio::test]
async fn test_first_added_is_outermost() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let chain = InterceptorChain::new()
        .with(Recorder { name: "outer", trace: Arc::clone(&trace) })
        .with(Recorder { name: "inner", trace: Arc::clone(&trace) });
    assert_eq!(chain.names(), vec!["outer", "inner"]);

    let terminal_trace = Arc::clone(&trace);
    let handler = chain.build(handler_fn(move |_ctx| {
        let trace = Arc::clone(&terminal_trace);
        async move {
            trace.lock().push("handler".to_string());
            Ok(Value::Null)
        }
    }));
    handler(RequestContext::new(Message::request("ping", None)))
        .await
        .unwrap();

    assert_eq!(
        *trace.lock(),
        vec!["outer:before", "inner:before", "handler", "inner:after", "outer:after"]
    );

    println!("✓ Interceptors nest in insertion order");
}

#[tokio::test]
async fn test_rate_limit_keys_on_authenticated_subject() {
    let resolver = StaticTokenResolver::new()
        .with_token("alice-token", Identity::new("alice"))
        .with_token("bob-token", Identity::new("bob"));
    let handler = InterceptorChain::new()
        .with(ValidationInterceptor::new())
        .with(AuthInterceptor::new(resolver))
        .with(RateLimitInterceptor::new(1, Duration::from_secs(60)))
        .build(handler_fn(|ctx| async move {
            Ok(json!(ctx.identity.map(|identity| identity.subject)))
        }));

    assert_eq!(handler(request_as("alice-token")).await.unwrap(), json!("alice"));
    assert_eq!(handler(request_as("bob-token")).await.unwrap(), json!("bob"));

    let err = handler(request_as("alice-token")).await.unwrap_err();
    assert!(err.is(ErrorCode::RateLimited));

    let err = handler(request_as("mallory-token")).await.unwrap_err();
    assert!(err.is(ErrorCode::AuthFailed));

    println!("✓ Authenticated subjects get separate rate-limit windows");
}

#[test]
fn test_short_circuit_skips_inner_interceptors() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let handler = InterceptorChain::new()
        .with(ValidationInterceptor::new())
        .with(Recorder { name: "inner", trace: Arc::clone(&trace) })
        .with(ErrorHandlingInterceptor::new())
        .build(handler_fn(|_ctx| async { Ok(Value::Null) }));

    let err = tokio_test::block_on(handler(RequestContext::new(Message::notification(
        "tools/list",
        None,
    ))))
    .unwrap_err();

    assert!(err.is(ErrorCode::InvalidRequest));
    assert!(trace.lock().is_empty());

    println!("✓ A rejecting interceptor never reaches the inner chain");
}
