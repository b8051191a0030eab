//! Registry and progress tracker tests

use mcp_core::mcp::{
    Arguments, CallScope, ErrorCode, MCPResult, ParameterType, ProgressNotification, ProgressReporter,
    ProgressToken, ProgressTracker, Tool, ToolParameter, ToolRegistry, ToolResult,
};
use parking_lot::Mutex;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

async fn echo(arguments: Arguments, _scope: CallScope) -> MCPResult<ToolResult> {
    let text = arguments["text"].as_str().unwrap_or_default().to_string();
    Ok(ToolResult::text(text))
}

fn echo_tool() -> Tool {
    Tool::new("echo", "Echo the input")
        .with_parameter(ToolParameter::new("text", ParameterType::String, true))
        .with_parameter(
            ToolParameter::new("times", ParameterType::Integer, false).with_range(Some(1.0), Some(3.0)),
        )
}

#[tokio::test]
async fn test_echo_tool() {
    let registry = ToolRegistry::new();
    registry.register(echo_tool(), echo).await;

    let mut arguments = Arguments::new();
    arguments.insert("text".to_string(), json!("hello"));
    let result = registry.call("echo", arguments).await.unwrap();
    assert_eq!(result.content[0].as_text(), Some("hello"));

    let err = registry.call("echo", Arguments::new()).await.unwrap_err();
    assert!(err.is(ErrorCode::InvalidParams));
    assert!(err.to_string().contains("'text'"));

    let schema = &registry.get("echo").await.unwrap().input_schema;
    assert_eq!(schema["required"], json!(["text"]));
    assert_eq!(schema["properties"]["times"]["minimum"], json!(1.0));

    let stats = registry.stats().await;
    assert_eq!(stats.total_executions, 1);
    assert_eq!(stats.executions_by_tool["echo"], 1);

    println!("✓ Echo tool validates and answers");
}

#[tokio::test]
async fn test_registry_lock_released_during_call() {
    let registry = Arc::new(ToolRegistry::new());
    let inner = Arc::clone(&registry);
    registry
        .register(
            Tool::new("reentrant", "Lists tools from inside a call"),
            move |_arguments: Arguments, _scope: CallScope| {
                let registry = Arc::clone(&inner);
                async move {
                    // Would deadlock if the read lock were still held by `call`.
                    registry.register(Tool::new("late", "Added mid-call"), echo).await;
                    Ok(ToolResult::text(registry.len().await.to_string()))
                }
            },
        )
        .await;

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        registry.call("reentrant", Arguments::new()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.content[0].as_text(), Some("2"));

    println!("✓ Handlers run without holding the registry lock");
}

#[test]
fn test_progress_lifecycle() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let tracker = Arc::new(ProgressTracker::with_sink(Arc::new(move |n: ProgressNotification| {
        sink.lock().push(n)
    })));
    let token = ProgressToken::from(42);

    let scope = tracker.start(&CancellationToken::new(), token.clone());
    let reporter = ProgressReporter::new(Arc::clone(&tracker), token.clone());
    reporter.report(0.25, Some(4.0)).unwrap();

    let err = reporter.report(1.5, None).unwrap_err();
    assert!(err.is(ErrorCode::InvalidParams));
    assert_eq!(tracker.get(&token).unwrap().progress, 0.25);

    tracker.complete(&token).unwrap();
    assert!(tracker.is_empty());
    let err = tracker.get(&token).unwrap_err();
    assert!(err.is(ErrorCode::InvalidRequest));
    assert!(!scope.is_cancelled());

    let progress: Vec<f64> = seen.lock().iter().map(|n| n.progress).collect();
    assert_eq!(progress, vec![0.25, 1.0]);

    let err = tracker.update(&token, 0.5, None).unwrap_err();
    assert!(err.is(ErrorCode::InvalidRequest));

    println!("✓ Progress start, update and complete behave as expected");
}

#[test]
fn test_progress_cancel_and_replace() {
    let tracker = ProgressTracker::new();
    let parent = CancellationToken::new();
    let token = ProgressToken::from("job");

    let first = tracker.start(&parent, token.clone());
    let second = tracker.start(&parent, token.clone());
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
    assert_eq!(tracker.len(), 1);

    tracker.cancel(&token).unwrap();
    assert!(second.is_cancelled());
    assert!(tracker.get(&token).is_err());

    let child = tracker.start(&parent, ProgressToken::from("other"));
    parent.cancel();
    assert!(child.is_cancelled());

    println!("✓ Progress scopes are cancelled on cancel, replace and parent cancel");
}
