//! Request/response correlation over one shared transport.
//!
//! A single reader task owns every `receive()` on the transport. Callers
//! register a pending record keyed by request id and wait on a one-shot
//! channel; the reader resolves the record when the matching response
//! arrives. Notifications and peer-initiated requests are forwarded, in
//! arrival order, to an unbounded incoming channel so the reader never
//! blocks on their consumers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    errors::{MCPError, MCPResult, RpcError},
    protocol::{Message, MessageId},
    transport::MCPTransport,
};

/// Sink for notifications and requests initiated by the peer
pub type IncomingSender = mpsc::UnboundedSender<Message>;

type Completion = oneshot::Sender<MCPResult<Message>>;

/// Correlator statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CorrelatorStats {
    /// Requests written to the transport
    pub requests_sent: u64,
    /// Responses delivered to a waiting caller
    pub responses_delivered: u64,
    /// Calls whose deadline elapsed
    pub timeouts: u64,
    /// Calls abandoned by their caller
    pub cancelled: u64,
    /// Responses with no waiting caller (late or unknown id)
    pub late_responses: u64,
    /// Notifications forwarded to the incoming sink
    pub notifications_received: u64,
    /// Peer requests forwarded to the incoming sink
    pub requests_received: u64,
    /// Inbound messages that could not be decoded or classified
    pub decode_errors: u64,
}

struct Shared {
    transport: Arc<dyn MCPTransport>,
    pending: Mutex<HashMap<MessageId, Completion>>,
    stats: Mutex<CorrelatorStats>,
    shutdown: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Route one inbound message; returns an error reply owed to the peer, if any
    fn dispatch(&self, message: Message, incoming: &IncomingSender) -> Option<Message> {
        if message.is_response() {
            let Some(id) = message.id.clone() else {
                warn!("Dropping response without id: {:?}", message.error);
                self.stats.lock().late_responses += 1;
                return None;
            };

            let completion = self.pending.lock().remove(&id);
            match completion {
                Some(completion) => {
                    if completion.send(Ok(message)).is_ok() {
                        self.stats.lock().responses_delivered += 1;
                    } else {
                        debug!("Caller for request {} went away before delivery", id);
                        self.stats.lock().late_responses += 1;
                    }
                }
                None => {
                    debug!("Dropping response for unknown or expired request {}", id);
                    self.stats.lock().late_responses += 1;
                }
            }
            return None;
        }

        if message.method.is_some() {
            {
                let mut stats = self.stats.lock();
                if message.is_request() {
                    stats.requests_received += 1;
                } else {
                    stats.notifications_received += 1;
                }
            }
            if incoming.send(message).is_err() {
                debug!("Incoming sink closed; dropping peer message");
            }
            return None;
        }

        warn!("Rejecting message that is neither request, notification nor response");
        self.stats.lock().decode_errors += 1;
        Some(Message::error_response(
            message.id,
            RpcError::invalid_request(Some(
                "Message must carry a method, a result or an error".to_string(),
            )),
        ))
    }

    /// Best-effort error reply written straight to the transport
    async fn reply(&self, message: Message) {
        if let Err(e) = self.transport.send(message).await {
            debug!("Could not deliver error reply: {}", e);
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<Completion> = self.pending.lock().drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            info!("Failing {} pending request(s): {}", drained.len(), reason);
        }
        for completion in drained {
            let _ = completion.send(Err(MCPError::connection_closed(reason)));
        }
    }
}

/// Removes a pending record when the waiting call ends for any reason
struct PendingGuard {
    shared: Arc<Shared>,
    id: MessageId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// Demultiplexes one transport into per-request completions and an incoming stream
#[derive(Clone)]
pub struct Correlator {
    shared: Arc<Shared>,
}

impl Correlator {
    /// Spawn the reader loop over `transport`
    pub fn start(transport: Arc<dyn MCPTransport>, incoming: IncomingSender) -> Self {
        let shared = Arc::new(Shared {
            transport,
            pending: Mutex::new(HashMap::new()),
            stats: Mutex::new(CorrelatorStats::default()),
            shutdown: CancellationToken::new(),
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(read_loop(Arc::clone(&shared), incoming));
        *shared.reader.lock() = Some(handle);

        Self { shared }
    }

    /// Send a request and wait for its result
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> MCPResult<serde_json::Value> {
        let message = Message::request(method, params);
        self.send_request(message, timeout, &CancellationToken::new())
            .await
    }

    /// Send a pre-built request and wait for its result.
    ///
    /// Cancelling `cancel`, or dropping the returned future, removes the
    /// pending record; the request already on the wire is not retracted.
    pub async fn send_request(
        &self,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> MCPResult<serde_json::Value> {
        if !message.is_request() {
            return Err(MCPError::invalid_request("Only requests can be correlated"));
        }
        let id = message
            .id
            .clone()
            .ok_or_else(|| MCPError::invalid_request("Request has no id"))?;

        if self.shared.shutdown.is_cancelled() {
            return Err(MCPError::connection_closed("Correlator is stopped"));
        }

        let (completion, receiver) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.contains_key(&id) {
                return Err(MCPError::invalid_request(format!(
                    "Request id {} is already in flight",
                    id
                )));
            }
            pending.insert(id.clone(), completion);
        }
        let _guard = PendingGuard {
            shared: Arc::clone(&self.shared),
            id: id.clone(),
        };

        let method = message.method.clone().unwrap_or_default();
        self.shared.transport.send(message).await?;
        self.shared.stats.lock().requests_sent += 1;
        debug!("Sent request {} ({})", id, method);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.shared.stats.lock().cancelled += 1;
                Err(MCPError::Cancelled)
            }
            received = tokio::time::timeout(timeout, receiver) => match received {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(MCPError::connection_closed("Correlator stopped")),
                Err(_) => {
                    self.shared.stats.lock().timeouts += 1;
                    warn!("Request {} ({}) timed out after {:?}", id, method, timeout);
                    Err(MCPError::timeout(timeout.as_millis() as u64))
                }
            },
        };

        outcome?.into_result()
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> MCPResult<()> {
        self.send(Message::notification(method, params)).await
    }

    /// Answer a peer request
    pub async fn respond(&self, message: Message) -> MCPResult<()> {
        if !message.is_response() {
            return Err(MCPError::invalid_request("Only responses can answer a request"));
        }
        self.send(message).await
    }

    /// Write any message (responses, pre-built notifications) to the transport
    pub async fn send(&self, message: Message) -> MCPResult<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(MCPError::connection_closed("Correlator is stopped"));
        }
        self.shared.transport.send(message).await
    }

    /// Number of calls currently waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn stats(&self) -> CorrelatorStats {
        self.shared.stats.lock().clone()
    }

    /// Whether the reader loop is still running
    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.is_cancelled()
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn MCPTransport> {
        &self.shared.transport
    }

    /// Stop the reader loop, fail pending calls and close the transport
    pub async fn close(&self) -> MCPResult<()> {
        self.shared.shutdown.cancel();
        let reader = self.shared.reader.lock().take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }
        self.shared.fail_pending("Connection closed");
        self.shared.transport.close().await
    }
}

async fn read_loop(shared: Arc<Shared>, incoming: IncomingSender) {
    debug!("Correlator reader started");
    loop {
        let received = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            received = shared.transport.receive() => received,
        };

        match received {
            Ok(message) => {
                if let Some(reply) = shared.dispatch(message, &incoming) {
                    shared.reply(reply).await;
                }
            }
            Err(e) if e.is_fatal_transport() => {
                warn!("Transport failed, stopping reader: {}", e);
                break;
            }
            Err(e) => {
                warn!("Rejecting undecodable inbound message: {}", e);
                shared.stats.lock().decode_errors += 1;
                // The request id is unknowable, so the reply carries a null id.
                shared
                    .reply(Message::error_response(None, e.to_protocol_error()))
                    .await;
            }
        }
    }

    shared.shutdown.cancel();
    shared.fail_pending("Connection closed");
    debug!("Correlator reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{errors::ErrorCode, transport::MemoryTransport};
    use serde_json::json;

    fn start_pair() -> (Correlator, MemoryTransport, mpsc::UnboundedReceiver<Message>) {
        let (local, remote) = MemoryTransport::pair();
        let (tx, rx) = mpsc::unbounded_channel();
        (Correlator::start(Arc::new(local), tx), remote, rx)
    }

    #[tokio::test]
    async fn test_call_resolves_with_result() {
        let (correlator, remote, _incoming) = start_pair();

        let peer = tokio::spawn(async move {
            let request = remote.receive().await.unwrap();
            remote
                .send(Message::response(request.id, json!({"ok": true})))
                .await
                .unwrap();
            remote
        });

        let result = correlator
            .call("ping", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(correlator.pending_count(), 0);
        let _ = peer.await;
    }

    #[tokio::test]
    async fn test_error_response_maps_to_rpc_error() {
        let (correlator, remote, _incoming) = start_pair();

        tokio::spawn(async move {
            let request = remote.receive().await.unwrap();
            remote
                .send(Message::error_response(
                    request.id,
                    crate::mcp::errors::RpcError::invalid_tool(None),
                ))
                .await
                .unwrap();
            remote
        });

        let err = correlator
            .call("tools/call", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::InvalidTool));
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_drops_late_response() {
        let (correlator, remote, _incoming) = start_pair();

        let err = correlator
            .call("slow", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::RequestFailed));
        assert_eq!(correlator.pending_count(), 0);

        let request = remote.receive().await.unwrap();
        remote
            .send(Message::response(request.id, json!("late")))
            .await
            .unwrap();

        // The reader keeps running and serves the next call.
        let peer = tokio::spawn(async move {
            let request = remote.receive().await.unwrap();
            remote
                .send(Message::response(request.id, json!("fresh")))
                .await
                .unwrap();
            remote
        });
        let result = correlator
            .call("fast", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!("fresh"));
        assert!(correlator.is_running());

        let stats = correlator.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.late_responses, 1);
        let _ = peer.await;
    }

    #[tokio::test]
    async fn test_notifications_reach_incoming_sink() {
        let (_correlator, remote, mut incoming) = start_pair();

        remote
            .send(Message::notification("notifications/progress", Some(json!({"progress": 0.5}))))
            .await
            .unwrap();

        let message = incoming.recv().await.unwrap();
        assert!(message.is_notification());
        assert_eq!(message.method(), Some("notifications/progress"));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_caller() {
        let (correlator, _remote, _incoming) = start_pair();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = correlator
            .send_request(Message::request("slow", None), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MCPError::Cancelled));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (correlator, _remote, _incoming) = start_pair();

        let waiting = correlator.clone();
        let call = tokio::spawn(async move {
            waiting.call("slow", None, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        correlator.close().await.unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, MCPError::ConnectionClosed { .. }));
        assert!(!correlator.is_running());
    }
}
