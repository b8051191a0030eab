//! MCP Transport Layer
//!
//! The contract every transport fulfils, plus an in-process loopback used for
//! embedding and tests. Stream, SSE and WebSocket transports live outside
//! this crate and plug in through [`MCPTransport`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    errors::{MCPError, MCPResult},
    protocol::Message,
};

/// Transport statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TransportStats {
    /// Total messages sent
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Last activity timestamp
    pub last_activity: Option<DateTime<Utc>>,
}

impl TransportStats {
    /// Update statistics for sent message
    pub fn update_sent(&mut self, message_size: usize) {
        self.messages_sent += 1;
        self.bytes_sent += message_size as u64;
        self.last_activity = Some(Utc::now());
    }

    /// Update statistics for received message
    pub fn update_received(&mut self, message_size: usize) {
        self.messages_received += 1;
        self.bytes_received += message_size as u64;
        self.last_activity = Some(Utc::now());
    }
}

/// MCP transport trait.
///
/// Implementations must preserve message order per direction. All methods
/// take `&self`: one reader task calls `receive` while any number of callers
/// `send` concurrently. Dropping a pending `receive` future cancels it.
#[async_trait]
pub trait MCPTransport: Send + Sync {
    /// Send a message
    async fn send(&self, message: Message) -> MCPResult<()>;

    /// Receive the next message, waiting until one arrives
    async fn receive(&self) -> MCPResult<Message>;

    /// Close the transport; pending and later receives fail
    async fn close(&self) -> MCPResult<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;
}

/// In-process transport carrying JSON text over channels.
///
/// Each message is encoded on `send` and decoded on `receive`, so the wire
/// codec is exercised exactly as with a byte-stream transport.
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
    stats: RwLock<TransportStats>,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let left = Self {
            outbound: a_tx,
            inbound: Mutex::new(b_rx),
            closed: closed.clone(),
            stats: RwLock::new(TransportStats::default()),
        };
        let right = Self {
            outbound: b_tx,
            inbound: Mutex::new(a_rx),
            closed,
            stats: RwLock::new(TransportStats::default()),
        };
        (left, right)
    }

    /// Push raw text to the peer, bypassing the encoder
    pub fn send_raw(&self, text: impl Into<String>) -> MCPResult<()> {
        self.outbound
            .send(text.into())
            .map_err(|_| MCPError::connection_closed("Peer dropped"))
    }

    /// Get transport statistics
    pub fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }
}

#[async_trait]
impl MCPTransport for MemoryTransport {
    async fn send(&self, message: Message) -> MCPResult<()> {
        if !self.is_connected() {
            return Err(MCPError::connection_closed("Transport closed"));
        }

        let json = message.to_json()?;
        let size = json.len();
        self.outbound
            .send(json)
            .map_err(|_| MCPError::connection_closed("Peer dropped"))?;
        self.stats.write().update_sent(size);
        Ok(())
    }

    async fn receive(&self) -> MCPResult<Message> {
        let text = {
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                _ = self.closed.cancelled() => {
                    return Err(MCPError::connection_closed("Transport closed"));
                }
                text = inbound.recv() => text,
            }
        };

        match text {
            Some(text) => {
                self.stats.write().update_received(text.len());
                Message::from_json(&text)
            }
            None => Err(MCPError::connection_closed("Peer dropped")),
        }
    }

    async fn close(&self) -> MCPResult<()> {
        if !self.closed.is_cancelled() {
            debug!("Memory transport closed");
            self.closed.cancel();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && !self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryTransport::pair();

        for n in 0..3 {
            a.send(Message::notification("n", Some(json!(n)))).await.unwrap();
        }

        for n in 0..3 {
            let message = b.receive().await.unwrap();
            assert_eq!(message.params, Some(json!(n)));
        }

        assert_eq!(a.stats().messages_sent, 3);
        assert_eq!(b.stats().messages_received, 3);
    }

    #[tokio::test]
    async fn test_malformed_text_is_a_parse_error() {
        let (a, b) = MemoryTransport::pair();
        a.send_raw("{not json").unwrap();

        let err = b.receive().await.unwrap_err();
        assert!(err.is(crate::mcp::errors::ErrorCode::ParseError));
        assert!(!err.is_fatal_transport());
    }

    #[tokio::test]
    async fn test_close_disconnects_both_ends() {
        let (a, b) = MemoryTransport::pair();
        a.close().await.unwrap();

        assert!(!a.is_connected());
        assert!(!b.is_connected());
        assert!(a.send(Message::notification("n", None)).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_fails_once_peer_dropped() {
        let (a, b) = MemoryTransport::pair();
        drop(a);

        let err = b.receive().await.unwrap_err();
        assert!(err.is_fatal_transport());
    }
}
